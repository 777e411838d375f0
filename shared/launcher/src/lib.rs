mod config;
mod context;
mod error;
mod launcher;
mod spawn;
mod worker;

pub use config::{
    Isolation, LaunchArgs, LaunchConfig, WorkerEnv, COLLECTIVE_TIMEOUT_ENV,
    DEFAULT_COLLECTIVE_TIMEOUT, DEFAULT_JOB_TIMEOUT, DEFAULT_SHUTDOWN_GRACE, JOB_TIMEOUT_ENV,
    WORKER_ENV,
};
pub use context::WorkerContext;
pub use error::LaunchError;
pub use launcher::Launcher;

pub use spmd_collective::{CollectiveChannel, CollectiveError};
pub use spmd_core::{
    AggregatedResult, Device, DeviceConfig, DeviceKind, DeviceLayout, ExecutionEngine,
    FailureKind, GlobalOrdinal, HostEngine, LocalOrdinal, ProcessIndex, RateTracker, Topology,
    WorkerFailure,
};
