mod aggregate;
mod device;
mod ordinal;
mod rate;

pub use aggregate::{
    AggregateError, AggregatedResult, FailureKind, ResultAggregator, WorkerFailure, WorkerResult,
};
pub use device::{
    resolve_topology, ConfigurationError, Device, DeviceConfig, DeviceKind, DeviceLayout,
    ExecutionEngine, HostEngine, ASYNC_CLIENT_ENV, DEVICE_KIND_ENV, NUM_PROCESSES_ENV,
};
pub use ordinal::{
    GlobalOrdinal, LocalOrdinal, OrdinalError, OrdinalRegistry, ProcessIndex, Topology,
};
pub use rate::{RateSample, RateTracker, DEFAULT_RATE_HORIZON};
