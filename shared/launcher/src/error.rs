use std::{io, time::Duration};

use spmd_core::{AggregateError, ConfigurationError, GlobalOrdinal, ProcessIndex, WorkerFailure};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("invalid launch configuration: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("{0}")]
    Worker(WorkerFailure),

    #[error("job did not finish within {0:?}")]
    LaunchTimeout(Duration),

    #[error("this worker was spawned for job '{found}' but reached job '{expected}'")]
    JobMismatch { expected: String, found: String },

    #[error("invalid worker environment: {0}")]
    WorkerEnv(#[from] serde_json::Error),

    #[error("failed to spawn worker process {process_index}: {source}")]
    Spawn {
        process_index: ProcessIndex,
        #[source]
        source: io::Error,
    },

    #[error("rendezvous failed: {0}")]
    Transport(#[from] io::Error),

    #[error("failed to decode the result of process {process_index} ordinal {global_ordinal}: {source}")]
    Decode {
        process_index: ProcessIndex,
        global_ordinal: GlobalOrdinal,
        #[source]
        source: postcard::Error,
    },

    #[error(transparent)]
    Aggregate(AggregateError),
}

impl From<AggregateError> for LaunchError {
    fn from(err: AggregateError) -> Self {
        match err {
            AggregateError::Worker(failure) => LaunchError::Worker(failure),
            other => LaunchError::Aggregate(other),
        }
    }
}

impl LaunchError {
    /// The attributed worker failure, if this error is one.
    pub fn worker_failure(&self) -> Option<&WorkerFailure> {
        match self {
            LaunchError::Worker(failure) => Some(failure),
            _ => None,
        }
    }
}
