use spmd_core::FailureKind;
use thiserror::Error;

use crate::{CollectiveFailure, CollectiveFailureKind};

#[derive(Error, Debug)]
pub enum CollectiveError {
    #[error("collective #{seq} timed out: {detail}")]
    Timeout { seq: u64, detail: String },

    #[error("collective #{seq} mismatch: {detail}")]
    Mismatch { seq: u64, detail: String },

    #[error("collective #{seq} aborted: {detail}")]
    Aborted { seq: u64, detail: String },

    #[error("rendezvous rejected this worker: {0}")]
    Rejected(String),

    #[error("value at index {index} cannot be reduced exactly in its element type")]
    Unrepresentable { index: usize },

    #[error("unexpected {got} message from rendezvous, expected {expected}")]
    Protocol {
        expected: &'static str,
        got: &'static str,
    },

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("rendezvous transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("failed to encode or decode collective payload: {0}")]
    Codec(#[from] postcard::Error),
}

impl CollectiveError {
    pub(crate) fn from_failure(seq: u64, failure: CollectiveFailure) -> Self {
        let CollectiveFailure { kind, detail } = failure;
        match kind {
            CollectiveFailureKind::Timeout => CollectiveError::Timeout { seq, detail },
            CollectiveFailureKind::Mismatch => CollectiveError::Mismatch { seq, detail },
            CollectiveFailureKind::Aborted => CollectiveError::Aborted { seq, detail },
        }
    }

    /// How a worker that failed with this error is reported to the launcher.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            CollectiveError::Timeout { .. } => FailureKind::CollectiveTimeout,
            CollectiveError::Mismatch { .. } | CollectiveError::Unrepresentable { .. } => {
                FailureKind::CollectiveMismatch
            }
            CollectiveError::Aborted { .. } => FailureKind::CollectiveAborted,
            CollectiveError::Rejected(_)
            | CollectiveError::Protocol { .. }
            | CollectiveError::FrameTooLarge(_)
            | CollectiveError::Transport(_)
            | CollectiveError::Codec(_) => FailureKind::Disconnected,
        }
    }
}
