use std::fmt;

use serde::{Deserialize, Serialize};
use spmd_core::{GlobalOrdinal, LocalOrdinal, ProcessIndex, WorkerFailure};

/// Who is on the other end of a rendezvous connection: one device slot.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotIdentity {
    pub process_index: ProcessIndex,
    pub global_ordinal: GlobalOrdinal,
    pub local_ordinal: LocalOrdinal,
    pub world_size: usize,
}

impl SlotIdentity {
    pub fn is_master(&self) -> bool {
        self.global_ordinal == GlobalOrdinal(0)
    }
}

impl fmt::Display for SlotIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "process {} ordinal {} (local {})",
            self.process_index, self.global_ordinal, self.local_ordinal
        )
    }
}

/// All-reduce operands. Integers travel and sum as `i128` so that no value
/// passes through a lossy float.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ReduceValues {
    Float(Vec<f64>),
    Integer(Vec<i128>),
}

impl ReduceValues {
    pub fn len(&self) -> usize {
        match self {
            ReduceValues::Float(values) => values.len(),
            ReduceValues::Integer(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ReduceValues::Float(..) => "float",
            ReduceValues::Integer(..) => "integer",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum CollectiveRequest {
    /// Only the master slot carries a value.
    Broadcast { value: Option<Vec<u8>> },
    /// Float sums are scaled by the rendezvous; integer sums are returned
    /// unscaled and scaled by each slot.
    AllReduceSum { values: ReduceValues, scale: f64 },
    MeshReduce { key: String, value: Vec<u8> },
    Barrier { tag: String },
}

impl CollectiveRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            CollectiveRequest::Broadcast { .. } => "broadcast",
            CollectiveRequest::AllReduceSum { .. } => "all_reduce_sum",
            CollectiveRequest::MeshReduce { .. } => "mesh_reduce",
            CollectiveRequest::Barrier { .. } => "barrier",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectiveFailureKind {
    Timeout,
    Mismatch,
    Aborted,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CollectiveFailure {
    pub kind: CollectiveFailureKind,
    pub detail: String,
}

impl CollectiveFailure {
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self {
            kind: CollectiveFailureKind::Timeout,
            detail: detail.into(),
        }
    }

    pub fn mismatch(detail: impl Into<String>) -> Self {
        Self {
            kind: CollectiveFailureKind::Mismatch,
            detail: detail.into(),
        }
    }

    pub fn aborted(detail: impl Into<String>) -> Self {
        Self {
            kind: CollectiveFailureKind::Aborted,
            detail: detail.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum CollectiveReply {
    Broadcast(Vec<u8>),
    Reduced(ReduceValues),
    /// Every slot's value, ascending by global ordinal.
    Gathered(Vec<Vec<u8>>),
    Released,
    Failed(CollectiveFailure),
}

impl CollectiveReply {
    pub fn kind(&self) -> &'static str {
        match self {
            CollectiveReply::Broadcast(..) => "broadcast",
            CollectiveReply::Reduced(..) => "reduced",
            CollectiveReply::Gathered(..) => "gathered",
            CollectiveReply::Released => "released",
            CollectiveReply::Failed(..) => "failed",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum WorkerMessage {
    Hello { job: String, identity: SlotIdentity },
    /// `seq` counts this slot's collective calls, starting at 0.
    Collective { seq: u64, request: CollectiveRequest },
    /// The slot's serialized return value, or why it has none.
    Report { outcome: Result<Vec<u8>, WorkerFailure> },
}

impl WorkerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Hello { .. } => "hello",
            WorkerMessage::Collective { .. } => "collective",
            WorkerMessage::Report { .. } => "report",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ServerMessage {
    Welcome,
    Rejected { reason: String },
    Collective { seq: u64, reply: CollectiveReply },
    Ack,
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Welcome => "welcome",
            ServerMessage::Rejected { .. } => "rejected",
            ServerMessage::Collective { .. } => "collective",
            ServerMessage::Ack => "ack",
        }
    }
}
