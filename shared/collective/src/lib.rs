mod channel;
mod error;
mod frame;
mod protocol;
mod server;

pub use channel::CollectiveChannel;
pub use error::CollectiveError;
pub use frame::{read_frame, write_frame, MAX_FRAME_LEN};
pub use protocol::{
    CollectiveFailure, CollectiveFailureKind, CollectiveReply, CollectiveRequest, ReduceValues,
    ServerMessage, SlotIdentity, WorkerMessage,
};
pub use server::{FleetEvent, RendezvousConfig, RendezvousServer};
