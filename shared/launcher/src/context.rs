use std::fmt::Display;

use spmd_collective::{CollectiveChannel, SlotIdentity};
use spmd_core::{Device, DeviceLayout, GlobalOrdinal, LocalOrdinal, ProcessIndex, Topology};
use tracing::info;

/// What one invocation of the user function knows about itself and the fleet.
///
/// Handed to the user function by reference; each device slot gets its own.
pub struct WorkerContext {
    identity: SlotIdentity,
    layout: DeviceLayout,
    device: Device,
    channel: CollectiveChannel,
}

impl WorkerContext {
    pub(crate) fn new(layout: DeviceLayout, device: Device, channel: CollectiveChannel) -> Self {
        Self {
            identity: channel.identity(),
            layout,
            device,
            channel,
        }
    }

    pub fn process_index(&self) -> ProcessIndex {
        self.identity.process_index
    }

    pub fn global_ordinal(&self) -> GlobalOrdinal {
        self.identity.global_ordinal
    }

    pub fn local_ordinal(&self) -> LocalOrdinal {
        self.identity.local_ordinal
    }

    pub fn world_size(&self) -> usize {
        self.identity.world_size
    }

    pub fn topology(&self) -> Topology {
        self.layout.topology
    }

    pub fn layout(&self) -> DeviceLayout {
        self.layout
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Global ordinal 0.
    pub fn is_master(&self) -> bool {
        self.identity.is_master()
    }

    /// Local ordinal 0 of this process.
    pub fn is_local_master(&self) -> bool {
        self.identity.local_ordinal == LocalOrdinal(0)
    }

    pub fn collective(&self) -> &CollectiveChannel {
        &self.channel
    }

    /// Log `message` once per fleet, from the master ordinal only.
    pub fn master_info(&self, message: impl Display) {
        if self.is_master() {
            info!(process = %self.process_index(), ordinal = %self.global_ordinal(), "{message}");
        }
    }
}
