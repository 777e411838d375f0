use std::{fmt, ops::Range};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ConfigurationError;

/// Index of a launched worker process, `0..process_count`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ProcessIndex(pub usize);

/// Fleet-wide device identity, `0..total_devices`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GlobalOrdinal(pub usize);

/// Device slot inside one worker process, `0..devices_per_process`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LocalOrdinal(pub usize);

macro_rules! index_newtype {
    ($name:ident) => {
        impl $name {
            pub fn get(self) -> usize {
                self.0
            }
        }

        impl From<usize> for $name {
            fn from(value: usize) -> Self {
                Self(value)
            }
        }

        impl From<$name> for usize {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

index_newtype!(ProcessIndex);
index_newtype!(GlobalOrdinal);
index_newtype!(LocalOrdinal);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrdinalError {
    #[error("{what} {value} is out of range, expected a value in [0, {bound})")]
    OutOfRange {
        what: &'static str,
        value: usize,
        bound: usize,
    },
}

/// The declared shape of a fleet: `process_count` workers with
/// `devices_per_process` device slots each.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "TopologyShape")]
pub struct Topology {
    process_count: usize,
    devices_per_process: usize,
}

#[derive(Deserialize)]
struct TopologyShape {
    process_count: usize,
    devices_per_process: usize,
}

impl TryFrom<TopologyShape> for Topology {
    type Error = ConfigurationError;

    fn try_from(shape: TopologyShape) -> Result<Self, Self::Error> {
        Topology::new(shape.process_count, shape.devices_per_process)
    }
}

impl Topology {
    pub fn new(
        process_count: usize,
        devices_per_process: usize,
    ) -> Result<Self, ConfigurationError> {
        if process_count == 0 {
            return Err(ConfigurationError::InvalidProcessCount(0));
        }
        if devices_per_process == 0 {
            return Err(ConfigurationError::InvalidDeviceCount(0));
        }
        if process_count.checked_mul(devices_per_process).is_none() {
            return Err(ConfigurationError::TopologyTooLarge {
                process_count: process_count as u128,
                devices_per_process: devices_per_process as u128,
            });
        }
        Ok(Self {
            process_count,
            devices_per_process,
        })
    }

    /// A single process owning a single device.
    pub fn single() -> Self {
        Self {
            process_count: 1,
            devices_per_process: 1,
        }
    }

    pub fn process_count(&self) -> usize {
        self.process_count
    }

    pub fn devices_per_process(&self) -> usize {
        self.devices_per_process
    }

    /// Cannot overflow: [`Topology::new`] rejects shapes whose product does.
    pub fn total_devices(&self) -> usize {
        self.process_count * self.devices_per_process
    }

    pub fn registry(&self) -> OrdinalRegistry {
        OrdinalRegistry::new(*self)
    }

    pub fn processes(&self) -> impl Iterator<Item = ProcessIndex> {
        (0..self.process_count).map(ProcessIndex)
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} process(es) x {} device(s)",
            self.process_count, self.devices_per_process
        )
    }
}

/// Maps `(process index, local slot)` to global ordinals and back.
///
/// Every lookup is a pure function of the [`Topology`], so a registry can be
/// copied into each worker and queried without any coordination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrdinalRegistry {
    topology: Topology,
}

impl OrdinalRegistry {
    pub fn new(topology: Topology) -> Self {
        Self { topology }
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn global_ordinal(
        &self,
        process_index: ProcessIndex,
        local_ordinal: LocalOrdinal,
    ) -> Result<GlobalOrdinal, OrdinalError> {
        self.check_process(process_index)?;
        check("local ordinal", local_ordinal.0, self.topology.devices_per_process)?;
        Ok(GlobalOrdinal(
            process_index.0 * self.topology.devices_per_process + local_ordinal.0,
        ))
    }

    pub fn process_index_of(&self, global: GlobalOrdinal) -> Result<ProcessIndex, OrdinalError> {
        self.check_global(global)?;
        Ok(ProcessIndex(global.0 / self.topology.devices_per_process))
    }

    pub fn local_ordinal_of(&self, global: GlobalOrdinal) -> Result<LocalOrdinal, OrdinalError> {
        self.check_global(global)?;
        Ok(LocalOrdinal(global.0 % self.topology.devices_per_process))
    }

    /// Global ordinals owned by `process_index`, ascending.
    pub fn ordinals_of(
        &self,
        process_index: ProcessIndex,
    ) -> Result<impl Iterator<Item = GlobalOrdinal>, OrdinalError> {
        self.check_process(process_index)?;
        let start = process_index.0 * self.topology.devices_per_process;
        let range: Range<usize> = start..start + self.topology.devices_per_process;
        Ok(range.map(GlobalOrdinal))
    }

    fn check_process(&self, process_index: ProcessIndex) -> Result<(), OrdinalError> {
        check("process index", process_index.0, self.topology.process_count)
    }

    fn check_global(&self, global: GlobalOrdinal) -> Result<(), OrdinalError> {
        check("global ordinal", global.0, self.topology.total_devices())
    }
}

fn check(what: &'static str, value: usize, bound: usize) -> Result<(), OrdinalError> {
    if value < bound {
        Ok(())
    } else {
        Err(OrdinalError::OutOfRange { what, value, bound })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn test_topology_rejects_empty_dimensions() {
        assert!(matches!(
            Topology::new(0, 4),
            Err(ConfigurationError::InvalidProcessCount(0))
        ));
        assert!(matches!(
            Topology::new(2, 0),
            Err(ConfigurationError::InvalidDeviceCount(0))
        ));
        assert_eq!(Topology::new(3, 4).unwrap().total_devices(), 12);
    }

    #[test]
    fn test_deserialized_topology_is_validated() {
        let topology: Topology =
            serde_json::from_str(r#"{"process_count":2,"devices_per_process":3}"#).unwrap();
        assert_eq!(topology, Topology::new(2, 3).unwrap());
        assert!(
            serde_json::from_str::<Topology>(r#"{"process_count":0,"devices_per_process":3}"#)
                .is_err()
        );
    }

    #[test]
    fn test_topology_rejects_overflowing_shapes() {
        assert!(matches!(
            Topology::new(usize::MAX / 2, 3),
            Err(ConfigurationError::TopologyTooLarge { .. })
        ));
        assert_eq!(
            Topology::new(usize::MAX, 1).unwrap().total_devices(),
            usize::MAX
        );
    }

    #[test]
    fn test_global_ordinal_is_a_bijection() {
        for (p, d) in [(1, 1), (1, 4), (4, 1), (3, 5)] {
            let registry = Topology::new(p, d).unwrap().registry();
            let mut seen = BTreeSet::new();
            for process in 0..p {
                for local in 0..d {
                    let global = registry
                        .global_ordinal(ProcessIndex(process), LocalOrdinal(local))
                        .unwrap();
                    assert!(seen.insert(global), "ordinal {global} assigned twice");
                    assert_eq!(registry.process_index_of(global).unwrap(), ProcessIndex(process));
                    assert_eq!(registry.local_ordinal_of(global).unwrap(), LocalOrdinal(local));
                }
            }
            assert_eq!(seen, (0..p * d).map(GlobalOrdinal).collect::<BTreeSet<_>>());
        }
    }

    #[test]
    fn test_out_of_range_lookups() {
        let registry = Topology::new(2, 3).unwrap().registry();
        assert_eq!(
            registry.global_ordinal(ProcessIndex(2), LocalOrdinal(0)),
            Err(OrdinalError::OutOfRange {
                what: "process index",
                value: 2,
                bound: 2
            })
        );
        assert_eq!(
            registry.global_ordinal(ProcessIndex(0), LocalOrdinal(3)),
            Err(OrdinalError::OutOfRange {
                what: "local ordinal",
                value: 3,
                bound: 3
            })
        );
        assert!(registry.process_index_of(GlobalOrdinal(6)).is_err());
        assert!(registry.local_ordinal_of(GlobalOrdinal(6)).is_err());
        assert!(registry.ordinals_of(ProcessIndex(5)).is_err());
    }

    #[test]
    fn test_ordinals_of_process() {
        let registry = Topology::new(3, 2).unwrap().registry();
        let owned: Vec<_> = registry.ordinals_of(ProcessIndex(1)).unwrap().collect();
        assert_eq!(owned, vec![GlobalOrdinal(2), GlobalOrdinal(3)]);
    }
}
