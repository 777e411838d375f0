use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{LocalOrdinal, Topology};

/// Selects the accelerator family to enumerate.
pub const DEVICE_KIND_ENV: &str = "SPMD_DEVICE";
/// Number of worker processes in the fleet.
pub const NUM_PROCESSES_ENV: &str = "SPMD_NUM_PROCESSES";
/// Whether device clients initialize asynchronously.
pub const ASYNC_CLIENT_ENV: &str = "SPMD_ASYNC_CLIENT";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("invalid device kind '{0}'. Available kinds are: {1}")]
    UnknownDeviceKind(String, String),

    #[error("device count must be positive, got {0}")]
    InvalidDeviceCount(i64),

    #[error("process count must be positive, got {0}")]
    InvalidProcessCount(i64),

    #[error("invalid value for {key}: '{value}'")]
    Unparsable { key: String, value: String },

    #[error("topology of {process_count} x {devices_per_process} devices is too large")]
    TopologyTooLarge {
        process_count: u128,
        devices_per_process: u128,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Tpu,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 3] = [DeviceKind::Cpu, DeviceKind::Gpu, DeviceKind::Tpu];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Gpu => "gpu",
            DeviceKind::Tpu => "tpu",
        }
    }

    /// Environment key holding the per-process device count for this kind,
    /// e.g. `CPU_NUM_DEVICES`.
    pub fn num_devices_env(&self) -> String {
        format!("{}_NUM_DEVICES", self.as_str().to_uppercase())
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn available_kinds() -> String {
    DeviceKind::ALL
        .iter()
        .map(|kind| kind.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl FromStr for DeviceKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cpu" => Ok(DeviceKind::Cpu),
            "gpu" | "cuda" => Ok(DeviceKind::Gpu),
            "tpu" => Ok(DeviceKind::Tpu),
            other => Err(ConfigurationError::UnknownDeviceKind(
                other.to_string(),
                available_kinds(),
            )),
        }
    }
}

/// A device as seen from inside one worker process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    pub kind: DeviceKind,
    pub index: LocalOrdinal,
}

impl Device {
    pub fn new(kind: DeviceKind, index: LocalOrdinal) -> Self {
        Self { kind, index }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.index)
    }
}

/// The device-kernel execution engine, as far as the harness needs to know it.
pub trait ExecutionEngine: Send + Sync {
    fn default_kind(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    /// Devices per process reported when no override is configured.
    fn default_device_count(&self, _kind: DeviceKind) -> usize {
        1
    }

    /// Select and activate `device` for the calling slot.
    fn bind(&self, device: &Device, async_client: bool) -> anyhow::Result<()>;
}

/// Engine for host-only runs: one device of each kind, binding is a no-op.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostEngine;

impl ExecutionEngine for HostEngine {
    fn bind(&self, device: &Device, async_client: bool) -> anyhow::Result<()> {
        debug!(device = %device, async_client, "bound host device");
        Ok(())
    }
}

/// Raw device configuration, before validation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_kind: Option<String>,
    pub device_count_override: Option<i64>,
    /// `<KIND>_NUM_DEVICES` values read while the kind was still unknown.
    /// Only the entry for the resolved kind applies.
    pub kind_device_counts: BTreeMap<DeviceKind, i64>,
    pub process_count: Option<i64>,
    pub async_client: bool,
}

impl DeviceConfig {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key/value source.
    ///
    /// The device count key depends on the selected kind, so an unknown kind
    /// fails here before any count is read.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let device_kind = lookup(DEVICE_KIND_ENV).filter(|s| !s.trim().is_empty());
        let mut kind_device_counts = BTreeMap::new();
        let device_count_override = match &device_kind {
            Some(kind) => {
                let kind: DeviceKind = kind.parse()?;
                parse_int(&lookup, &kind.num_devices_env())?
            }
            None => {
                for kind in DeviceKind::ALL {
                    if let Some(count) = parse_int(&lookup, &kind.num_devices_env())? {
                        kind_device_counts.insert(kind, count);
                    }
                }
                None
            }
        };
        let process_count = parse_int(&lookup, NUM_PROCESSES_ENV)?;
        let async_client = lookup(ASYNC_CLIENT_ENV)
            .map(|value| parse_flag(ASYNC_CLIENT_ENV, &value))
            .transpose()?
            .unwrap_or(false);

        Ok(Self {
            device_kind,
            device_count_override,
            kind_device_counts,
            process_count,
            async_client,
        })
    }

    pub fn with_device_kind(mut self, kind: impl Into<String>) -> Self {
        self.device_kind = Some(kind.into());
        self
    }

    pub fn with_device_count(mut self, count: i64) -> Self {
        self.device_count_override = Some(count);
        self
    }

    pub fn with_process_count(mut self, count: i64) -> Self {
        self.process_count = Some(count);
        self
    }

    pub fn with_async_client(mut self, async_client: bool) -> Self {
        self.async_client = async_client;
        self
    }
}

fn parse_int<F>(lookup: &F, key: &str) -> Result<Option<i64>, ConfigurationError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse::<i64>()
                .map_err(|_| ConfigurationError::Unparsable {
                    key: key.to_string(),
                    value,
                })
        })
        .transpose()
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigurationError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigurationError::Unparsable {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Everything a worker needs to know about the fleet's devices. Resolved once
/// at launch and copied into every worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLayout {
    pub kind: DeviceKind,
    pub topology: Topology,
    pub async_client: bool,
}

impl DeviceLayout {
    pub fn device(&self, local: LocalOrdinal) -> Device {
        Device::new(self.kind, local)
    }
}

/// Resolve the fleet topology from configuration, falling back to the
/// engine's defaults for anything not overridden.
pub fn resolve_topology(
    config: &DeviceConfig,
    engine: &dyn ExecutionEngine,
) -> Result<DeviceLayout, ConfigurationError> {
    let kind = match &config.device_kind {
        Some(kind) => kind.parse()?,
        None => engine.default_kind(),
    };

    let device_count = config
        .device_count_override
        .or_else(|| config.kind_device_counts.get(&kind).copied());
    // widened so that no count is truncated before the size check
    let devices_per_process: u128 = match device_count {
        Some(count) if count <= 0 => return Err(ConfigurationError::InvalidDeviceCount(count)),
        Some(count) => count as u128,
        None => match engine.default_device_count(kind) {
            0 => return Err(ConfigurationError::InvalidDeviceCount(0)),
            count => count as u128,
        },
    };

    let process_count: u128 = match config.process_count {
        Some(count) if count <= 0 => return Err(ConfigurationError::InvalidProcessCount(count)),
        Some(count) => count as u128,
        None => 1,
    };

    let topology = match (
        usize::try_from(process_count),
        usize::try_from(devices_per_process),
    ) {
        (Ok(process_count), Ok(devices_per_process)) => {
            Topology::new(process_count, devices_per_process)?
        }
        _ => {
            return Err(ConfigurationError::TopologyTooLarge {
                process_count,
                devices_per_process,
            })
        }
    };
    debug!(%kind, %topology, async_client = config.async_client, "resolved topology");

    Ok(DeviceLayout {
        kind,
        topology,
        async_client: config.async_client,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    struct FourGpus;

    impl ExecutionEngine for FourGpus {
        fn default_kind(&self) -> DeviceKind {
            DeviceKind::Gpu
        }

        fn default_device_count(&self, kind: DeviceKind) -> usize {
            match kind {
                DeviceKind::Gpu => 4,
                _ => 1,
            }
        }

        fn bind(&self, _device: &Device, _async_client: bool) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_parse_device_kind() {
        assert_eq!("cpu".parse::<DeviceKind>().unwrap(), DeviceKind::Cpu);
        assert_eq!("CPU".parse::<DeviceKind>().unwrap(), DeviceKind::Cpu);
        assert_eq!("cuda".parse::<DeviceKind>().unwrap(), DeviceKind::Gpu);
        assert_eq!(" tpu ".parse::<DeviceKind>().unwrap(), DeviceKind::Tpu);
        assert!(matches!(
            "banana".parse::<DeviceKind>(),
            Err(ConfigurationError::UnknownDeviceKind(_, _))
        ));
        assert!("".parse::<DeviceKind>().is_err());
    }

    #[test]
    fn test_default_topology_without_overrides() {
        let config = DeviceConfig::from_lookup(lookup_from(&[])).unwrap();
        let layout = resolve_topology(&config, &HostEngine).unwrap();
        assert_eq!(layout.kind, DeviceKind::Cpu);
        assert_eq!(layout.topology, Topology::single());
        assert!(!layout.async_client);
        assert_eq!(layout.device(LocalOrdinal(0)).to_string(), "cpu:0");
    }

    #[test]
    fn test_count_key_follows_device_kind() {
        let config = DeviceConfig::from_lookup(lookup_from(&[
            (DEVICE_KIND_ENV, "CPU"),
            ("CPU_NUM_DEVICES", "4"),
            ("GPU_NUM_DEVICES", "8"),
            (ASYNC_CLIENT_ENV, "true"),
        ]))
        .unwrap();
        let layout = resolve_topology(&config, &HostEngine).unwrap();
        assert_eq!(layout.topology, Topology::new(1, 4).unwrap());
        assert!(layout.async_client);

        let config = DeviceConfig::from_lookup(lookup_from(&[
            (DEVICE_KIND_ENV, "gpu"),
            ("CPU_NUM_DEVICES", "4"),
            ("GPU_NUM_DEVICES", "8"),
            (NUM_PROCESSES_ENV, "2"),
        ]))
        .unwrap();
        let layout = resolve_topology(&config, &HostEngine).unwrap();
        assert_eq!(layout.kind, DeviceKind::Gpu);
        assert_eq!(layout.topology, Topology::new(2, 8).unwrap());
    }

    #[test]
    fn test_engine_defaults_fill_missing_values() {
        let layout = resolve_topology(&DeviceConfig::default(), &FourGpus).unwrap();
        assert_eq!(layout.kind, DeviceKind::Gpu);
        assert_eq!(layout.topology, Topology::new(1, 4).unwrap());

        let config = DeviceConfig::default().with_device_kind("tpu");
        let layout = resolve_topology(&config, &FourGpus).unwrap();
        assert_eq!(layout.topology.devices_per_process(), 1);
    }

    #[test]
    fn test_unselected_kind_count_does_not_leak_into_engine_default() {
        let config = DeviceConfig::from_lookup(lookup_from(&[("CPU_NUM_DEVICES", "2")])).unwrap();
        let layout = resolve_topology(&config, &FourGpus).unwrap();
        assert_eq!(layout.kind, DeviceKind::Gpu);
        assert_eq!(layout.topology, Topology::new(1, 4).unwrap());

        let config = DeviceConfig::from_lookup(lookup_from(&[
            ("CPU_NUM_DEVICES", "2"),
            ("GPU_NUM_DEVICES", "6"),
        ]))
        .unwrap();
        let layout = resolve_topology(&config, &FourGpus).unwrap();
        assert_eq!(layout.topology, Topology::new(1, 6).unwrap());

        let layout = resolve_topology(&config, &HostEngine).unwrap();
        assert_eq!(layout.kind, DeviceKind::Cpu);
        assert_eq!(layout.topology, Topology::new(1, 2).unwrap());
    }

    #[test]
    fn test_oversized_topology_is_a_configuration_error() {
        let config = DeviceConfig::default()
            .with_device_count(i64::MAX / 2)
            .with_process_count(5);
        assert_eq!(
            resolve_topology(&config, &HostEngine),
            Err(ConfigurationError::TopologyTooLarge {
                process_count: 5,
                devices_per_process: (i64::MAX / 2) as u128,
            })
        );

        let config = DeviceConfig::default()
            .with_device_count(i64::MAX)
            .with_process_count(i64::MAX);
        assert!(matches!(
            resolve_topology(&config, &HostEngine),
            Err(ConfigurationError::TopologyTooLarge { .. })
        ));
    }

    #[test]
    fn test_invalid_configuration() {
        assert_eq!(
            resolve_topology(&DeviceConfig::default().with_device_count(0), &HostEngine),
            Err(ConfigurationError::InvalidDeviceCount(0))
        );
        assert_eq!(
            resolve_topology(&DeviceConfig::default().with_device_count(-2), &HostEngine),
            Err(ConfigurationError::InvalidDeviceCount(-2))
        );
        assert_eq!(
            resolve_topology(&DeviceConfig::default().with_process_count(0), &HostEngine),
            Err(ConfigurationError::InvalidProcessCount(0))
        );
        assert!(matches!(
            resolve_topology(&DeviceConfig::default().with_device_kind("quantum"), &HostEngine),
            Err(ConfigurationError::UnknownDeviceKind(_, _))
        ));
        assert!(matches!(
            DeviceConfig::from_lookup(lookup_from(&[(DEVICE_KIND_ENV, "nvidia")])),
            Err(ConfigurationError::UnknownDeviceKind(_, _))
        ));
        assert!(matches!(
            DeviceConfig::from_lookup(lookup_from(&[("CPU_NUM_DEVICES", "four")])),
            Err(ConfigurationError::Unparsable { .. })
        ));
        assert!(matches!(
            DeviceConfig::from_lookup(lookup_from(&[(ASYNC_CLIENT_ENV, "maybe")])),
            Err(ConfigurationError::Unparsable { .. })
        ));
    }
}
