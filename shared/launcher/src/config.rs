use std::{
    ffi::OsString,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};
use spmd_core::{
    ConfigurationError, DeviceConfig, DeviceLayout, ProcessIndex, DEVICE_KIND_ENV,
    NUM_PROCESSES_ENV,
};

use crate::LaunchError;

/// Set on spawned worker processes; holds the JSON encoded [`WorkerEnv`].
pub const WORKER_ENV: &str = "SPMD_WORKER";
pub const COLLECTIVE_TIMEOUT_ENV: &str = "SPMD_COLLECTIVE_TIMEOUT_SECS";
pub const JOB_TIMEOUT_ENV: &str = "SPMD_JOB_TIMEOUT_SECS";

pub const DEFAULT_COLLECTIVE_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(60 * 60);
/// How long finished workers get to exit on their own before they are killed.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum Isolation {
    /// One OS process per process index, re-executing the current program.
    #[default]
    Processes,
    /// One thread group per process index inside the launcher process.
    Threads,
}

/// Immutable launch settings, built once and shared by reference.
#[derive(Clone, Debug)]
pub struct LaunchConfig {
    pub device: DeviceConfig,
    /// Skips device resolution entirely when set.
    pub layout: Option<DeviceLayout>,
    pub isolation: Isolation,
    pub rendezvous_addr: SocketAddr,
    pub collective_timeout: Duration,
    pub job_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Program spawned for each worker process. Defaults to the current executable.
    pub program: Option<PathBuf>,
    /// Arguments for `program`. Defaults to the current process's arguments.
    pub program_args: Option<Vec<OsString>>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            layout: None,
            isolation: Isolation::default(),
            rendezvous_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            collective_timeout: DEFAULT_COLLECTIVE_TIMEOUT,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            program: None,
            program_args: None,
        }
    }
}

impl LaunchConfig {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            device: DeviceConfig::from_lookup(&lookup)?,
            collective_timeout: lookup_seconds(&lookup, COLLECTIVE_TIMEOUT_ENV)?
                .unwrap_or(defaults.collective_timeout),
            job_timeout: lookup_seconds(&lookup, JOB_TIMEOUT_ENV)?
                .unwrap_or(defaults.job_timeout),
            ..defaults
        })
    }

    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.device = device;
        self
    }

    pub fn with_layout(mut self, layout: DeviceLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_rendezvous_addr(mut self, addr: SocketAddr) -> Self {
        self.rendezvous_addr = addr;
        self
    }

    pub fn with_collective_timeout(mut self, timeout: Duration) -> Self {
        self.collective_timeout = timeout;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        self.program = Some(program.into());
        self.program_args = Some(args);
        self
    }
}

fn lookup_seconds<F>(lookup: &F, key: &str) -> Result<Option<Duration>, ConfigurationError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| {
            parse_duration_from_seconds(value.trim()).map_err(|_| ConfigurationError::Unparsable {
                key: key.to_string(),
                value,
            })
        })
        .transpose()
}

fn parse_duration_from_seconds(s: &str) -> Result<Duration, String> {
    s.parse::<f64>()
        .map_err(|e| format!("Invalid number: {e}"))
        .and_then(|secs| {
            if secs.is_finite() && secs >= 0.0 {
                Ok(Duration::from_secs_f64(secs))
            } else {
                Err("Duration must be a non-negative number of seconds".to_string())
            }
        })
}

#[derive(Args, Debug, Clone)]
pub struct LaunchArgs {
    /// Device kind to run on: cpu, gpu or tpu. Defaults to the engine's preferred kind.
    #[clap(long, env = "SPMD_DEVICE")]
    pub device: Option<String>,

    /// Devices per worker process. Falls back to `<KIND>_NUM_DEVICES`, then to the engine's device count.
    #[clap(long)]
    pub devices_per_process: Option<i64>,

    /// Number of worker processes.
    #[clap(long, env = "SPMD_NUM_PROCESSES")]
    pub num_processes: Option<i64>,

    /// Initialize device clients asynchronously.
    #[clap(long, default_value_t = false)]
    pub async_client: bool,

    /// How workers are isolated from each other
    #[clap(
        long,
        env = "SPMD_ISOLATION",
        value_enum,
        default_value_t = Isolation::Processes,
        ignore_case = true
    )]
    pub isolation: Isolation,

    /// Address the rendezvous server listens on. Port 0 picks a free port.
    #[clap(long, env = "SPMD_RENDEZVOUS_ADDR", default_value = "127.0.0.1:0")]
    pub rendezvous_addr: SocketAddr,

    /// Seconds a collective may wait for every worker to arrive.
    #[clap(long, env = "SPMD_COLLECTIVE_TIMEOUT_SECS", default_value = "120", value_parser = parse_duration_from_seconds)]
    pub collective_timeout: Duration,

    /// Seconds the whole job may run before it is torn down.
    #[clap(long, env = "SPMD_JOB_TIMEOUT_SECS", default_value = "3600", value_parser = parse_duration_from_seconds)]
    pub job_timeout: Duration,
}

impl LaunchArgs {
    pub fn into_config(self) -> Result<LaunchConfig, ConfigurationError> {
        self.into_config_with(|key| std::env::var(key).ok())
    }

    /// Flags take precedence over `lookup`, which supplies the per-kind
    /// device count and the async client switch.
    pub fn into_config_with<F>(self, lookup: F) -> Result<LaunchConfig, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let device_kind = self.device.clone();
        let num_processes = self.num_processes;
        let mut device = DeviceConfig::from_lookup(|key| match key {
            DEVICE_KIND_ENV => device_kind.clone().or_else(|| lookup(key)),
            NUM_PROCESSES_ENV => num_processes
                .map(|count| count.to_string())
                .or_else(|| lookup(key)),
            _ => lookup(key),
        })?;
        if let Some(count) = self.devices_per_process {
            device = device.with_device_count(count);
        }
        if self.async_client {
            device = device.with_async_client(true);
        }

        Ok(LaunchConfig {
            device,
            isolation: self.isolation,
            rendezvous_addr: self.rendezvous_addr,
            collective_timeout: self.collective_timeout,
            job_timeout: self.job_timeout,
            ..LaunchConfig::default()
        })
    }
}

/// Everything a spawned worker needs to join its job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEnv {
    pub job: String,
    pub process_index: ProcessIndex,
    pub layout: DeviceLayout,
    pub rendezvous: SocketAddr,
    pub collective_timeout: Duration,
}

impl WorkerEnv {
    /// The worker environment of this process, if it was spawned as a worker.
    pub fn from_env() -> Result<Option<Self>, LaunchError> {
        match std::env::var(WORKER_ENV) {
            Ok(value) => Ok(Some(Self::decode(&value)?)),
            Err(_) => Ok(None),
        }
    }

    pub fn encode(&self) -> Result<String, LaunchError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(value: &str) -> Result<Self, LaunchError> {
        Ok(serde_json::from_str(value)?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use clap::Parser;
    use pretty_assertions::assert_eq;
    use spmd_core::{resolve_topology, DeviceKind, HostEngine, Topology};

    use super::*;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        launch: LaunchArgs,
    }

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_flags_override_environment() {
        let cli = Cli::try_parse_from([
            "spmd",
            "--device",
            "gpu",
            "--num-processes",
            "2",
            "--isolation",
            "threads",
            "--collective-timeout",
            "1.5",
        ])
        .unwrap();
        let config = cli
            .launch
            .into_config_with(lookup_from(&[
                (DEVICE_KIND_ENV, "cpu"),
                ("GPU_NUM_DEVICES", "3"),
                (NUM_PROCESSES_ENV, "7"),
            ]))
            .unwrap();

        assert_eq!(config.isolation, Isolation::Threads);
        assert_eq!(config.collective_timeout, Duration::from_millis(1500));
        assert_eq!(config.job_timeout, DEFAULT_JOB_TIMEOUT);

        let layout = resolve_topology(&config.device, &HostEngine).unwrap();
        assert_eq!(layout.kind, DeviceKind::Gpu);
        assert_eq!(layout.topology, Topology::new(2, 3).unwrap());
    }

    #[test]
    fn test_devices_per_process_flag_wins() {
        let cli = Cli::try_parse_from(["spmd", "--devices-per-process", "4", "--async-client"])
            .unwrap();
        let config = cli
            .launch
            .into_config_with(lookup_from(&[("CPU_NUM_DEVICES", "8")]))
            .unwrap();
        assert_eq!(config.device.device_count_override, Some(4));
        assert!(config.device.async_client);
    }

    #[test]
    fn test_timeouts_from_lookup() {
        let config = LaunchConfig::from_lookup(lookup_from(&[
            (COLLECTIVE_TIMEOUT_ENV, "2"),
            (JOB_TIMEOUT_ENV, "30"),
        ]))
        .unwrap();
        assert_eq!(config.collective_timeout, Duration::from_secs(2));
        assert_eq!(config.job_timeout, Duration::from_secs(30));

        assert!(matches!(
            LaunchConfig::from_lookup(lookup_from(&[(JOB_TIMEOUT_ENV, "-1")])),
            Err(ConfigurationError::Unparsable { .. })
        ));
    }

    #[test]
    fn test_worker_env_survives_the_environment() {
        let env = WorkerEnv {
            job: "train".to_string(),
            process_index: ProcessIndex(1),
            layout: resolve_topology(
                &DeviceConfig::default()
                    .with_device_count(2)
                    .with_process_count(2),
                &HostEngine,
            )
            .unwrap(),
            rendezvous: "127.0.0.1:4000".parse().unwrap(),
            collective_timeout: Duration::from_secs(5),
        };
        assert_eq!(WorkerEnv::decode(&env.encode().unwrap()).unwrap(), env);
        assert!(WorkerEnv::decode("{not json").is_err());
    }
}
