use std::{
    collections::BTreeSet,
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Instant,
};

use serde::{de::DeserializeOwned, Serialize};
use spmd_collective::{FleetEvent, RendezvousConfig, RendezvousServer};
use spmd_core::{
    resolve_topology, AggregatedResult, DeviceLayout, ExecutionEngine, FailureKind, HostEngine,
    ProcessIndex, ResultAggregator, WorkerFailure,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    spawn::{self, WorkerExit},
    worker, Isolation, LaunchConfig, LaunchError, WorkerContext, WorkerEnv,
};

/// Runs one function on every device slot of a fleet and gathers the results.
pub struct Launcher {
    config: LaunchConfig,
    engine: Arc<dyn ExecutionEngine>,
}

impl Launcher {
    pub fn new(config: LaunchConfig) -> Self {
        Self {
            config,
            engine: Arc::new(HostEngine),
        }
    }

    pub fn with_engine(mut self, engine: Arc<dyn ExecutionEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// Run `f` once per device slot across the fleet and return every slot's
    /// value keyed by process index, then global ordinal.
    ///
    /// In a process spawned as a worker for `job`, this runs that worker's
    /// slots and exits the process instead of returning.
    pub fn run_multiprocess<T, F>(
        &self,
        job: &str,
        f: F,
    ) -> Result<AggregatedResult<T>, LaunchError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(&WorkerContext) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let f = Arc::new(f);

        if let Some(env) = WorkerEnv::from_env()? {
            if env.job != job {
                return Err(LaunchError::JobMismatch {
                    expected: job.to_string(),
                    found: env.job,
                });
            }
            let code = match worker::run_process(&env, f, self.engine.clone()) {
                Ok(()) => 0,
                Err(err) => {
                    error!(process = %env.process_index, error = format!("{err:#}"), "worker failed");
                    1
                }
            };
            std::process::exit(code);
        }

        let layout = match self.config.layout {
            Some(layout) => layout,
            None => resolve_topology(&self.config.device, self.engine.as_ref())?,
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("spmd-launcher")
            .build()?;
        let start = Instant::now();
        let result = runtime.block_on(self.supervise(job, layout, f));
        // detached thread workers may still hold sockets
        runtime.shutdown_background();

        let result = result?;
        info!(job, elapsed = ?start.elapsed(), results = result.len(), "job finished");
        result.try_map(|process_index, global_ordinal, bytes| {
            postcard::from_bytes(&bytes).map_err(|source| LaunchError::Decode {
                process_index,
                global_ordinal,
                source,
            })
        })
    }

    async fn supervise<T, F>(
        &self,
        job: &str,
        layout: DeviceLayout,
        f: Arc<F>,
    ) -> Result<AggregatedResult<Vec<u8>>, LaunchError>
    where
        T: Serialize + 'static,
        F: Fn(&WorkerContext) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let topology = layout.topology;
        let cancel = CancellationToken::new();
        let kill = CancellationToken::new();

        let (server, mut events) = RendezvousServer::bind(
            self.config.rendezvous_addr,
            RendezvousConfig {
                job: job.to_string(),
                topology,
                collective_timeout: self.config.collective_timeout,
            },
            cancel.clone(),
        )
        .await?;
        let rendezvous = reachable(server.local_addr()?);
        tokio::spawn(async move {
            if let Err(err) = server.run().await {
                error!(error = %err, "rendezvous server failed");
            }
        });

        info!(
            job,
            %topology,
            kind = %layout.kind,
            isolation = ?self.config.isolation,
            %rendezvous,
            "launching job"
        );

        let envs: Vec<WorkerEnv> = topology
            .processes()
            .map(|process_index| WorkerEnv {
                job: job.to_string(),
                process_index,
                layout,
                rendezvous,
                collective_timeout: self.config.collective_timeout,
            })
            .collect();

        let (exits_tx, mut exits) = mpsc::unbounded_channel();
        let spawned = match self.config.isolation {
            Isolation::Processes => {
                let program = match &self.config.program {
                    Some(program) => program.clone(),
                    None => std::env::current_exe()?,
                };
                let args = match &self.config.program_args {
                    Some(args) => args.clone(),
                    None => std::env::args_os().skip(1).collect(),
                };
                spawn::spawn_processes(&program, &args, envs, exits_tx, kill.clone())
            }
            Isolation::Threads => spawn::spawn_threads(envs, f, self.engine.clone(), exits_tx),
        };
        if let Err(err) = spawned {
            kill.cancel();
            cancel.cancel();
            return Err(err);
        }

        let mut running: BTreeSet<_> = topology.processes().collect();
        let mut aggregator = ResultAggregator::new(topology);
        let deadline = tokio::time::sleep(self.config.job_timeout);
        tokio::pin!(deadline);

        let outcome: Result<(), LaunchError> = loop {
            if aggregator.has_failed() || aggregator.is_complete() {
                break Ok(());
            }
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(FleetEvent::Joined { identity }) => debug!(%identity, "slot joined"),
                    Some(FleetEvent::Reported { process_index, global_ordinal, outcome }) => {
                        if let Err(err) = aggregator.record(process_index, global_ordinal, outcome) {
                            break Err(err.into());
                        }
                    }
                    Some(FleetEvent::Failed(failure)) => aggregator.fail(failure),
                    None => break Err(io::Error::other("rendezvous stopped unexpectedly").into()),
                },
                exit = exits.recv(), if !running.is_empty() => {
                    let Some(exit) = exit else {
                        running.clear();
                        continue;
                    };
                    running.remove(&exit.process_index);
                    on_early_exit(&mut aggregator, exit);
                }
                _ = &mut deadline => break Err(LaunchError::LaunchTimeout(self.config.job_timeout)),
            }
        };

        let failed = outcome.is_err() || aggregator.has_failed();
        if failed {
            if let Some(failure) = aggregator.first_failure() {
                error!(%failure, "job failed, tearing down workers");
            }
            kill.cancel();
            cancel.cancel();
        }
        self.wait_for_workers(&mut exits, &mut running).await;
        kill.cancel();
        cancel.cancel();

        outcome?;
        Ok(aggregator.finalize()?)
    }

    /// Give remaining workers the shutdown grace period to exit, then give up
    /// on them: processes are killed and thread groups are detached.
    async fn wait_for_workers(
        &self,
        exits: &mut mpsc::UnboundedReceiver<WorkerExit>,
        running: &mut BTreeSet<ProcessIndex>,
    ) {
        let grace = tokio::time::sleep(self.config.shutdown_grace);
        tokio::pin!(grace);
        while !running.is_empty() {
            tokio::select! {
                exit = exits.recv() => match exit {
                    Some(exit) => {
                        debug!(process = %exit.process_index, success = exit.success, detail = %exit.detail, "worker exited");
                        running.remove(&exit.process_index);
                    }
                    None => break,
                },
                _ = &mut grace => {
                    warn!(remaining = running.len(), "workers did not exit within the shutdown grace period");
                    break;
                }
            }
        }
    }
}

/// A worker that exits while some of its slots still owe an outcome takes the
/// fleet down with it.
fn on_early_exit<T>(aggregator: &mut ResultAggregator<T>, exit: WorkerExit) {
    if aggregator.has_failed() || aggregator.process_complete(exit.process_index) {
        debug!(process = %exit.process_index, detail = %exit.detail, "worker exited");
        return;
    }
    let cause = if exit.success {
        format!("{} before every slot reported", exit.detail)
    } else {
        exit.detail
    };
    aggregator.fail(WorkerFailure::new(
        exit.process_index,
        None,
        FailureKind::Crashed,
        cause,
    ));
}

/// Workers cannot dial an unspecified address; send them to loopback instead.
fn reachable(mut addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        addr.set_ip(Ipv4Addr::LOCALHOST.into());
    }
    addr
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use spmd_core::{GlobalOrdinal, Topology};

    use super::*;

    fn exit(process: usize, success: bool, detail: &str) -> WorkerExit {
        WorkerExit {
            process_index: ProcessIndex(process),
            success,
            detail: detail.to_string(),
        }
    }

    #[test]
    fn test_exit_with_missing_reports_is_a_crash() {
        let mut aggregator = ResultAggregator::<u32>::new(Topology::new(2, 2).unwrap());
        aggregator.record(ProcessIndex(1), GlobalOrdinal(2), Ok(7)).unwrap();

        on_early_exit(&mut aggregator, exit(1, false, "exit status: 3"));

        let failure = aggregator.first_failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Crashed);
        assert_eq!(failure.process_index, ProcessIndex(1));
        assert_eq!(failure.global_ordinal, None);
        assert_eq!(failure.cause, "exit status: 3");
        assert_eq!(failure.to_string(), "crashed on process 1: exit status: 3");
    }

    #[test]
    fn test_clean_exit_before_reporting_is_a_crash() {
        let mut aggregator = ResultAggregator::<u32>::new(Topology::new(1, 2).unwrap());
        on_early_exit(&mut aggregator, exit(0, true, "exit status: 0"));
        assert_eq!(
            aggregator.first_failure().unwrap().cause,
            "exit status: 0 before every slot reported"
        );
    }

    #[test]
    fn test_exit_after_reporting_or_failure_is_ignored() {
        let mut aggregator = ResultAggregator::<u32>::new(Topology::new(2, 1).unwrap());
        aggregator.record(ProcessIndex(0), GlobalOrdinal(0), Ok(1)).unwrap();
        on_early_exit(&mut aggregator, exit(0, true, "exit status: 0"));
        assert!(!aggregator.has_failed());

        aggregator.fail(WorkerFailure::new(
            ProcessIndex(1),
            Some(GlobalOrdinal(1)),
            FailureKind::User,
            "boom",
        ));
        on_early_exit(&mut aggregator, exit(1, false, "signal: 9 (SIGKILL)"));
        assert_eq!(aggregator.first_failure().unwrap().kind, FailureKind::User);
    }
}
