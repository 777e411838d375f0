use std::{ffi::OsString, path::Path, process::Stdio, sync::Arc, thread};

use anyhow::Result;
use serde::Serialize;
use spmd_core::{ExecutionEngine, ProcessIndex};
use tokio::{process::Command, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{worker, LaunchError, WorkerContext, WorkerEnv, WORKER_ENV};

/// A worker (process or thread group) finished.
#[derive(Debug)]
pub(crate) struct WorkerExit {
    pub process_index: ProcessIndex,
    pub success: bool,
    pub detail: String,
}

/// Re-execute `program` once per worker environment. Each child is watched by
/// a task that reports its exit and kills it once `kill` is cancelled.
pub(crate) fn spawn_processes(
    program: &Path,
    args: &[OsString],
    envs: Vec<WorkerEnv>,
    exits: mpsc::UnboundedSender<WorkerExit>,
    kill: CancellationToken,
) -> Result<(), LaunchError> {
    for env in envs {
        let process_index = env.process_index;
        let mut command = Command::new(program);
        command
            .args(args)
            .env(WORKER_ENV, env.encode()?)
            .stdin(Stdio::null())
            // stdout belongs to the launcher
            .stdout(std::io::stderr())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                process_index,
                source,
            })?;
        info!(process = %process_index, pid = ?child.id(), "spawned worker process");

        let exits = exits.clone();
        let kill = kill.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill.cancelled() => {
                    if let Err(err) = child.start_kill() {
                        warn!(process = %process_index, error = %err, "failed to kill worker process");
                    }
                    child.wait().await
                }
            };
            let exit = match status {
                Ok(status) if status.success() => WorkerExit {
                    process_index,
                    success: true,
                    detail: "exited".to_string(),
                },
                Ok(status) => WorkerExit {
                    process_index,
                    success: false,
                    detail: format!("worker process exited with {status}"),
                },
                Err(err) => WorkerExit {
                    process_index,
                    success: false,
                    detail: format!("failed to wait for worker process: {err}"),
                },
            };
            let _ = exits.send(exit);
        });
    }
    Ok(())
}

/// Run each worker as a thread group inside this process. Thread groups
/// cannot be killed; the launcher detaches them if they outlive the job.
pub(crate) fn spawn_threads<T, F>(
    envs: Vec<WorkerEnv>,
    f: Arc<F>,
    engine: Arc<dyn ExecutionEngine>,
    exits: mpsc::UnboundedSender<WorkerExit>,
) -> Result<(), LaunchError>
where
    T: Serialize + 'static,
    F: Fn(&WorkerContext) -> Result<T> + Send + Sync + 'static,
{
    for env in envs {
        let process_index = env.process_index;
        let f = f.clone();
        let engine = engine.clone();
        let exits = exits.clone();
        thread::Builder::new()
            .name(format!("spmd-worker-{process_index}"))
            .spawn(move || {
                let exit = match worker::run_process(&env, f, engine) {
                    Ok(()) => WorkerExit {
                        process_index,
                        success: true,
                        detail: "finished".to_string(),
                    },
                    Err(err) => WorkerExit {
                        process_index,
                        success: false,
                        detail: format!("{err:#}"),
                    },
                };
                let _ = exits.send(exit);
            })
            .map_err(|source| LaunchError::Spawn {
                process_index,
                source,
            })?;
    }
    Ok(())
}
