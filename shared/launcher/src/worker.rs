use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread,
};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use spmd_collective::{CollectiveChannel, CollectiveError, SlotIdentity};
use spmd_core::{ExecutionEngine, FailureKind, LocalOrdinal, WorkerFailure};
use tracing::{debug, error, info_span};

use crate::{WorkerContext, WorkerEnv};

/// Run every local slot of `env.process_index`, each on its own thread, and
/// wait for all of them. Fails if any slot could not deliver its outcome.
pub(crate) fn run_process<T, F>(
    env: &WorkerEnv,
    f: Arc<F>,
    engine: Arc<dyn ExecutionEngine>,
) -> Result<()>
where
    T: Serialize + 'static,
    F: Fn(&WorkerContext) -> Result<T> + Send + Sync + 'static,
{
    let slots = (0..env.layout.topology.devices_per_process())
        .map(LocalOrdinal)
        .map(|local| {
            let env = env.clone();
            let f = f.clone();
            let engine = engine.clone();
            thread::Builder::new()
                .name(format!("spmd-slot-{}-{local}", env.process_index))
                .spawn(move || run_slot(&env, local, f.as_ref(), engine.as_ref()))
                .with_context(|| format!("failed to start thread for local slot {local}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut missing = 0;
    for handle in slots {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(process = %env.process_index, error = format!("{err:#}"), "slot did not report");
                missing += 1;
            }
            Err(_) => {
                error!(process = %env.process_index, "slot thread panicked outside the user function");
                missing += 1;
            }
        }
    }
    if missing > 0 {
        bail!(
            "{missing} slot(s) of process {} did not report an outcome",
            env.process_index
        );
    }
    Ok(())
}

fn run_slot<T, F>(
    env: &WorkerEnv,
    local: LocalOrdinal,
    f: &F,
    engine: &dyn ExecutionEngine,
) -> Result<()>
where
    T: Serialize,
    F: Fn(&WorkerContext) -> Result<T>,
{
    let topology = env.layout.topology;
    let identity = SlotIdentity {
        process_index: env.process_index,
        global_ordinal: topology.registry().global_ordinal(env.process_index, local)?,
        local_ordinal: local,
        world_size: topology.total_devices(),
    };
    let span = info_span!(
        "slot",
        process = %identity.process_index,
        ordinal = %identity.global_ordinal
    );
    let _enter = span.enter();

    let channel =
        CollectiveChannel::connect(env.rendezvous, &env.job, identity, env.collective_timeout)
            .with_context(|| format!("failed to join rendezvous at {}", env.rendezvous))?;
    let device = env.layout.device(local);
    let context = WorkerContext::new(env.layout, device, channel);

    let outcome = match engine.bind(&device, env.layout.async_client) {
        Ok(()) => invoke(&context, f),
        Err(err) => Err(WorkerFailure::new(
            identity.process_index,
            Some(identity.global_ordinal),
            FailureKind::Device,
            format!("failed to bind {device}: {err:#}"),
        )),
    };
    match &outcome {
        Ok(bytes) => debug!(bytes = bytes.len(), "slot finished"),
        Err(failure) => debug!(%failure, "slot failed"),
    }

    context
        .collective()
        .report(outcome)
        .context("failed to report outcome to the rendezvous")
}

fn invoke<T, F>(context: &WorkerContext, f: &F) -> Result<Vec<u8>, WorkerFailure>
where
    T: Serialize,
    F: Fn(&WorkerContext) -> Result<T>,
{
    let failure = |kind, cause: String| {
        WorkerFailure::new(
            context.process_index(),
            Some(context.global_ordinal()),
            kind,
            cause,
        )
    };

    match catch_unwind(AssertUnwindSafe(|| f(context))) {
        Ok(Ok(value)) => postcard::to_allocvec(&value)
            .map_err(|err| failure(FailureKind::User, format!("failed to encode result: {err}"))),
        Ok(Err(err)) => {
            let kind = err
                .chain()
                .find_map(|cause| cause.downcast_ref::<CollectiveError>())
                .map(CollectiveError::failure_kind)
                .unwrap_or(FailureKind::User);
            Err(failure(kind, format!("{err:#}")))
        }
        Err(payload) => Err(failure(FailureKind::Panic, panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked with a non-string payload".to_string()
    }
}
