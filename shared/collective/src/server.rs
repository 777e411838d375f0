use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use spmd_core::{
    FailureKind, GlobalOrdinal, OrdinalRegistry, ProcessIndex, Topology, WorkerFailure,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
};
use tokio_util::{
    codec::{Framed, LengthDelimitedCodec},
    sync::CancellationToken,
};
use tracing::{debug, info, trace, warn};

use crate::{
    frame::{codec, encode},
    CollectiveError, CollectiveFailure, CollectiveReply, CollectiveRequest, ReduceValues,
    ServerMessage, SlotIdentity, WorkerMessage,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct RendezvousConfig {
    pub job: String,
    pub topology: Topology,
    pub collective_timeout: Duration,
}

/// What the rendezvous tells the launcher about the fleet.
#[derive(Debug)]
pub enum FleetEvent {
    Joined {
        identity: SlotIdentity,
    },
    Reported {
        process_index: ProcessIndex,
        global_ordinal: GlobalOrdinal,
        outcome: Result<Vec<u8>, WorkerFailure>,
    },
    /// A failure the rendezvous detected itself: a timeout, mismatch or
    /// dropped connection. Emitted once, before any pending call is aborted.
    Failed(WorkerFailure),
}

struct Arrival {
    request: CollectiveRequest,
    reply: oneshot::Sender<CollectiveReply>,
}

#[derive(Default)]
struct FleetState {
    joined: BTreeSet<GlobalOrdinal>,
    reported: BTreeSet<GlobalOrdinal>,
    pending: BTreeMap<u64, BTreeMap<GlobalOrdinal, Arrival>>,
    failed: Option<String>,
}

enum Arrived {
    Ready(CollectiveReply),
    Waiting(oneshot::Receiver<CollectiveReply>),
}

enum SessionEnd {
    Closed,
    Cancelled,
}

struct Shared {
    config: RendezvousConfig,
    registry: OrdinalRegistry,
    events: mpsc::UnboundedSender<FleetEvent>,
    state: Mutex<FleetState>,
}

/// Launcher-hosted transport for every collective in one job.
///
/// Each device slot holds one connection. Calls are matched by the slot's
/// per-connection sequence number and resolved once all `world_size` slots
/// arrived.
pub struct RendezvousServer {
    listener: TcpListener,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl RendezvousServer {
    pub async fn bind(
        addr: SocketAddr,
        config: RendezvousConfig,
        cancel: CancellationToken,
    ) -> io::Result<(Self, mpsc::UnboundedReceiver<FleetEvent>)> {
        let listener = TcpListener::bind(addr).await?;
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            registry: config.topology.registry(),
            config,
            events,
            state: Mutex::new(FleetState::default()),
        });
        Ok((
            Self {
                listener,
                shared,
                cancel,
            },
            rx,
        ))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> io::Result<()> {
        info!(
            addr = %self.local_addr()?,
            job = %self.shared.config.job,
            topology = %self.shared.config.topology,
            "rendezvous listening"
        );
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(error = %err, "failed to accept rendezvous connection");
                            continue;
                        }
                    };
                    trace!(%peer, "rendezvous connection");
                    tokio::spawn(serve(self.shared.clone(), stream, self.cancel.clone()));
                }
            }
        }
        debug!("rendezvous stopped");
        Ok(())
    }
}

async fn serve(shared: Arc<Shared>, stream: TcpStream, cancel: CancellationToken) {
    if let Err(err) = stream.set_nodelay(true) {
        warn!(error = %err, "failed to set TCP_NODELAY");
    }
    let mut framed = Framed::new(stream, codec());

    let identity = tokio::select! {
        _ = cancel.cancelled() => return,
        identity = handshake(&shared, &mut framed) => match identity {
            Ok(identity) => identity,
            Err(err) => {
                warn!(error = %err, "rejected rendezvous connection");
                return;
            }
        },
    };

    let reason = match session(&shared, identity, &mut framed, &cancel).await {
        Ok(SessionEnd::Cancelled) => return,
        Ok(SessionEnd::Closed) => "connection closed".to_string(),
        Err(err) => err.to_string(),
    };
    shared.disconnected(identity, &reason);
}

async fn handshake(
    shared: &Shared,
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
) -> Result<SlotIdentity, CollectiveError> {
    let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no hello from worker"))?
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "closed before hello"))??;

    let (job, identity) = match postcard::from_bytes(&frame)? {
        WorkerMessage::Hello { job, identity } => (job, identity),
        other => {
            return Err(CollectiveError::Protocol {
                expected: "hello",
                got: other.kind(),
            })
        }
    };

    match shared.admit(&job, identity) {
        Ok(()) => {
            framed.send(encode(&ServerMessage::Welcome)?).await?;
            debug!(%identity, "slot joined");
            let _ = shared.events.send(FleetEvent::Joined { identity });
            Ok(identity)
        }
        Err(reason) => {
            framed
                .send(encode(&ServerMessage::Rejected {
                    reason: reason.clone(),
                })?)
                .await?;
            Err(CollectiveError::Rejected(reason))
        }
    }
}

async fn session(
    shared: &Shared,
    identity: SlotIdentity,
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    cancel: &CancellationToken,
) -> Result<SessionEnd, CollectiveError> {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            frame = framed.next() => frame,
        };
        let Some(frame) = frame else {
            return Ok(SessionEnd::Closed);
        };

        match postcard::from_bytes(&frame?)? {
            WorkerMessage::Collective { seq, request } => {
                let reply = match shared.arrive(identity, seq, request) {
                    Arrived::Ready(reply) => reply,
                    Arrived::Waiting(mut rx) => tokio::select! {
                        _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                        reply = &mut rx => reply.unwrap_or_else(|_| dropped_call()),
                        _ = tokio::time::sleep(shared.config.collective_timeout) => {
                            match shared.expire(identity, seq) {
                                Some(reply) => reply,
                                // resolved while the timer fired
                                None => rx.try_recv().unwrap_or_else(|_| dropped_call()),
                            }
                        }
                    },
                };
                framed
                    .send(encode(&ServerMessage::Collective { seq, reply })?)
                    .await?;
            }
            WorkerMessage::Report { outcome } => {
                shared.report(identity, outcome);
                framed.send(encode(&ServerMessage::Ack)?).await?;
            }
            other @ WorkerMessage::Hello { .. } => {
                return Err(CollectiveError::Protocol {
                    expected: "collective or report",
                    got: other.kind(),
                })
            }
        }
    }
}

fn dropped_call() -> CollectiveReply {
    CollectiveReply::Failed(CollectiveFailure::aborted("rendezvous dropped the call"))
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, FleetState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn world_size(&self) -> usize {
        self.config.topology.total_devices()
    }

    fn admit(&self, job: &str, identity: SlotIdentity) -> Result<(), String> {
        if job != self.config.job {
            return Err(format!(
                "job '{job}' does not match rendezvous job '{}'",
                self.config.job
            ));
        }
        if identity.world_size != self.world_size() {
            return Err(format!(
                "world size {} does not match rendezvous world size {}",
                identity.world_size,
                self.world_size()
            ));
        }
        match self
            .registry
            .global_ordinal(identity.process_index, identity.local_ordinal)
        {
            Ok(ordinal) if ordinal == identity.global_ordinal => {}
            Ok(ordinal) => {
                return Err(format!(
                    "{identity} claims ordinal {} but owns ordinal {ordinal}",
                    identity.global_ordinal
                ))
            }
            Err(err) => return Err(err.to_string()),
        }
        if !self.lock().joined.insert(identity.global_ordinal) {
            return Err(format!("ordinal {} already joined", identity.global_ordinal));
        }
        Ok(())
    }

    fn arrive(&self, identity: SlotIdentity, seq: u64, request: CollectiveRequest) -> Arrived {
        let mut state = self.lock();
        if let Some(reason) = &state.failed {
            return Arrived::Ready(CollectiveReply::Failed(CollectiveFailure::aborted(
                reason.clone(),
            )));
        }

        let ordinal = identity.global_ordinal;
        let call = state.pending.entry(seq).or_default();
        if call.contains_key(&ordinal) {
            let detail = format!("ordinal {ordinal} entered collective #{seq} twice");
            self.fail(
                &mut state,
                self.failure(ordinal, FailureKind::CollectiveMismatch, detail.clone()),
                CollectiveFailure::mismatch(detail.clone()),
            );
            return Arrived::Ready(CollectiveReply::Failed(CollectiveFailure::mismatch(detail)));
        }

        let (tx, rx) = oneshot::channel();
        call.insert(ordinal, Arrival { request, reply: tx });
        if call.len() < self.world_size() {
            return Arrived::Waiting(rx);
        }

        let Some(arrivals) = state.pending.remove(&seq) else {
            return Arrived::Waiting(rx);
        };
        match resolve(&arrivals) {
            Ok(reply) => {
                trace!(seq, kind = reply.kind(), "collective resolved");
                for arrival in arrivals.into_values() {
                    let _ = arrival.reply.send(reply.clone());
                }
            }
            Err((culprit, detail)) => {
                let detail = format!("collective #{seq}: {detail}");
                self.fail(
                    &mut state,
                    self.failure(culprit, FailureKind::CollectiveMismatch, detail.clone()),
                    CollectiveFailure::mismatch(detail.clone()),
                );
                for arrival in arrivals.into_values() {
                    let _ = arrival
                        .reply
                        .send(CollectiveReply::Failed(CollectiveFailure::mismatch(detail.clone())));
                }
            }
        }
        Arrived::Waiting(rx)
    }

    /// Called when `identity`'s wait on `seq` ran out. Returns `None` if the
    /// call was resolved or aborted in the meantime and a reply is waiting.
    fn expire(&self, identity: SlotIdentity, seq: u64) -> Option<CollectiveReply> {
        let mut state = self.lock();
        let call = state.pending.get(&seq)?;
        if !call.contains_key(&identity.global_ordinal) {
            return None;
        }

        let arrived: BTreeSet<GlobalOrdinal> = call.keys().copied().collect();
        let missing = (0..self.world_size())
            .map(GlobalOrdinal)
            .find(|ordinal| !arrived.contains(ordinal))
            .unwrap_or(identity.global_ordinal);
        let detail = format!(
            "collective #{seq} timed out after {:?} waiting for ordinal {missing} ({} of {} arrived)",
            self.config.collective_timeout,
            arrived.len(),
            self.world_size()
        );
        let failure = CollectiveFailure::timeout(detail.clone());
        self.fail(
            &mut state,
            self.failure(missing, FailureKind::CollectiveTimeout, detail),
            failure.clone(),
        );
        Some(CollectiveReply::Failed(failure))
    }

    fn report(&self, identity: SlotIdentity, outcome: Result<Vec<u8>, WorkerFailure>) {
        let mut state = self.lock();
        if !state.reported.insert(identity.global_ordinal) {
            warn!(%identity, "ignoring duplicate report");
            return;
        }

        let failure = outcome.as_ref().err().cloned();
        let _ = self.events.send(FleetEvent::Reported {
            process_index: identity.process_index,
            global_ordinal: identity.global_ordinal,
            outcome,
        });

        if let Some(failure) = failure {
            if state.failed.is_none() {
                let reason = failure.to_string();
                warn!(%identity, %reason, "slot failed, aborting pending collectives");
                abort_pending(&mut state, CollectiveFailure::aborted(reason.clone()));
                state.failed = Some(reason);
            }
        }
    }

    fn disconnected(&self, identity: SlotIdentity, reason: &str) {
        let mut state = self.lock();
        if state.reported.contains(&identity.global_ordinal) || state.failed.is_some() {
            trace!(%identity, reason, "connection ended");
            return;
        }
        let detail = format!("rendezvous connection lost before reporting: {reason}");
        self.fail(
            &mut state,
            WorkerFailure::new(
                identity.process_index,
                Some(identity.global_ordinal),
                FailureKind::Disconnected,
                detail.clone(),
            ),
            CollectiveFailure::aborted(detail),
        );
    }

    fn failure(&self, ordinal: GlobalOrdinal, kind: FailureKind, cause: String) -> WorkerFailure {
        let process_index = self
            .registry
            .process_index_of(ordinal)
            .unwrap_or_default();
        WorkerFailure::new(process_index, Some(ordinal), kind, cause)
    }

    /// Fail the fleet: the first failure is forwarded to the launcher and
    /// every pending call is answered with `reply`.
    fn fail(&self, state: &mut FleetState, failure: WorkerFailure, reply: CollectiveFailure) {
        if state.failed.is_some() {
            return;
        }
        warn!(%failure, "fleet failed");
        state.failed = Some(failure.to_string());
        let _ = self.events.send(FleetEvent::Failed(failure));
        abort_pending(state, reply);
    }
}

fn abort_pending(state: &mut FleetState, reply: CollectiveFailure) {
    for arrival in std::mem::take(&mut state.pending)
        .into_values()
        .flat_map(BTreeMap::into_values)
    {
        let _ = arrival.reply.send(CollectiveReply::Failed(reply.clone()));
    }
}

/// Combine one call's arrivals, ascending by ordinal. On a mismatch, returns
/// the first ordinal that disagrees with the lowest one.
fn resolve(
    arrivals: &BTreeMap<GlobalOrdinal, Arrival>,
) -> Result<CollectiveReply, (GlobalOrdinal, String)> {
    let mut iter = arrivals.iter();
    let Some((&first_ordinal, first)) = iter.next() else {
        return Ok(CollectiveReply::Released);
    };
    for (&ordinal, arrival) in iter {
        if let Some(detail) = mismatch(&first.request, &arrival.request) {
            return Err((
                ordinal,
                format!("ordinal {ordinal} {detail} ordinal {first_ordinal}"),
            ));
        }
    }

    match &first.request {
        CollectiveRequest::Broadcast { .. } => {
            let master = arrivals
                .get(&GlobalOrdinal(0))
                .and_then(|arrival| match &arrival.request {
                    CollectiveRequest::Broadcast { value } => value.clone(),
                    _ => None,
                });
            master.map(CollectiveReply::Broadcast).ok_or_else(|| {
                (
                    GlobalOrdinal(0),
                    "master did not supply a broadcast value".to_string(),
                )
            })
        }
        CollectiveRequest::AllReduceSum { values, scale } => {
            let operands = arrivals
                .iter()
                .filter_map(|(&ordinal, arrival)| match &arrival.request {
                    CollectiveRequest::AllReduceSum { values, .. } => Some((ordinal, values)),
                    _ => None,
                });
            let sums = match values {
                ReduceValues::Float(values) => {
                    ReduceValues::Float(sum_floats(values.len(), operands, *scale))
                }
                ReduceValues::Integer(values) => {
                    ReduceValues::Integer(sum_integers(values.len(), operands)?)
                }
            };
            Ok(CollectiveReply::Reduced(sums))
        }
        CollectiveRequest::MeshReduce { .. } => Ok(CollectiveReply::Gathered(
            arrivals
                .values()
                .filter_map(|arrival| match &arrival.request {
                    CollectiveRequest::MeshReduce { value, .. } => Some(value.clone()),
                    _ => None,
                })
                .collect(),
        )),
        CollectiveRequest::Barrier { .. } => Ok(CollectiveReply::Released),
    }
}

fn sum_floats<'a>(
    len: usize,
    operands: impl Iterator<Item = (GlobalOrdinal, &'a ReduceValues)>,
    scale: f64,
) -> Vec<f64> {
    let mut sums = vec![0.0; len];
    for (_, values) in operands {
        if let ReduceValues::Float(values) = values {
            for (sum, value) in sums.iter_mut().zip(values) {
                *sum += value;
            }
        }
    }
    sums.into_iter().map(|sum| sum * scale).collect()
}

/// Exact sums; the first ordinal whose addition overflows `i128` is blamed.
fn sum_integers<'a>(
    len: usize,
    operands: impl Iterator<Item = (GlobalOrdinal, &'a ReduceValues)>,
) -> Result<Vec<i128>, (GlobalOrdinal, String)> {
    let mut sums = vec![0i128; len];
    for (ordinal, values) in operands {
        let ReduceValues::Integer(values) = values else {
            continue;
        };
        for (index, (sum, value)) in sums.iter_mut().zip(values).enumerate() {
            *sum = sum.checked_add(*value).ok_or_else(|| {
                let detail =
                    format!("ordinal {ordinal} overflowed the integer sum at index {index}");
                (ordinal, detail)
            })?;
        }
    }
    Ok(sums)
}

/// Describes how `other` disagrees with `first`, phrased to follow
/// "ordinal N ... ordinal M".
fn mismatch(first: &CollectiveRequest, other: &CollectiveRequest) -> Option<String> {
    use CollectiveRequest::*;
    match (first, other) {
        (Broadcast { .. }, Broadcast { .. }) => None,
        (
            AllReduceSum {
                values: a,
                scale: scale_a,
            },
            AllReduceSum {
                values: b,
                scale: scale_b,
            },
        ) => {
            if a.kind() != b.kind() {
                Some(format!(
                    "reduced {} values but {} values were reduced by",
                    b.kind(),
                    a.kind()
                ))
            } else if a.len() != b.len() {
                Some(format!(
                    "reduced {} values but {} were reduced by",
                    b.len(),
                    a.len()
                ))
            } else if scale_a.to_bits() != scale_b.to_bits() {
                Some(format!("used scale {scale_b} but scale {scale_a} was used by"))
            } else {
                None
            }
        }
        (MeshReduce { key: a, .. }, MeshReduce { key: b, .. }) if a != b => {
            Some(format!("used key '{b}' but key '{a}' was used by"))
        }
        (MeshReduce { .. }, MeshReduce { .. }) => None,
        (Barrier { tag: a }, Barrier { tag: b }) if a != b => {
            Some(format!("waited at barrier '{b}' but barrier '{a}' was entered by"))
        }
        (Barrier { .. }, Barrier { .. }) => None,
        (first, other) => Some(format!(
            "called {} but {} was called by",
            other.kind(),
            first.kind()
        )),
    }
}
