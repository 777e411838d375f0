use std::{
    io,
    net::{SocketAddr, TcpStream},
    sync::Mutex,
    time::Duration,
};

use num_traits::NumCast;
use serde::{de::DeserializeOwned, Serialize};
use spmd_core::{GlobalOrdinal, LocalOrdinal, ProcessIndex, WorkerFailure};
use tracing::{debug, trace};

use crate::{
    read_frame, write_frame, CollectiveError, CollectiveReply, CollectiveRequest, ReduceValues,
    ServerMessage, SlotIdentity, WorkerMessage,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// The rendezvous enforces the collective timeout; the socket timeout only
/// catches a rendezvous that stopped answering altogether.
const REPLY_GRACE: Duration = Duration::from_secs(5);

struct Connection {
    stream: TcpStream,
    next_seq: u64,
    poisoned: Option<String>,
}

/// Worker-side handle for one device slot's collective calls.
///
/// Every call blocks until all slots in the fleet made the matching call, the
/// per-call timeout expires, or the fleet fails. After the first failed call
/// the channel is poisoned and every later call returns
/// [`CollectiveError::Aborted`].
pub struct CollectiveChannel {
    identity: SlotIdentity,
    timeout: Duration,
    connection: Mutex<Connection>,
}

impl CollectiveChannel {
    pub fn connect(
        addr: SocketAddr,
        job: &str,
        identity: SlotIdentity,
        timeout: Duration,
    ) -> Result<Self, CollectiveError> {
        let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(CONNECT_TIMEOUT))?;

        write_frame(
            &mut stream,
            &WorkerMessage::Hello {
                job: job.to_string(),
                identity,
            },
        )?;
        match read_frame::<_, ServerMessage>(&mut stream)? {
            ServerMessage::Welcome => {}
            ServerMessage::Rejected { reason } => return Err(CollectiveError::Rejected(reason)),
            other => {
                return Err(CollectiveError::Protocol {
                    expected: "welcome",
                    got: other.kind(),
                })
            }
        }
        stream.set_read_timeout(Some(timeout + REPLY_GRACE))?;
        debug!(%identity, %addr, "joined rendezvous");

        Ok(Self {
            identity,
            timeout,
            connection: Mutex::new(Connection {
                stream,
                next_seq: 0,
                poisoned: None,
            }),
        })
    }

    pub fn identity(&self) -> SlotIdentity {
        self.identity
    }

    pub fn global_ordinal(&self) -> GlobalOrdinal {
        self.identity.global_ordinal
    }

    pub fn local_ordinal(&self) -> LocalOrdinal {
        self.identity.local_ordinal
    }

    pub fn process_index(&self) -> ProcessIndex {
        self.identity.process_index
    }

    pub fn world_size(&self) -> usize {
        self.identity.world_size
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Every slot receives the master's `value`. Values passed by other slots
    /// are ignored and never leave the worker.
    pub fn broadcast_from_master<T>(&self, value: &T) -> Result<T, CollectiveError>
    where
        T: Serialize + DeserializeOwned,
    {
        let value = if self.identity.is_master() {
            Some(postcard::to_allocvec(value)?)
        } else {
            None
        };
        match self.call(CollectiveRequest::Broadcast { value })? {
            CollectiveReply::Broadcast(bytes) => Ok(postcard::from_bytes(&bytes)?),
            other => Err(unexpected("broadcast", &other)),
        }
    }

    /// Elementwise sum over every slot, in ascending ordinal order, multiplied
    /// by `scale`. All slots must pass the same length and scale.
    ///
    /// Integer element types are summed exactly. A result that does not fit
    /// `N`, or a scaled integer result that is not exact, fails with
    /// [`CollectiveError::Unrepresentable`].
    pub fn all_reduce_sum<N>(&self, values: &[N], scale: f64) -> Result<Vec<N>, CollectiveError>
    where
        N: NumCast + Copy + PartialEq,
    {
        let values = if is_integral::<N>() {
            ReduceValues::Integer(cast_all(values)?)
        } else {
            ReduceValues::Float(cast_all(values)?)
        };

        match self.call(CollectiveRequest::AllReduceSum { values, scale })? {
            CollectiveReply::Reduced(ReduceValues::Float(sums)) => cast_all(&sums),
            CollectiveReply::Reduced(ReduceValues::Integer(sums)) => sums
                .into_iter()
                .enumerate()
                .map(|(index, sum)| {
                    scale_integer(sum, scale).ok_or(CollectiveError::Unrepresentable { index })
                })
                .collect(),
            other => Err(unexpected("reduced", &other)),
        }
    }

    /// Gather every slot's `value` under `key` and apply `reducer` to the
    /// list, which is identical (ascending by ordinal) on every slot.
    pub fn mesh_reduce<T, R, F>(
        &self,
        key: &str,
        value: &T,
        reducer: F,
    ) -> Result<R, CollectiveError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Vec<T>) -> R,
    {
        let request = CollectiveRequest::MeshReduce {
            key: key.to_string(),
            value: postcard::to_allocvec(value)?,
        };
        match self.call(request)? {
            CollectiveReply::Gathered(values) => {
                let values = values
                    .iter()
                    .map(|bytes| postcard::from_bytes(bytes))
                    .collect::<Result<Vec<T>, _>>()?;
                Ok(reducer(values))
            }
            other => Err(unexpected("gathered", &other)),
        }
    }

    pub fn all_gather<T>(&self, value: &T) -> Result<Vec<T>, CollectiveError>
    where
        T: Serialize + DeserializeOwned,
    {
        self.mesh_reduce("all_gather", value, |values| values)
    }

    /// Block until every slot reached the barrier named `tag`.
    pub fn barrier(&self, tag: &str) -> Result<(), CollectiveError> {
        match self.call(CollectiveRequest::Barrier {
            tag: tag.to_string(),
        })? {
            CollectiveReply::Released => Ok(()),
            other => Err(unexpected("released", &other)),
        }
    }

    /// Deliver this slot's final outcome. Sent even on a poisoned channel so
    /// the launcher learns why the slot stopped.
    pub fn report(&self, outcome: Result<Vec<u8>, WorkerFailure>) -> Result<(), CollectiveError> {
        let mut connection = self.lock();
        write_frame(&mut connection.stream, &WorkerMessage::Report { outcome })?;
        match read_frame::<_, ServerMessage>(&mut connection.stream)? {
            ServerMessage::Ack => Ok(()),
            other => Err(CollectiveError::Protocol {
                expected: "ack",
                got: other.kind(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn call(&self, request: CollectiveRequest) -> Result<CollectiveReply, CollectiveError> {
        let mut connection = self.lock();
        let seq = connection.next_seq;
        connection.next_seq += 1;

        if let Some(detail) = &connection.poisoned {
            return Err(CollectiveError::Aborted {
                seq,
                detail: detail.clone(),
            });
        }

        trace!(
            seq,
            kind = request.kind(),
            ordinal = %self.identity.global_ordinal,
            "collective call"
        );
        let result = exchange(&mut connection.stream, seq, request, self.timeout);
        if let Err(err) = &result {
            connection.poisoned = Some(err.to_string());
        }
        result
    }
}

fn exchange(
    stream: &mut TcpStream,
    seq: u64,
    request: CollectiveRequest,
    timeout: Duration,
) -> Result<CollectiveReply, CollectiveError> {
    write_frame(stream, &WorkerMessage::Collective { seq, request })?;
    let message = read_frame::<_, ServerMessage>(stream).map_err(|err| match err {
        CollectiveError::Transport(source)
            if matches!(source.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
        {
            CollectiveError::Timeout {
                seq,
                detail: format!("no reply from rendezvous within {timeout:?}"),
            }
        }
        other => other,
    })?;

    match message {
        ServerMessage::Collective {
            seq: reply_seq,
            reply,
        } if reply_seq == seq => match reply {
            CollectiveReply::Failed(failure) => Err(CollectiveError::from_failure(seq, failure)),
            reply => Ok(reply),
        },
        other => Err(CollectiveError::Protocol {
            expected: "collective",
            got: other.kind(),
        }),
    }
}

// integer casts truncate
fn is_integral<N: NumCast>() -> bool {
    num_traits::cast::<f64, N>(0.5).and_then(num_traits::cast::<N, f64>) != Some(0.5)
}

fn cast_all<A, B>(values: &[A]) -> Result<Vec<B>, CollectiveError>
where
    A: NumCast + Copy,
    B: NumCast,
{
    values
        .iter()
        .enumerate()
        .map(|(index, value)| {
            num_traits::cast::<A, B>(*value).ok_or(CollectiveError::Unrepresentable { index })
        })
        .collect()
}

fn scale_integer<N>(sum: i128, scale: f64) -> Option<N>
where
    N: NumCast + Copy + PartialEq,
{
    if scale == 1.0 {
        return num_traits::cast::<i128, N>(sum);
    }
    let exact = sum as f64;
    if exact as i128 != sum {
        return None;
    }
    let scaled = exact * scale;
    let value = num_traits::cast::<f64, N>(scaled)?;
    (num_traits::cast::<N, f64>(value) == Some(scaled)).then_some(value)
}

fn unexpected(expected: &'static str, reply: &CollectiveReply) -> CollectiveError {
    CollectiveError::Protocol {
        expected,
        got: reply.kind(),
    }
}
