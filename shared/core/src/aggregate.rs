use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::{GlobalOrdinal, OrdinalRegistry, ProcessIndex, Topology};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The user function returned an error.
    User,
    /// The user function panicked.
    Panic,
    /// The execution engine could not bind the slot's device.
    Device,
    CollectiveTimeout,
    CollectiveMismatch,
    /// A collective was cut short because the fleet failed elsewhere.
    CollectiveAborted,
    /// A worker process exited before every slot reported.
    Crashed,
    /// A worker connection dropped before its slot reported.
    Disconnected,
}

impl FailureKind {
    pub fn kind(&self) -> &'static str {
        match self {
            FailureKind::User => "user_error",
            FailureKind::Panic => "panic",
            FailureKind::Device => "device_error",
            FailureKind::CollectiveTimeout => "collective_timeout",
            FailureKind::CollectiveMismatch => "collective_mismatch",
            FailureKind::CollectiveAborted => "collective_aborted",
            FailureKind::Crashed => "crashed",
            FailureKind::Disconnected => "disconnected",
        }
    }
}

/// A failure attributed to the worker (and, when known, the device slot) that
/// produced it. Serialized across the process boundary as a plain value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub process_index: ProcessIndex,
    pub global_ordinal: Option<GlobalOrdinal>,
    pub kind: FailureKind,
    pub cause: String,
}

impl WorkerFailure {
    pub fn new(
        process_index: ProcessIndex,
        global_ordinal: Option<GlobalOrdinal>,
        kind: FailureKind,
        cause: impl Into<String>,
    ) -> Self {
        Self {
            process_index,
            global_ordinal,
            kind,
            cause: cause.into(),
        }
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on process {}", self.kind.kind(), self.process_index)?;
        if let Some(ordinal) = self.global_ordinal {
            write!(f, " ordinal {ordinal}")?;
        }
        write!(f, ": {}", self.cause)
    }
}

pub type WorkerResult<T> = Result<T, WorkerFailure>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregateError {
    #[error("worker failed: {0}")]
    Worker(WorkerFailure),

    #[error("ordinal {global_ordinal} is not owned by process {process_index}")]
    Misattributed {
        process_index: ProcessIndex,
        global_ordinal: GlobalOrdinal,
    },

    #[error("process {process_index} ordinal {global_ordinal} reported twice")]
    Duplicate {
        process_index: ProcessIndex,
        global_ordinal: GlobalOrdinal,
    },

    #[error("{missing} of {expected} device results never reported")]
    Incomplete { missing: usize, expected: usize },
}

/// Per-worker return values keyed by process index, then global ordinal.
/// Both levels iterate in ascending key order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregatedResult<T> {
    processes: BTreeMap<ProcessIndex, BTreeMap<GlobalOrdinal, T>>,
}

impl<T> AggregatedResult<T> {
    pub fn get(&self, process_index: ProcessIndex, global_ordinal: GlobalOrdinal) -> Option<&T> {
        self.processes.get(&process_index)?.get(&global_ordinal)
    }

    pub fn process(&self, process_index: ProcessIndex) -> Option<&BTreeMap<GlobalOrdinal, T>> {
        self.processes.get(&process_index)
    }

    pub fn processes(&self) -> &BTreeMap<ProcessIndex, BTreeMap<GlobalOrdinal, T>> {
        &self.processes
    }

    /// Every value, ascending by global ordinal.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.processes.values().flat_map(|inner| inner.values())
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProcessIndex, GlobalOrdinal, &T)> {
        self.processes.iter().flat_map(|(process, inner)| {
            inner
                .iter()
                .map(move |(ordinal, value)| (*process, *ordinal, value))
        })
    }

    pub fn len(&self) -> usize {
        self.processes.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn try_map<U, E, F>(self, mut f: F) -> Result<AggregatedResult<U>, E>
    where
        F: FnMut(ProcessIndex, GlobalOrdinal, T) -> Result<U, E>,
    {
        let processes = self
            .processes
            .into_iter()
            .map(|(process, inner)| {
                let inner = inner
                    .into_iter()
                    .map(|(ordinal, value)| Ok((ordinal, f(process, ordinal, value)?)))
                    .collect::<Result<BTreeMap<_, _>, E>>()?;
                Ok((process, inner))
            })
            .collect::<Result<BTreeMap<_, _>, E>>()?;
        Ok(AggregatedResult { processes })
    }

    pub fn into_inner(self) -> BTreeMap<ProcessIndex, BTreeMap<GlobalOrdinal, T>> {
        self.processes
    }
}

/// Collects worker outcomes as they arrive, in any order, and produces the
/// final [`AggregatedResult`] once every device slot has reported.
#[derive(Debug)]
pub struct ResultAggregator<T> {
    registry: OrdinalRegistry,
    received: BTreeMap<ProcessIndex, BTreeMap<GlobalOrdinal, T>>,
    reported: BTreeSet<GlobalOrdinal>,
    first_failure: Option<WorkerFailure>,
}

impl<T> ResultAggregator<T> {
    pub fn new(topology: Topology) -> Self {
        Self {
            registry: topology.registry(),
            received: BTreeMap::new(),
            reported: BTreeSet::new(),
            first_failure: None,
        }
    }

    pub fn expected(&self) -> usize {
        self.registry.topology().total_devices()
    }

    /// Record the outcome of one device slot.
    ///
    /// Callers report each `(process_index, global_ordinal)` exactly once.
    pub fn record(
        &mut self,
        process_index: ProcessIndex,
        global_ordinal: GlobalOrdinal,
        result: WorkerResult<T>,
    ) -> Result<(), AggregateError> {
        if self.registry.process_index_of(global_ordinal).ok() != Some(process_index) {
            return Err(AggregateError::Misattributed {
                process_index,
                global_ordinal,
            });
        }
        if !self.reported.insert(global_ordinal) {
            return Err(AggregateError::Duplicate {
                process_index,
                global_ordinal,
            });
        }

        match result {
            Ok(value) => {
                self.received
                    .entry(process_index)
                    .or_default()
                    .insert(global_ordinal, value);
            }
            Err(failure) => self.fail(failure),
        }
        Ok(())
    }

    /// Record a fleet failure. Only the first one is kept.
    pub fn fail(&mut self, failure: WorkerFailure) {
        match &self.first_failure {
            None => self.first_failure = Some(failure),
            Some(first) => warn!(
                suppressed = %failure,
                first = %first,
                "suppressing failure after fleet already failed"
            ),
        }
    }

    pub fn first_failure(&self) -> Option<&WorkerFailure> {
        self.first_failure.as_ref()
    }

    pub fn has_failed(&self) -> bool {
        self.first_failure.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.reported.len() == self.expected()
    }

    /// Whether every slot of `process_index` delivered a value.
    pub fn process_complete(&self, process_index: ProcessIndex) -> bool {
        self.received
            .get(&process_index)
            .map(|inner| inner.len() == self.registry.topology().devices_per_process())
            .unwrap_or(false)
    }

    pub fn finalize(self) -> Result<AggregatedResult<T>, AggregateError> {
        if let Some(failure) = self.first_failure {
            return Err(AggregateError::Worker(failure));
        }
        let expected = self.expected();
        if self.reported.len() != expected {
            return Err(AggregateError::Incomplete {
                missing: expected - self.reported.len(),
                expected,
            });
        }
        Ok(AggregatedResult {
            processes: self.received,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn failure(process: usize, ordinal: usize, cause: &str) -> WorkerFailure {
        WorkerFailure::new(
            ProcessIndex(process),
            Some(GlobalOrdinal(ordinal)),
            FailureKind::User,
            cause,
        )
    }

    #[test]
    fn test_out_of_order_reports_are_normalized() {
        let topology = Topology::new(2, 2).unwrap();
        let mut aggregator = ResultAggregator::new(topology);
        for (process, ordinal) in [(1, 3), (0, 1), (1, 2), (0, 0)] {
            aggregator
                .record(ProcessIndex(process), GlobalOrdinal(ordinal), Ok(ordinal * 10))
                .unwrap();
        }
        assert!(aggregator.is_complete());
        assert!(aggregator.process_complete(ProcessIndex(1)));

        let result = aggregator.finalize().unwrap();
        let flattened: Vec<_> = result
            .iter()
            .map(|(p, o, v)| (p.get(), o.get(), *v))
            .collect();
        assert_eq!(flattened, vec![(0, 0, 0), (0, 1, 10), (1, 2, 20), (1, 3, 30)]);
        assert_eq!(result.len(), 4);
        assert_eq!(result.get(ProcessIndex(1), GlobalOrdinal(2)), Some(&20));
    }

    #[test]
    fn test_rejects_misattributed_and_duplicate_reports() {
        let mut aggregator = ResultAggregator::new(Topology::new(2, 2).unwrap());
        assert_eq!(
            aggregator.record(ProcessIndex(0), GlobalOrdinal(2), Ok(())),
            Err(AggregateError::Misattributed {
                process_index: ProcessIndex(0),
                global_ordinal: GlobalOrdinal(2)
            })
        );
        aggregator
            .record(ProcessIndex(0), GlobalOrdinal(1), Ok(()))
            .unwrap();
        assert!(matches!(
            aggregator.record(ProcessIndex(0), GlobalOrdinal(1), Ok(())),
            Err(AggregateError::Duplicate { .. })
        ));
    }

    #[test]
    fn test_first_failure_wins() {
        let mut aggregator = ResultAggregator::new(Topology::new(1, 4).unwrap());
        aggregator
            .record(ProcessIndex(0), GlobalOrdinal(0), Ok(0))
            .unwrap();
        aggregator
            .record(ProcessIndex(0), GlobalOrdinal(2), Err(failure(0, 2, "boom")))
            .unwrap();
        aggregator.fail(failure(0, 3, "aborted later"));
        assert!(aggregator.has_failed());

        assert_eq!(
            aggregator.finalize(),
            Err(AggregateError::Worker(failure(0, 2, "boom")))
        );
    }

    #[test]
    fn test_incomplete_finalize() {
        let mut aggregator = ResultAggregator::<u8>::new(Topology::new(1, 3).unwrap());
        aggregator
            .record(ProcessIndex(0), GlobalOrdinal(0), Ok(1))
            .unwrap();
        assert_eq!(
            aggregator.finalize(),
            Err(AggregateError::Incomplete {
                missing: 2,
                expected: 3
            })
        );
    }

    #[test]
    fn test_serializes_as_nested_map() {
        let mut aggregator = ResultAggregator::new(Topology::new(1, 2).unwrap());
        aggregator
            .record(ProcessIndex(0), GlobalOrdinal(1), Ok("b".to_string()))
            .unwrap();
        aggregator
            .record(ProcessIndex(0), GlobalOrdinal(0), Ok("a".to_string()))
            .unwrap();
        let json = serde_json::to_string(&aggregator.finalize().unwrap()).unwrap();
        assert_eq!(json, r#"{"0":{"0":"a","1":"b"}}"#);
    }

    #[test]
    fn test_failure_display_carries_attribution() {
        let failure = failure(1, 6, "division by zero");
        assert_eq!(
            failure.to_string(),
            "user_error on process 1 ordinal 6: division by zero"
        );
    }
}
