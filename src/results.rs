//! Case results, the in-memory results index and the test-run store

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::case_id::CaseId;
use crate::catalog::CaseDescriptor;
use crate::error::{Error, StorageError};
use crate::outcome::{ClosingFacts, CloseOutcomeTag, Event, ExpectedClose, ExpectedEvents, OutcomeTag};
use crate::spec::Mode;
use crate::trace::{CompressionStats, TraceSnapshot};
use crate::wamp::WampOutcome;

/// Frozen outcome of one case against one agent
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseResult {
    /// 1-based position in the server's case list
    pub case: usize,
    pub id: CaseId,
    pub description: String,
    pub expectation: String,
    pub agent: String,
    /// `Server` or `User-Agent` header the peer sent
    pub remote_agent: Option<String>,
    pub started: DateTime<Utc>,
    pub ended: DateTime<Utc>,
    /// Milliseconds
    pub duration: u64,
    pub report_time: bool,
    pub report_compression_ratio: bool,
    pub behavior: OutcomeTag,
    pub behavior_close: CloseOutcomeTag,
    pub result: String,
    pub result_close: String,
    pub expected: ExpectedEvents,
    pub expected_close: ExpectedClose,
    pub received: Vec<Event>,
    #[serde(flatten)]
    pub facts: ClosingFacts,
    pub is_server: bool,
    pub wire_log: TraceSnapshot,
    pub traffic_stats: Option<CompressionStats>,
    pub http_request: Option<String>,
    pub http_response: Option<String>,
    /// Sessions, expectations and log of a WAMP case
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wamp: Option<WampOutcome>,
}

impl CaseResult {
    /// Result for a case whose connection never opened
    pub fn connection_failed(
        case: usize,
        descriptor: &CaseDescriptor,
        agent: &str,
        started: DateTime<Utc>,
        err: &Error,
    ) -> Self {
        let ended = Utc::now();
        let reason = format!("Could not run case: {}", err);
        let facts = ClosingFacts {
            was_open_handshake_timeout: err.is_timeout(),
            was_not_clean_reason: Some(reason.clone()),
            ..ClosingFacts::default()
        };
        Self {
            case,
            id: descriptor.id.clone(),
            description: descriptor.description.clone(),
            expectation: descriptor.expectation.clone(),
            agent: agent.to_string(),
            remote_agent: None,
            started,
            ended,
            duration: elapsed_ms(started, ended),
            report_time: false,
            report_compression_ratio: false,
            behavior: OutcomeTag::Failed,
            behavior_close: CloseOutcomeTag::Failed,
            result: reason.clone(),
            result_close: reason,
            expected: ExpectedEvents::new(),
            expected_close: ExpectedClose::normal(),
            received: Vec::new(),
            facts,
            is_server: false,
            wire_log: TraceSnapshot::default(),
            traffic_stats: None,
            http_request: None,
            http_response: None,
            wamp: None,
        }
    }
}

pub(crate) fn elapsed_ms(started: DateTime<Utc>, ended: DateTime<Utc>) -> u64 {
    (ended - started).num_milliseconds().max(0) as u64
}

/// Where finished case results go
pub trait ResultSink: Send + Sync {
    fn log_case(&self, result: Arc<CaseResult>);
}

#[derive(Default)]
struct IndexInner {
    by_agent: BTreeMap<String, BTreeMap<CaseId, Arc<CaseResult>>>,
    by_case: BTreeMap<CaseId, BTreeMap<String, Arc<CaseResult>>>,
    listeners: Vec<(String, CaseId, oneshot::Sender<Arc<CaseResult>>)>,
}

/// Results of the current process, keyed both ways
///
/// The newest result for an (agent, case) pair replaces older ones.
#[derive(Default)]
pub struct ResultsIndex {
    inner: Mutex<IndexInner>,
}

impl ResultsIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, agent: &str, id: &CaseId) -> Option<Arc<CaseResult>> {
        self.inner.lock().by_agent.get(agent)?.get(id).cloned()
    }

    pub fn agents(&self) -> Vec<String> {
        self.inner.lock().by_agent.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().by_agent.is_empty()
    }

    /// One agent's results in case order
    pub fn agent_results(&self, agent: &str) -> Vec<Arc<CaseResult>> {
        self.inner
            .lock()
            .by_agent
            .get(agent)
            .map(|cases| cases.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every agent's result for one case
    pub fn case_results(&self, id: &CaseId) -> BTreeMap<String, Arc<CaseResult>> {
        self.inner.lock().by_case.get(id).cloned().unwrap_or_default()
    }

    /// Copy of the whole agent → case → result map
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<CaseId, Arc<CaseResult>>> {
        self.inner.lock().by_agent.clone()
    }

    /// Resolve with the result for (agent, case), now or once it is logged
    pub fn listen(&self, agent: &str, id: &CaseId) -> oneshot::Receiver<Arc<CaseResult>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        match inner.by_agent.get(agent).and_then(|cases| cases.get(id)) {
            Some(result) => {
                let _ = tx.send(result.clone());
            }
            None => inner.listeners.push((agent.to_string(), id.clone(), tx)),
        }
        rx
    }
}

impl ResultSink for ResultsIndex {
    fn log_case(&self, result: Arc<CaseResult>) {
        let mut inner = self.inner.lock();
        inner
            .by_agent
            .entry(result.agent.clone())
            .or_default()
            .insert(result.id.clone(), result.clone());
        inner
            .by_case
            .entry(result.id.clone())
            .or_default()
            .insert(result.agent.clone(), result.clone());

        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.listeners)
            .into_iter()
            .partition(|(agent, id, _)| *agent == result.agent && *id == result.id);
        inner.listeners = waiting;
        drop(inner);

        for (_, _, tx) in ready {
            let _ = tx.send(result.clone());
        }
    }
}

/// One persisted test run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRun {
    pub id: String,
    pub spec_name: String,
    pub mode: Mode,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    pub results: Vec<Arc<CaseResult>>,
}

/// In-memory store of test runs and their results
#[derive(Default)]
pub struct RunStore {
    runs: Mutex<HashMap<String, TestRun>>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a run and return its id
    pub fn new_run(&self, spec_name: &str, mode: Mode) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let run = TestRun {
            id: id.clone(),
            spec_name: spec_name.to_string(),
            mode,
            started: Utc::now(),
            ended: None,
            results: Vec::new(),
        };
        self.runs.lock().insert(id.clone(), run);
        tracing::debug!(run = %id, spec = spec_name, "test run opened");
        id
    }

    pub fn save_result(&self, run_id: &str, result: Arc<CaseResult>) -> Result<(), StorageError> {
        let mut runs = self.runs.lock();
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| StorageError::NoSuchRun(run_id.to_string()))?;
        if run.ended.is_some() {
            return Err(StorageError::RunClosed(run_id.to_string()));
        }
        run.results.push(result);
        Ok(())
    }

    pub fn close_run(&self, run_id: &str) -> Result<(), StorageError> {
        let mut runs = self.runs.lock();
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| StorageError::NoSuchRun(run_id.to_string()))?;
        if run.ended.is_some() {
            return Err(StorageError::RunClosed(run_id.to_string()));
        }
        run.ended = Some(Utc::now());
        tracing::debug!(run = %run_id, results = run.results.len(), "test run closed");
        Ok(())
    }

    pub fn results(&self, run_id: &str) -> Result<Vec<Arc<CaseResult>>, StorageError> {
        self.runs
            .lock()
            .get(run_id)
            .map(|run| run.results.clone())
            .ok_or_else(|| StorageError::NoSuchRun(run_id.to_string()))
    }

    pub fn run(&self, run_id: &str) -> Option<TestRun> {
        self.runs.lock().get(run_id).cloned()
    }
}
