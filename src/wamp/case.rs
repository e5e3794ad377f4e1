//! WAMP case orchestration
//!
//! A [`WampCase`] opens every session its scenario needs, drives them
//! through the scenario's phases and compares what each session observed
//! with what it should have. Waits between phases are multiples of the
//! testee's `rtt` option, since WAMPv1 has no subscribe acknowledgement.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

use super::message::{PublishOptions, WampMessage};
use super::peer::{PeerEvent, PeerHandle, PeerNotice};
use super::scenario::{PubSubScenario, Publication, RpcEchoScenario, WampScenario};
use super::{LogEntry, Transcript, CONTROL_DISPATCH, SUBPROTOCOL};
use crate::catalog::{CaseCatalog, CaseDescriptor};
use crate::client::ClientRun;
use crate::error::{Error, Result};
use crate::outcome::{ClosingFacts, CloseOutcomeTag, ExpectedClose, ExpectedEvents, OutcomeTag};
use crate::report::{write_reports, ResultTable};
use crate::results::{elapsed_ms, CaseResult, RunStore};
use crate::script::Script;
use crate::sequencer::{CaseExecutor, StoreObserver, TestRunSequencer};
use crate::session::{SessionConfig, DEFAULT_AGENT};
use crate::spec::{Mode, ProtocolOptions, Spec};
use crate::trace::TraceSnapshot;

/// Round trips to wait after subscribing, before the first publication
const SUBSCRIBE_SETTLE_RTTS: f64 = 2.5;
/// Round trips to wait for events after the last publication
const DELIVERY_RTTS: f64 = 1.5;
/// Round trips allowed for call results
const CALL_RTTS: f64 = 3.0;

/// What a WAMP case saw, attached to its [`CaseResult`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WampOutcome {
    /// Session id (pub/sub) or call index (RPC) to expected items
    pub expected: BTreeMap<String, Vec<Value>>,
    pub observed: BTreeMap<String, Vec<Value>>,
    pub client_errors: Vec<String>,
    /// Server ident from the first WELCOME
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    pub log: Vec<LogEntry>,
}

impl WampOutcome {
    pub fn passed(&self) -> bool {
        self.client_errors.is_empty() && self.expected == self.observed
    }

    pub fn verdict(&self) -> String {
        if !self.client_errors.is_empty() {
            format!("Client errors: {}", self.client_errors.join("; "))
        } else if self.passed() {
            "Observed WAMP traffic matches the expectation.".to_string()
        } else {
            "Observed WAMP traffic differs from the expectation.".to_string()
        }
    }
}

enum Reply {
    Result(Value),
    Error(String),
}

/// The running sessions of one case
struct Sessions {
    peers: Vec<PeerHandle>,
    notices: mpsc::UnboundedReceiver<PeerNotice>,
    ids: Vec<Option<String>>,
    gone: Vec<bool>,
    server: Option<String>,
    events: Vec<Vec<Value>>,
    replies: HashMap<String, Reply>,
    errors: Vec<String>,
    transcript: Transcript,
}

impl Sessions {
    fn spawn(count: usize, url: &Url, config: &SessionConfig, transcript: Transcript) -> Self {
        let (tx, notices) = mpsc::unbounded_channel();
        let peers = (0..count)
            .map(|i| PeerHandle::spawn(i, url.clone(), config.clone(), tx.clone(), transcript.clone()))
            .collect();
        Self {
            peers,
            notices,
            ids: vec![None; count],
            gone: vec![false; count],
            server: None,
            events: vec![Vec::new(); count],
            replies: HashMap::new(),
            errors: Vec::new(),
            transcript,
        }
    }

    fn log(&self, peer: usize, message: impl Into<String>) {
        self.transcript.push(Some(peer), self.ids[peer].as_deref(), message);
    }

    fn handle(&mut self, notice: PeerNotice) {
        let peer = notice.peer;
        match notice.event {
            PeerEvent::Welcome { session, server } => {
                self.ids[peer] = Some(session);
                self.server.get_or_insert(server);
            }
            PeerEvent::Event { topic, event } => {
                self.log(peer, format!("Received event for topic {} and payload {}", topic, event));
                self.events[peer].push(json!([topic, event]));
            }
            PeerEvent::CallResult { call_id, result } => {
                self.replies.insert(call_id, Reply::Result(result));
            }
            PeerEvent::CallError {
                call_id,
                error,
                description,
            } => {
                self.replies
                    .insert(call_id, Reply::Error(format!("{}: {}", error, description)));
            }
            PeerEvent::Gone { error } => {
                self.gone[peer] = true;
                match error {
                    Some(e) => self.errors.push(format!("session {}: {}", peer, e)),
                    None if self.ids[peer].is_none() => self
                        .errors
                        .push(format!("session {}: closed before WELCOME", peer)),
                    None => {}
                }
            }
        }
    }

    /// Handle notices until `done` holds or `deadline` passes
    async fn pump_until(&mut self, deadline: Instant, done: impl Fn(&Sessions) -> bool) -> bool {
        loop {
            if done(self) {
                return true;
            }
            match tokio::time::timeout_at(deadline, self.notices.recv()).await {
                Ok(Some(notice)) => self.handle(notice),
                Ok(None) | Err(_) => return done(self),
            }
        }
    }

    async fn sleep(&mut self, wait: Duration) {
        self.transcript
            .note(format!("Sleeping for {} ms ...", wait.as_millis()));
        self.pump_until(Instant::now() + wait, |_| false).await;
        self.transcript.note("Continuing test ..");
    }

    /// Wait for every session's WELCOME; false when any failed
    async fn open(&mut self, within: Duration) -> bool {
        let opened = |s: &Sessions| s.ids.iter().zip(&s.gone).all(|(id, gone)| id.is_some() || *gone);
        if !self.pump_until(Instant::now() + within, opened).await {
            for (i, id) in self.ids.iter().enumerate() {
                if id.is_none() && !self.gone[i] {
                    self.errors
                        .push(format!("session {}: no WELCOME within {} ms", i, within.as_millis()));
                }
            }
        }
        self.errors.is_empty()
    }

    async fn close(&mut self, within: Duration) {
        for peer in &mut self.peers {
            peer.close();
        }
        let closed = self.pump_until(Instant::now() + within, |s| s.gone.iter().all(|g| *g)).await;
        if !closed {
            tracing::debug!("WAMP sessions still open after close, aborting them");
        }
    }

    fn session_id(&self, peer: usize) -> String {
        self.ids
            .get(peer)
            .cloned()
            .flatten()
            .unwrap_or_else(|| format!("session-{}", peer))
    }
}

impl Drop for Sessions {
    fn drop(&mut self) {
        for peer in &self.peers {
            peer.abort();
        }
    }
}

/// One WAMP scenario against one testee
pub struct WampCase {
    url: Url,
    config: SessionConfig,
    options: ProtocolOptions,
    scenario: WampScenario,
}

impl WampCase {
    pub fn new(url: Url, options: &ProtocolOptions, scenario: WampScenario) -> Self {
        let mut config = SessionConfig::from_options(options, DEFAULT_AGENT);
        config.protocols = vec![SUBPROTOCOL.to_string()];
        Self {
            url,
            config,
            options: options.clone(),
            scenario,
        }
    }

    pub async fn run(&self) -> WampOutcome {
        let transcript = Transcript::new();
        transcript.note("Test started.");
        let mut sessions = Sessions::spawn(
            self.scenario.session_count(),
            &self.url,
            &self.config,
            transcript.clone(),
        );

        let mut outcome = WampOutcome::default();
        let open_within = self.options.open_handshake_timeout() + self.options.rtt(1.0);
        if sessions.open(open_within).await {
            match &self.scenario {
                WampScenario::PubSub(s) => self.pubsub(&mut sessions, s, &mut outcome).await,
                WampScenario::RpcEcho(s) => self.rpc_echo(&mut sessions, s, &mut outcome).await,
            }
        }

        let close_within = self.options.close_handshake_timeout()
            + self.options.server_connection_drop_timeout()
            + self.options.rtt(1.0);
        sessions.close(close_within).await;
        transcript.note("Test ended.");

        outcome.client_errors = std::mem::take(&mut sessions.errors);
        outcome.server = sessions.server.take();
        outcome.log = transcript.snapshot();
        outcome
    }

    async fn pubsub(&self, sessions: &mut Sessions, s: &PubSubScenario, outcome: &mut WampOutcome) {
        let suffix = format!("#{}", fastrand::u32(0..=1_000_000));
        for (i, topics) in s.peers.iter().enumerate() {
            for topic in topics {
                let topic = format!("{}{}", topic, suffix);
                sessions.peers[i].send(&WampMessage::Subscribe { topic: topic.clone() });
                sessions.log(i, format!("Subscribed to {}", topic));
            }
        }
        sessions.sleep(self.options.rtt(SUBSCRIBE_SETTLE_RTTS)).await;

        let ids: Vec<String> = (0..s.peers.len()).map(|i| sessions.session_id(i)).collect();
        let by_index = |list: &Option<Vec<usize>>| {
            list.as_ref()
                .map(|l| l.iter().filter_map(|i| ids.get(*i).cloned()).collect::<Vec<_>>())
        };
        let options = PublishOptions {
            exclude_me: s.exclude_me,
            exclude: by_index(&s.exclude),
            eligible: by_index(&s.eligible),
            me: None,
        };
        let shown = if options.is_empty() {
            "-".to_string()
        } else {
            json!(options).to_string()
        };
        let publisher = &ids[0];
        let topic = format!("{}{}", s.topic, suffix);

        for id in &ids {
            outcome.expected.insert(id.clone(), Vec::new());
        }
        let mut pending = Vec::new();
        for (n, payload) in s.payloads.iter().enumerate() {
            match s.publication {
                Publication::Publish => {
                    sessions.peers[0].send(&WampMessage::Publish {
                        topic: topic.clone(),
                        event: payload.clone(),
                        routing: options.routing(publisher),
                    });
                    sessions.log(
                        0,
                        format!("Published event to topic {} with options {} and payload {}", topic, shown, payload),
                    );
                }
                Publication::Dispatch => {
                    let call_id = format!("dispatch-{}", n);
                    let args = PublishOptions {
                        me: Some(publisher.clone()),
                        ..options.clone()
                    };
                    sessions.peers[0].send(&WampMessage::Call {
                        call_id: call_id.clone(),
                        procedure: CONTROL_DISPATCH.to_string(),
                        args: vec![json!(topic), payload.clone(), json!(args)],
                    });
                    sessions.log(
                        0,
                        format!(
                            "Initiated server dispatched event to topic {} with options {} and payload {}",
                            topic, shown, payload
                        ),
                    );
                    pending.push(call_id);
                }
            }
            for r in &s.receivers {
                if let Some(id) = ids.get(*r) {
                    outcome
                        .expected
                        .entry(id.clone())
                        .or_default()
                        .push(json!([topic, payload]));
                }
            }
        }

        if !pending.is_empty() {
            let deadline = Instant::now() + self.options.rtt(CALL_RTTS);
            sessions
                .pump_until(deadline, |s| pending.iter().all(|id| s.replies.contains_key(id)))
                .await;
            let failed: Vec<String> = pending
                .iter()
                .filter_map(|id| match sessions.replies.get(id) {
                    Some(Reply::Result(_)) => None,
                    Some(Reply::Error(e)) => Some(e.clone()),
                    None => Some(format!("{} unanswered", id)),
                })
                .collect();
            sessions.transcript.note(if failed.is_empty() {
                format!("Event init call results: {} ok", pending.len())
            } else {
                format!("Event init call results: {}", failed.join("; "))
            });
        }

        sessions.sleep(self.options.rtt(DELIVERY_RTTS)).await;

        for (i, id) in ids.iter().enumerate() {
            outcome
                .observed
                .insert(id.clone(), std::mem::take(&mut sessions.events[i]));
        }
    }

    async fn rpc_echo(&self, sessions: &mut Sessions, s: &RpcEchoScenario, outcome: &mut WampOutcome) {
        let ids: Vec<String> = (0..s.values.len()).map(|i| i.to_string()).collect();
        for (id, value) in ids.iter().zip(&s.values) {
            sessions.peers[0].send(&WampMessage::Call {
                call_id: id.clone(),
                procedure: s.procedure.clone(),
                args: vec![Value::from(*value)],
            });
            outcome.expected.insert(id.clone(), vec![Value::from(*value)]);
        }
        sessions.log(0, format!("Called {} {} times", s.procedure, ids.len()));

        let deadline = Instant::now() + self.options.rtt(CALL_RTTS);
        sessions
            .pump_until(deadline, |s| ids.iter().all(|id| s.replies.contains_key(id)))
            .await;

        for id in &ids {
            match sessions.replies.remove(id) {
                Some(Reply::Result(result)) => {
                    let result = result.as_f64().map(Value::from).unwrap_or(result);
                    outcome.observed.insert(id.clone(), vec![result]);
                }
                Some(Reply::Error(e)) => sessions.log(0, format!("Call {} failed: {}", id, e)),
                None => sessions.log(0, format!("Call {} unanswered", id)),
            }
        }
    }
}

fn case_result(
    index: usize,
    descriptor: &CaseDescriptor,
    agent: &str,
    options: &ProtocolOptions,
    started: DateTime<Utc>,
    outcome: WampOutcome,
) -> CaseResult {
    let ended = Utc::now();
    let behavior = if outcome.passed() {
        OutcomeTag::Ok
    } else {
        OutcomeTag::Failed
    };
    CaseResult {
        case: index,
        id: descriptor.id.clone(),
        description: descriptor.description.clone(),
        expectation: descriptor.expectation.clone(),
        agent: agent.to_string(),
        remote_agent: outcome.server.clone(),
        started,
        ended,
        duration: elapsed_ms(started, ended),
        report_time: options.rtts(),
        report_compression_ratio: false,
        behavior,
        behavior_close: CloseOutcomeTag::Informational,
        result: outcome.verdict(),
        result_close: "Closing behavior is not assessed for WAMP cases.".to_string(),
        expected: ExpectedEvents::new(),
        expected_close: ExpectedClose::normal(),
        received: Vec::new(),
        facts: ClosingFacts::default(),
        is_server: false,
        wire_log: TraceSnapshot::default(),
        traffic_stats: None,
        http_request: None,
        http_response: None,
        wamp: Some(outcome),
    }
}

/// Runs WAMP cases against testee brokers
pub struct WampClient {
    spec: Arc<Spec>,
}

impl WampClient {
    pub fn new(spec: Arc<Spec>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl CaseExecutor for WampClient {
    async fn run_case(
        &self,
        testee: &crate::spec::Testee,
        index: usize,
        descriptor: Arc<CaseDescriptor>,
    ) -> Result<Arc<CaseResult>> {
        let Script::Wamp(scenario) = &descriptor.script else {
            return Err(Error::CaseInternal(format!("case {} is not a WAMP case", descriptor.id)));
        };
        let url = Url::parse(&testee.url)
            .map_err(|e| Error::HandshakeFailed(format!("invalid testee url '{}': {}", testee.url, e)))?;
        let options = self.spec.options_for(testee);
        let started = Utc::now();

        tracing::debug!(
            case = %descriptor.id,
            agent = testee.agent(),
            sessions = scenario.session_count(),
            "running WAMP case"
        );
        let outcome = WampCase::new(url, &options, scenario.clone()).run().await;
        Ok(Arc::new(case_result(
            index,
            &descriptor,
            testee.agent(),
            &options,
            started,
            outcome,
        )))
    }
}

/// Run the WAMP case set against every testee of `spec` and write the reports
pub async fn run_fuzzing_wamp_client(spec: Spec, catalog: Arc<CaseCatalog>) -> Result<ClientRun> {
    let mode = Mode::FuzzingWampClient;
    spec.check(mode, &catalog)?;
    for testee in spec.servers.iter().filter(|t| t.auth.is_some()) {
        tracing::warn!(agent = testee.agent(), "WAMP-CRA authentication is not supported, connecting anonymously");
    }
    let outdir = spec.outdir(mode);
    let spec = Arc::new(spec);

    let store = Arc::new(RunStore::new());
    let run_id = store.new_run(mode.as_str(), mode);

    let executor = Arc::new(WampClient::new(spec.clone()));
    let mut sequencer = TestRunSequencer::new(catalog.clone(), executor);
    sequencer.observe(Arc::new(StoreObserver::new(store.clone(), spec.servers.len())));

    let results = sequencer.run(&run_id, &spec).await?;

    let mut table = ResultTable::new();
    for result in store.results(&run_id)? {
        table
            .entry(result.agent.clone())
            .or_default()
            .insert(result.id.clone(), result);
    }
    let reports = write_reports(&outdir, &catalog, &table)?;
    tracing::info!(run = %run_id, summary = %reports.summary.display(), "WAMP fuzzing client finished");

    Ok(ClientRun {
        run_id,
        results,
        reports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wamp::{run_wamp_testee_server, Broker};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::sync::broadcast;

    const SIMPLE: &str = "http://example.com/simple";

    async fn broker() -> (SocketAddr, broadcast::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, _) = broadcast::channel(1);
        let config = SessionConfig::from_options(&ProtocolOptions::default(), "TestBroker/1.0");
        tokio::spawn(run_wamp_testee_server(
            listener,
            config,
            Arc::new(Broker::testsuite("TestBroker/1.0")),
            shutdown.clone(),
        ));
        (addr, shutdown)
    }

    fn fast() -> ProtocolOptions {
        ProtocolOptions {
            rtt: Some(0.05),
            ..Default::default()
        }
    }

    fn two_peers(publication: Publication, exclude_me: Option<bool>, eligible: Option<Vec<usize>>, receivers: Vec<usize>) -> WampScenario {
        WampScenario::PubSub(PubSubScenario {
            peers: vec![vec![SIMPLE.into()], vec![SIMPLE.into()]],
            topic: SIMPLE.into(),
            publication,
            exclude_me,
            exclude: None,
            eligible,
            payloads: vec![json!("Hello, world!"), json!({"a": [1, 2]})],
            receivers,
        })
    }

    async fn run(addr: SocketAddr, scenario: WampScenario) -> WampOutcome {
        let url = Url::parse(&format!("ws://{}", addr)).unwrap();
        WampCase::new(url, &fast(), scenario).run().await
    }

    #[tokio::test]
    async fn test_publish_reaches_expected_sessions() {
        let (addr, _shutdown) = broker().await;
        let outcome = run(addr, two_peers(Publication::Publish, Some(false), None, vec![0, 1])).await;
        assert!(outcome.passed(), "{:?}", outcome);
        assert_eq!(outcome.server.as_deref(), Some("TestBroker/1.0"));
        assert!(outcome.observed.values().all(|events| events.len() == 2));
        assert!(outcome.log.iter().any(|e| e.message.starts_with("TX => [5,")));
    }

    #[tokio::test]
    async fn test_wrong_receivers_fail() {
        let (addr, _shutdown) = broker().await;
        // default routing skips the publisher, which the expectation forgets
        let outcome = run(addr, two_peers(Publication::Publish, None, None, vec![0, 1])).await;
        assert!(outcome.client_errors.is_empty());
        assert!(!outcome.passed());
        assert_eq!(outcome.verdict(), "Observed WAMP traffic differs from the expectation.");
    }

    #[tokio::test]
    async fn test_dispatch_honours_eligible() {
        let (addr, _shutdown) = broker().await;
        let outcome = run(addr, two_peers(Publication::Dispatch, None, Some(vec![1]), vec![1])).await;
        assert!(outcome.passed(), "{:?}", outcome);
        assert!(outcome
            .log
            .iter()
            .any(|e| e.message.starts_with("Event init call results: 2 ok")));
    }

    #[tokio::test]
    async fn test_rpc_echo() {
        let (addr, _shutdown) = broker().await;
        let scenario = WampScenario::RpcEcho(RpcEchoScenario {
            procedure: format!("{}/3.1.1#1", crate::wamp::CASE_URI),
            values: vec![0.0, 127.0, -16777216.0],
        });
        let outcome = run(addr, scenario).await;
        assert!(outcome.passed(), "{:?}", outcome);
        assert_eq!(outcome.observed.len(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_testee_is_client_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let outcome = run(addr, two_peers(Publication::Publish, None, None, vec![1])).await;
        assert_eq!(outcome.client_errors.len(), 2);
        assert!(!outcome.passed());
        assert!(outcome.verdict().starts_with("Client errors: "));
        assert!(outcome.observed.is_empty());
    }

    #[tokio::test]
    async fn test_fuzzing_wamp_client_run() {
        let (addr, shutdown) = broker().await;
        let dir = tempfile::tempdir().unwrap();
        let spec = Spec::from_json(&format!(
            r#"{{"outdir": {:?}, "caseset": "wamp", "cases": ["2.2.3.1", "3.1.1.1"],
                "options": {{"rtt": 0.05}},
                "servers": [{{"agent": "Broker", "url": "ws://{}"}}]}}"#,
            dir.path().display().to_string(),
            addr
        ))
        .unwrap();
        let run = run_fuzzing_wamp_client(spec, Arc::new(CaseCatalog::wamp().unwrap()))
            .await
            .unwrap();
        let _ = shutdown.send(());

        let results = &run.results["Broker"];
        assert_eq!(results.len(), 2);
        for result in results {
            assert_eq!(result.behavior, OutcomeTag::Ok, "{}: {}", result.id, result.result);
            assert_eq!(result.remote_agent.as_deref(), Some("TestBroker/1.0"));
            assert!(result.wamp.is_some());
        }
        assert!(run.reports.summary.exists());
    }

    #[tokio::test]
    async fn test_non_wamp_case_rejected() {
        let spec = Arc::new(Spec::template(Mode::FuzzingWampClient));
        let standard = CaseCatalog::standard().unwrap();
        let descriptor = standard.by_index(1).unwrap().clone();
        let err = WampClient::new(spec.clone())
            .run_case(&spec.servers[0], 1, descriptor)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CaseInternal(_)));
    }
}
