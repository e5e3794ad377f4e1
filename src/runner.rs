//! Per-connection case orchestration
//!
//! A [`CaseRunner`] is the session handler of one fuzzing connection. It is
//! bound to a case, to an administrative request or to direct-control
//! commands, forwards connection events to the bound case behavior, and
//! turns the finished connection into a [`CaseResult`].

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::broadcast;

use crate::case_id::CaseId;
use crate::catalog::{CaseCatalog, CaseDescriptor};
use crate::command::Command;
use crate::compression::{AcceptRule, PerMessageDeflateOffer};
use crate::connection::Connection;
use crate::corpus::{Corpus, DirCorpus, SyntheticCorpus};
use crate::error::{CaseSelectionError, CloseReason, Error, Result};
use crate::handshake::HandshakeRequest;
use crate::outcome::{classify, ClassifierInput, OutcomeTag};
use crate::pattern::{is_excluded_for_agent, AgentExclusion};
use crate::report::write_reports;
use crate::results::{elapsed_ms, CaseResult, ResultSink, ResultsIndex};
use crate::script::CaseBehavior;
use crate::session::{Deferred, SessionHandler};
use crate::spec::{Mode, ProtocolOptions, Spec};

/// Continuation tag of the per-case watchdog
const WATCHDOG_TAG: &str = "case-watchdog";

/// Shared, read-only state of a fuzzing process
pub struct FuzzingContext {
    pub catalog: Arc<CaseCatalog>,
    /// Cases addressable by 1-based index (server role)
    pub cases: Vec<CaseId>,
    pub agent_rules: Vec<AgentExclusion>,
    pub corpus: Arc<dyn Corpus>,
    pub results: Arc<ResultsIndex>,
    pub outdir: PathBuf,
    pub options: ProtocolOptions,
    pub shutdown: broadcast::Sender<()>,
}

impl FuzzingContext {
    /// Context for `mode`, with the spec's case list resolved once
    pub fn from_spec(spec: &Spec, mode: Mode, catalog: Arc<CaseCatalog>) -> Result<Self> {
        let cases = match mode {
            Mode::FuzzingServer | Mode::TesteeServer => spec.server_cases(&catalog)?,
            Mode::FuzzingClient | Mode::TesteeClient | Mode::FuzzingWampClient => catalog.ids().cloned().collect(),
        };
        let corpus: Arc<dyn Corpus> = match &spec.testdata {
            Some(dir) => Arc::new(DirCorpus::new(dir)),
            None => Arc::new(SyntheticCorpus),
        };
        let (shutdown, _) = broadcast::channel(1);
        Ok(Self {
            agent_rules: spec.agent_rules(&catalog)?,
            cases,
            catalog,
            corpus,
            results: Arc::new(ResultsIndex::new()),
            outdir: spec.outdir(mode),
            options: spec.options.clone(),
            shutdown,
        })
    }

    /// Resolve the `case` / `casetuple` connection parameters
    fn select_case(&self, request: &HandshakeRequest) -> Result<Option<(usize, Arc<CaseDescriptor>)>> {
        let index = if let Some(tuple) = request.query_param("casetuple") {
            let id: CaseId = tuple
                .parse()
                .map_err(|_| CaseSelectionError::InvalidParameter(tuple.to_string()))?;
            let pos = self
                .cases
                .iter()
                .position(|c| *c == id)
                .ok_or_else(|| CaseSelectionError::UnknownCaseId(tuple.to_string()))?;
            pos + 1
        } else if let Some(raw) = request.query_param("case") {
            let index: usize = raw
                .parse()
                .map_err(|_| CaseSelectionError::InvalidParameter(raw.to_string()))?;
            if index < 1 || index > self.cases.len() {
                return Err(CaseSelectionError::OutOfRange {
                    requested: index,
                    count: self.cases.len(),
                }
                .into());
            }
            index
        } else {
            return Ok(None);
        };

        let id = &self.cases[index - 1];
        let descriptor = self
            .catalog
            .get(id)
            .cloned()
            .ok_or_else(|| CaseSelectionError::UnknownCaseId(id.to_string()))?;
        Ok(Some((index, descriptor)))
    }
}

/// Requests served on paths other than `/runCase`
#[derive(Debug, Clone)]
enum AdminAction {
    UpdateReports { shutdown: bool },
    GetCaseCount,
    GetCaseStatus { agent: String, id: CaseId },
    GetCaseInfo(Arc<CaseDescriptor>),
    StopServer,
}

struct ActiveCase {
    descriptor: Arc<CaseDescriptor>,
    index: usize,
    agent: String,
    behavior: Box<dyn CaseBehavior>,
    started: DateTime<Utc>,
    deadline: f64,
    timed_out: bool,
    excluded: bool,
    /// Report the duration even if the case does not ask for it
    rtts: bool,
}

enum Binding {
    /// Server role before the upgrade request was seen
    Pending,
    Case(ActiveCase),
    Admin(AdminAction),
    /// No case: text messages are direct-control commands
    Direct,
}

/// Session handler that runs one case, admin request or command stream
pub struct CaseRunner {
    ctx: Arc<FuzzingContext>,
    binding: Binding,
    deferred: Option<Deferred>,
    result: Option<Arc<CaseResult>>,
}

impl CaseRunner {
    /// Server role: bound once the upgrade request arrives
    pub fn new(ctx: Arc<FuzzingContext>) -> Self {
        Self {
            ctx,
            binding: Binding::Pending,
            deferred: None,
            result: None,
        }
    }

    /// Client role: bound to one case up front
    pub fn for_case(
        ctx: Arc<FuzzingContext>,
        index: usize,
        descriptor: Arc<CaseDescriptor>,
        agent: &str,
        options: &ProtocolOptions,
    ) -> Result<Self> {
        let mut active = Self::activate(&ctx, index, descriptor, agent)?;
        active.rtts = options.rtts();
        Ok(Self {
            ctx,
            binding: Binding::Case(active),
            deferred: None,
            result: None,
        })
    }

    fn activate(
        ctx: &FuzzingContext,
        index: usize,
        descriptor: Arc<CaseDescriptor>,
        agent: &str,
    ) -> Result<ActiveCase> {
        let behavior = descriptor.script.instantiate(ctx.corpus.as_ref())?;
        Ok(ActiveCase {
            index,
            agent: agent.to_string(),
            behavior,
            started: Utc::now(),
            deadline: descriptor.script.deadline_secs(),
            timed_out: false,
            excluded: is_excluded_for_agent(&ctx.agent_rules, agent, &descriptor.id),
            rtts: ctx.options.rtts(),
            descriptor,
        })
    }

    /// Result of the finished case, once the connection is gone
    pub fn take_result(&mut self) -> Option<Arc<CaseResult>> {
        self.result.take()
    }

    fn bind_request(&mut self, request: &HandshakeRequest) -> Result<Binding> {
        let agents: Vec<&str> = request
            .query
            .iter()
            .filter(|(k, _)| k == "agent")
            .map(|(_, v)| v.as_str())
            .collect();
        if agents.len() > 1 {
            return Err(CaseSelectionError::InvalidParameter("multiple agents".into()).into());
        }
        let agent = agents.first().map(|a| a.to_string());
        let shutdown = matches!(request.query_param("shutdownOnComplete"), Some("true" | "yes"));
        let selected = self.ctx.select_case(request)?;

        Ok(match request.path.as_str() {
            "/runCase" => {
                let Some(agent) = agent else {
                    return Err(CaseSelectionError::MissingAgent.into());
                };
                let Some((index, descriptor)) = selected else {
                    return Err(CaseSelectionError::InvalidParameter("need case to run".into()).into());
                };
                Binding::Case(Self::activate(&self.ctx, index, descriptor, &agent)?)
            }
            "/updateReports" => Binding::Admin(AdminAction::UpdateReports { shutdown }),
            "/getCaseCount" => Binding::Admin(AdminAction::GetCaseCount),
            "/getCaseStatus" => {
                let agent = agent.ok_or(CaseSelectionError::MissingAgent)?;
                let (_, descriptor) = selected.ok_or_else(|| {
                    CaseSelectionError::InvalidParameter("need case for status".into())
                })?;
                Binding::Admin(AdminAction::GetCaseStatus {
                    agent,
                    id: descriptor.id.clone(),
                })
            }
            "/getCaseInfo" => {
                let (_, descriptor) = selected.ok_or_else(|| {
                    CaseSelectionError::InvalidParameter("need case for info".into())
                })?;
                Binding::Admin(AdminAction::GetCaseInfo(descriptor))
            }
            "/stopServer" => Binding::Admin(AdminAction::StopServer),
            _ => match (selected, agent) {
                (Some((index, descriptor)), Some(agent)) => {
                    Binding::Case(Self::activate(&self.ctx, index, descriptor, &agent)?)
                }
                _ => Binding::Direct,
            },
        })
    }

    fn run_admin(&mut self, action: AdminAction, conn: &mut dyn Connection) -> Result<()> {
        match action {
            AdminAction::UpdateReports { shutdown } => {
                let ctx = self.ctx.clone();
                let task = tokio::task::spawn_blocking(move || {
                    write_reports(&ctx.outdir, &ctx.catalog, &ctx.results.snapshot())
                });
                let ctx = self.ctx.clone();
                self.deferred = Some(Box::pin(async move {
                    match task.await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => tracing::warn!(error = %e, "report generation failed"),
                        Err(e) => tracing::warn!(error = %e, "report task failed"),
                    }
                    if shutdown {
                        let _ = ctx.shutdown.send(());
                    }
                    None
                }));
            }
            AdminAction::GetCaseCount => {
                conn.send_message(self.ctx.cases.len().to_string().as_bytes(), false)?;
                conn.send_close(Some(CloseReason::NORMAL), b"");
            }
            AdminAction::GetCaseStatus { agent, id } => {
                let rx = self.ctx.results.listen(&agent, &id);
                self.deferred = Some(Box::pin(async move {
                    let result = rx.await.ok()?;
                    Some(json!({ "behavior": result.behavior }).to_string())
                }));
            }
            AdminAction::GetCaseInfo(descriptor) => {
                let info = json!({
                    "id": descriptor.id.to_string(),
                    "description": descriptor.pretty_description(),
                });
                conn.send_message(info.to_string().as_bytes(), false)?;
                conn.send_close(Some(CloseReason::NORMAL), b"");
            }
            AdminAction::StopServer => {
                tracing::info!("stop requested");
                let _ = self.ctx.shutdown.send(());
                conn.send_close(Some(CloseReason::NORMAL), b"");
            }
        }
        Ok(())
    }

    /// Run a case hook, turning internal case errors into a FAILED verdict
    fn guarded(
        active: &mut ActiveCase,
        conn: &mut dyn Connection,
        hook: impl FnOnce(&mut dyn CaseBehavior, &mut dyn Connection) -> Result<()>,
    ) -> Result<()> {
        match hook(active.behavior.as_mut(), conn) {
            Err(Error::CaseInternal(text)) => {
                tracing::warn!(case = %active.descriptor.id, agent = %active.agent, error = %text, "case hook failed");
                active.behavior.core_mut().preset = Some((OutcomeTag::Failed, text));
                conn.send_close(Some(CloseReason::INTERNAL), b"");
                Ok(())
            }
            other => other,
        }
    }

    fn finish(&mut self, mut active: ActiveCase, conn: &dyn Connection) {
        let facts = conn.closing_facts().clone();
        active.behavior.on_close(
            facts.was_clean,
            facts.remote_close_code,
            facts.remote_close_reason.as_deref(),
        );
        active.behavior.on_connection_lost(facts.failed_by_me);

        let ended = Utc::now();
        let core = active.behavior.core();
        let verdict = classify(ClassifierInput {
            expected: &core.expected,
            observed: &core.observed,
            expected_close: &core.expected_close,
            facts: &facts,
            preset: core.preset.as_ref().map(|(tag, text)| (*tag, text.as_str())),
            unimplemented: core.unimplemented.as_deref(),
            informational: core.informational,
            timed_out: active.timed_out.then_some(active.deadline),
            is_server: conn.is_server(),
        });

        let descriptor = &active.descriptor;
        let result = Arc::new(CaseResult {
            case: active.index,
            id: descriptor.id.clone(),
            description: descriptor.description.clone(),
            expectation: descriptor.expectation.clone(),
            agent: active.agent.clone(),
            remote_agent: conn.peer_agent().map(str::to_string),
            started: active.started,
            ended,
            duration: elapsed_ms(active.started, ended),
            report_time: core.report_time || active.rtts,
            report_compression_ratio: core.report_compression_ratio,
            behavior: verdict.behavior,
            behavior_close: verdict.behavior_close,
            result: verdict.result,
            result_close: verdict.result_close,
            expected: core.expected.clone(),
            expected_close: core.expected_close.clone(),
            received: core.observed.clone(),
            facts,
            is_server: conn.is_server(),
            wire_log: conn.trace().snapshot(),
            traffic_stats: core.traffic.or_else(|| {
                core.report_compression_ratio
                    .then(|| conn.trace().compression_stats())
            }),
            http_request: conn.http_request().map(str::to_string),
            http_response: conn.http_response().map(str::to_string),
            wamp: None,
        });

        tracing::info!(
            case = %result.id,
            agent = %result.agent,
            behavior = %result.behavior,
            behavior_close = %result.behavior_close,
            duration_ms = result.duration,
            "case finished"
        );
        self.ctx.results.log_case(result.clone());
        self.result = Some(result);
    }
}

impl SessionHandler for CaseRunner {
    fn on_request(&mut self, request: &HandshakeRequest) -> Result<Vec<AcceptRule>> {
        let binding = self.bind_request(request).map_err(|e| {
            tracing::warn!(path = %request.path, error = %e, "rejecting connection");
            e
        })?;
        let rules = match &binding {
            Binding::Case(active) => active.behavior.deflate_accept_rules().to_vec(),
            _ => Vec::new(),
        };
        self.binding = binding;
        Ok(rules)
    }

    fn deflate_offers(&self) -> Vec<PerMessageDeflateOffer> {
        match &self.binding {
            Binding::Case(active) => active.behavior.deflate_offers().to_vec(),
            _ => Vec::new(),
        }
    }

    fn on_open(&mut self, conn: &mut dyn Connection) -> Result<()> {
        match std::mem::replace(&mut self.binding, Binding::Direct) {
            Binding::Case(mut active) => {
                let outcome = if active.excluded {
                    tracing::debug!(case = %active.descriptor.id, agent = %active.agent, "Skipping test case");
                    conn.send_close(Some(CloseReason::NORMAL), b"");
                    Ok(())
                } else {
                    tracing::info!(
                        case = %active.descriptor.id,
                        agent = %active.agent,
                        script = active.descriptor.script.kind(),
                        "running case"
                    );
                    active.started = Utc::now();
                    conn.continue_after(active.deadline, WATCHDOG_TAG);
                    Self::guarded(&mut active, conn, |b, c| b.on_open(c))
                };
                self.binding = Binding::Case(active);
                outcome
            }
            Binding::Admin(action) => {
                self.binding = Binding::Admin(action.clone());
                self.run_admin(action, conn)
            }
            Binding::Pending | Binding::Direct => Ok(()),
        }
    }

    fn on_message(&mut self, conn: &mut dyn Connection, payload: Bytes, binary: bool) -> Result<()> {
        match &mut self.binding {
            Binding::Case(active) if !active.excluded => {
                Self::guarded(active, conn, |b, c| b.on_message(c, payload, binary))
            }
            Binding::Pending | Binding::Direct => {
                let command = Command::parse(&payload, binary).map_err(|e| {
                    tracing::warn!(error = %e, "bad direct-control command");
                    e
                })?;
                command.execute(conn);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn on_pong(&mut self, conn: &mut dyn Connection, payload: Bytes) -> Result<()> {
        match &mut self.binding {
            Binding::Case(active) if !active.excluded => {
                Self::guarded(active, conn, |b, c| b.on_pong(c, payload))
            }
            _ => Ok(()),
        }
    }

    fn on_continue(&mut self, conn: &mut dyn Connection, tag: &str) -> Result<()> {
        let Binding::Case(active) = &mut self.binding else {
            return Ok(());
        };
        if tag == WATCHDOG_TAG {
            tracing::warn!(
                case = %active.descriptor.id,
                agent = %active.agent,
                deadline_secs = active.deadline,
                "case did not finish in time"
            );
            active.timed_out = true;
            conn.fail_connection();
            return Ok(());
        }
        Self::guarded(active, conn, |b, c| b.on_continue(c, tag))
    }

    fn take_deferred(&mut self) -> Option<Deferred> {
        self.deferred.take()
    }

    fn on_deferred(&mut self, conn: &mut dyn Connection, reply: Option<String>) -> Result<()> {
        if let Some(text) = reply {
            conn.send_message(text.as_bytes(), false)?;
        }
        conn.send_close(Some(CloseReason::NORMAL), b"");
        Ok(())
    }

    fn on_connection_lost(&mut self, conn: &dyn Connection) {
        match std::mem::replace(&mut self.binding, Binding::Direct) {
            Binding::Case(active) if !active.excluded => self.finish(active, conn),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnState, Recorded, RecordingConnection};
    use crate::frame::{encode_frame, RawFrame};
    use crate::outcome::CloseOutcomeTag;
    use crate::pattern::PatternResolver;
    use crate::script::Script;
    use crate::session::{ServerConnection, SessionConfig};
    use bytes::BytesMut;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn context(excludes: &[(&str, &[&str])]) -> Arc<FuzzingContext> {
        context_with(&["1.*", "2.*"], excludes)
    }

    fn context_with(patterns: &[&str], excludes: &[(&str, &[&str])]) -> Arc<FuzzingContext> {
        let catalog = Arc::new(CaseCatalog::standard().unwrap());
        let resolver = PatternResolver::new(&catalog);
        let cases = resolver.resolve(patterns).unwrap();
        let rules: BTreeMap<String, Vec<String>> = excludes
            .iter()
            .map(|(a, c)| (a.to_string(), c.iter().map(|s| s.to_string()).collect()))
            .collect();
        let agent_rules = resolver.resolve_agent_excludes(&rules).unwrap();
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(FuzzingContext {
            catalog: catalog.clone(),
            cases,
            agent_rules,
            corpus: Arc::new(SyntheticCorpus),
            results: Arc::new(ResultsIndex::new()),
            outdir: std::env::temp_dir(),
            options: ProtocolOptions::default(),
            shutdown,
        })
    }

    fn request(target: &str) -> HandshakeRequest {
        let text = format!(
            "GET {} HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
            target
        );
        HandshakeRequest::parse(text.as_bytes()).unwrap()
    }

    /// Octets of `frame` as a client puts them on the wire
    fn from_client(frame: RawFrame) -> Vec<u8> {
        let frame = frame.mask([0x0b, 0xad, 0xf0, 0x0d]);
        let payload = frame.effective_payload();
        let mut buf = BytesMut::new();
        encode_frame(&frame.header(None), &payload, &mut buf);
        buf.to_vec()
    }

    /// Server endpoint past the opening handshake, with `target` bound
    fn open_case(ctx: Arc<FuzzingContext>, target: &str) -> (CaseRunner, ServerConnection) {
        let mut runner = CaseRunner::new(ctx);
        runner.on_request(&request(target)).unwrap();
        let mut ep = ServerConnection::new(SessionConfig::default());
        ep.open(None);
        runner.on_open(&mut ep).unwrap();
        (runner, ep)
    }

    async fn advance_and_fire(ep: &mut ServerConnection, runner: &mut CaseRunner, secs: f64) {
        tokio::time::advance(Duration::from_secs_f64(secs)).await;
        ep.fire_due(runner);
    }

    fn lose(mut ep: ServerConnection, runner: &mut CaseRunner) -> Option<Arc<CaseResult>> {
        ep.connection_lost();
        runner.on_connection_lost(&ep);
        runner.take_result()
    }

    #[test]
    fn test_run_case_binding() {
        let mut runner = CaseRunner::new(context(&[]));
        runner.on_request(&request("/runCase?case=1&agent=A")).unwrap();
        let Binding::Case(active) = &runner.binding else {
            panic!("expected a case");
        };
        assert_eq!(active.descriptor.id.to_string(), "1.1.1");
        assert_eq!(active.index, 1);
    }

    #[test]
    fn test_case_selection_errors() {
        let ctx = context(&[]);
        let count = ctx.cases.len();
        let mut runner = CaseRunner::new(ctx);
        let err = runner.on_request(&request("/runCase?case=0&agent=A")).unwrap_err();
        assert!(matches!(
            err,
            Error::CaseSelection(CaseSelectionError::OutOfRange { requested: 0, .. })
        ));
        let target = format!("/runCase?case={}&agent=A", count + 1);
        assert!(runner.on_request(&request(&target)).is_err());
        assert!(matches!(
            runner.on_request(&request("/runCase?case=1")).unwrap_err(),
            Error::CaseSelection(CaseSelectionError::MissingAgent)
        ));
        assert!(runner.on_request(&request("/runCase?case=1&agent=A&agent=B")).is_err());
        assert!(runner.on_request(&request("/runCase?casetuple=9.1.1&agent=A")).is_err());
    }

    #[test]
    fn test_casetuple_selects_by_id() {
        let mut runner = CaseRunner::new(context(&[]));
        runner.on_request(&request("/runCase?casetuple=2.3&agent=A")).unwrap();
        let Binding::Case(active) = &runner.binding else {
            panic!("expected a case");
        };
        assert_eq!(active.descriptor.id.to_string(), "2.3");
    }

    #[test]
    fn test_get_case_count_and_info() {
        let ctx = context(&[]);
        let count = ctx.cases.len();
        let mut runner = CaseRunner::new(ctx.clone());
        runner.on_request(&request("/getCaseCount")).unwrap();
        let mut conn = RecordingConnection::new(true);
        runner.on_open(&mut conn).unwrap();
        let calls = conn.take();
        assert_eq!(
            calls[0],
            Recorded::Message {
                payload: Bytes::from(count.to_string()),
                binary: false
            }
        );
        assert!(matches!(calls[1], Recorded::Close { code: Some(1000), .. }));

        let mut runner = CaseRunner::new(ctx);
        runner.on_request(&request("/getCaseInfo?case=2")).unwrap();
        let mut conn = RecordingConnection::new(true);
        runner.on_open(&mut conn).unwrap();
        let Recorded::Message { payload, .. } = &conn.take()[0] else {
            panic!("expected a message");
        };
        let info: serde_json::Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(info["id"], "1.1.2");
    }

    #[test]
    fn test_excluded_case_is_skipped() {
        let ctx = context(&[("Flaky*", &["1.1.*"])]);
        let mut runner = CaseRunner::new(ctx.clone());
        runner.on_request(&request("/runCase?case=1&agent=FlakyServer")).unwrap();
        let mut conn = RecordingConnection::new(true);
        runner.on_open(&mut conn).unwrap();
        assert_eq!(conn.take(), vec![Recorded::Close { code: Some(1000), reason: Bytes::new() }]);
        conn.state = ConnState::Closed;
        runner.on_connection_lost(&conn);
        assert!(runner.take_result().is_none());
        assert!(ctx.results.is_empty());
    }

    #[test]
    fn test_case_result_logged_on_connection_lost() {
        let ctx = context(&[]);
        let mut runner = CaseRunner::new(ctx.clone());
        // 1.1.1: empty text message echoed, then a normal close
        runner.on_request(&request("/runCase?case=1&agent=A")).unwrap();
        let mut conn = RecordingConnection::new(true);
        runner.on_open(&mut conn).unwrap();
        assert!(conn
            .take()
            .iter()
            .any(|c| matches!(c, Recorded::ContinueAfter(_, tag) if tag == WATCHDOG_TAG)));

        runner.on_message(&mut conn, Bytes::new(), false).unwrap();
        conn.facts.closed_by_me = true;
        conn.facts.was_clean = true;
        conn.facts.remote_close_code = Some(1000);
        conn.state = ConnState::Closed;
        runner.on_connection_lost(&conn);

        let result = runner.take_result().unwrap();
        assert_eq!(result.behavior, OutcomeTag::Ok);
        assert_eq!(result.behavior_close, CloseOutcomeTag::Ok);
        assert!(ctx.results.get("A", &result.id).is_some());
    }

    #[test]
    fn test_watchdog_times_out_case() {
        let mut runner = CaseRunner::new(context(&[]));
        runner.on_request(&request("/runCase?case=1&agent=A")).unwrap();
        let mut conn = RecordingConnection::new(true);
        runner.on_open(&mut conn).unwrap();
        conn.take();
        runner.on_continue(&mut conn, WATCHDOG_TAG).unwrap();
        assert_eq!(conn.take(), vec![Recorded::Fail]);
        conn.state = ConnState::Closed;
        runner.on_connection_lost(&conn);
        let result = runner.take_result().unwrap();
        assert_eq!(result.behavior, OutcomeTag::Failed);
        assert!(result.result.contains("did not finish"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragmented_cases_pass_against_echoing_peer() {
        let ctx = context_with(&["5.*", "6.*"], &[]);
        for (id, echo) in [("5.3", "fragment1fragment2"), ("6.1.2", "")] {
            let (mut runner, mut ep) = open_case(ctx.clone(), &format!("/runCase?casetuple={}&agent=A", id));
            ep.written();
            ep.feed(&from_client(RawFrame::text(echo)), &mut runner);
            advance_and_fire(&mut ep, &mut runner, 1.1).await;
            assert!(ep.closing_facts().closed_by_me, "{}", id);
            ep.feed(&from_client(RawFrame::close(Some(1000), b"")), &mut runner);

            let result = lose(ep, &mut runner).unwrap();
            assert_eq!(result.id.to_string(), id);
            assert_eq!(result.behavior, OutcomeTag::Ok, "{}: {}", id, result.result);
            assert_eq!(result.behavior_close, CloseOutcomeTag::Ok, "{}: {}", id, result.result_close);
            assert_eq!(result.received.len(), 1);
            assert!(ctx.results.get("A", &result.id).is_some());
        }
    }

    fn impossible_byte_case(ctx: &FuzzingContext) -> CaseId {
        ctx.catalog
            .iter()
            .find(|c| matches!(&c.script, Script::Utf8Probe(p) if &p.payload[..] == b"\xff"))
            .map(|c| c.id.clone())
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_utf8_case_passes_when_peer_fails_with_1007() {
        let ctx = context_with(&["6.*"], &[]);
        let id = impossible_byte_case(&ctx);
        let (mut runner, mut ep) = open_case(ctx, &format!("/runCase?casetuple={}&agent=A", id));
        ep.feed(&from_client(RawFrame::close(Some(1007), b"")), &mut runner);
        assert!(!ep.closing_facts().closed_by_me);

        let result = lose(ep, &mut runner).unwrap();
        assert_eq!(result.behavior, OutcomeTag::Ok, "{}", result.result);
        assert_eq!(result.behavior_close, CloseOutcomeTag::Ok, "{}", result.result_close);
        assert_eq!(result.facts.remote_close_code, Some(1007));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_utf8_case_fails_when_peer_echoes() {
        let ctx = context_with(&["6.*"], &[]);
        let id = impossible_byte_case(&ctx);
        let (mut runner, mut ep) = open_case(ctx, &format!("/runCase?casetuple={}&agent=A", id));
        ep.feed(&from_client(RawFrame::text(&b"\xff"[..])), &mut runner);
        // the echo itself is invalid, so this side fails the connection
        assert!(ep.closing_facts().failed_by_me);
        ep.feed(&from_client(RawFrame::close(Some(1007), b"")), &mut runner);

        let result = lose(ep, &mut runner).unwrap();
        assert_eq!(result.behavior, OutcomeTag::Failed);
        assert_eq!(result.result, "The connection was closed by the wrong endpoint");
        assert_eq!(result.behavior_close, CloseOutcomeTag::FailedByClient);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_echo_fails_after_wait() {
        let ctx = context_with(&["9.1.1"], &[]);
        let (mut runner, mut ep) = open_case(ctx.clone(), "/runCase?case=1&agent=A");
        let wait_secs = match &ctx.catalog.get(&"9.1.1".parse().unwrap()).unwrap().script {
            Script::EchoRoundTrip(s) => s.wait_secs,
            other => panic!("unexpected script {}", other.kind()),
        };

        advance_and_fire(&mut ep, &mut runner, wait_secs + 0.1).await;
        assert!(ep.closing_facts().closed_by_me);
        // peer never answers the close either
        advance_and_fire(&mut ep, &mut runner, 2.0).await;
        assert!(ep.closing_facts().was_close_handshake_timeout);

        let result = lose(ep, &mut runner).unwrap();
        assert_eq!(result.behavior, OutcomeTag::Failed);
        assert_eq!(
            result.result,
            format!("Case did not finish within {} seconds.", wait_secs)
        );
        assert!(result.received.is_empty());
    }

    #[test]
    fn test_watchdog_bounds_echo_case() {
        let ctx = context_with(&["9.1.1"], &[]);
        let mut runner = CaseRunner::new(ctx);
        runner.on_request(&request("/runCase?case=1&agent=A")).unwrap();
        let mut conn = RecordingConnection::new(true);
        runner.on_open(&mut conn).unwrap();
        let calls = conn.take();
        let Some(deadline) = calls.iter().find_map(|c| match c {
            Recorded::ContinueAfter(secs, tag) if tag == WATCHDOG_TAG => Some(*secs),
            _ => None,
        }) else {
            panic!("no watchdog scheduled");
        };
        assert!(calls.iter().any(|c| matches!(c, Recorded::CloseAfter(w) if *w < deadline)));

        runner.on_continue(&mut conn, WATCHDOG_TAG).unwrap();
        assert_eq!(conn.take(), vec![Recorded::Fail]);
        conn.state = ConnState::Closed;
        runner.on_connection_lost(&conn);
        let result = runner.take_result().unwrap();
        assert_eq!(result.behavior, OutcomeTag::Failed);
        assert_eq!(result.behavior_close, CloseOutcomeTag::Failed);
        assert_eq!(
            result.result,
            format!("Case did not finish within {} seconds.", deadline)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_excluded_case_closes_without_result() {
        let ctx = context_with(&["6.*"], &[("Skip*", &["6.1.*"])]);
        let (mut runner, mut ep) = open_case(ctx.clone(), "/runCase?casetuple=6.1.1&agent=SkipMe");
        assert!(ep.closing_facts().closed_by_me);
        assert_eq!(ep.closing_facts().local_close_code, Some(1000));
        // nothing but the close frame was sent
        let mut out = ep.written();
        let mut parser = crate::frame::FrameParser::new(usize::MAX);
        let sent: Vec<_> = std::iter::from_fn(|| parser.parse(&mut out).unwrap()).collect();
        assert_eq!(sent.len(), 1);

        ep.feed(&from_client(RawFrame::close(Some(1000), b"")), &mut runner);
        advance_and_fire(&mut ep, &mut runner, 20.0).await;
        assert!(lose(ep, &mut runner).is_none());
        assert!(ctx.results.is_empty());
    }

    #[test]
    fn test_direct_commands() {
        let mut runner = CaseRunner::new(context(&[]));
        runner.on_request(&request("/")).unwrap();
        let mut conn = RecordingConnection::new(true);
        runner.on_open(&mut conn).unwrap();
        runner
            .on_message(&mut conn, Bytes::from_static(br#"["sendframe", {"opcode": 9}]"#), false)
            .unwrap();
        assert!(matches!(&conn.take()[0], Recorded::Frame(f) if f.opcode == 9));

        let err = runner
            .on_message(&mut conn, Bytes::from_static(br#"["nope", {}]"#), false)
            .unwrap_err();
        assert_eq!(err.to_string(), "fuzzing peer received unknown command 'nope'");
    }

    #[tokio::test]
    async fn test_case_status_waits_for_result() {
        let ctx = context(&[]);
        let mut runner = CaseRunner::new(ctx.clone());
        runner.on_request(&request("/getCaseStatus?case=1&agent=A")).unwrap();
        let mut conn = RecordingConnection::new(true);
        runner.on_open(&mut conn).unwrap();
        let deferred = runner.take_deferred().unwrap();

        ctx.results
            .log_case(crate::results::tests::sample_result("A", "1.1.1"));
        let reply = deferred.await;
        assert_eq!(reply.as_deref(), Some(r#"{"behavior":"OK"}"#));
        runner.on_deferred(&mut conn, reply).unwrap();
        assert!(matches!(conn.take().last(), Some(Recorded::Close { .. })));
    }
}
