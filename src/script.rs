//! Data-driven case behavior scripts
//!
//! A [`Script`] is the parameter record a catalog entry carries. Calling
//! [`Script::instantiate`] turns it into a fresh [`CaseBehavior`] state
//! machine for one connection. A handful of generic behaviors cover every
//! case family; the catalog tables differ only in the parameters they pass.

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::compression::{AcceptRule, PerMessageDeflateOffer};
use crate::connection::{ConnState, Connection};
use crate::corpus::{Corpus, CorpusCursor, CorpusKey};
use crate::error::{CloseReason, Error, Result};
use crate::frame::{OpCode, RawFrame};
use crate::outcome::{describe_echo_mismatch, Event, ExpectedClose, ExpectedEvents, OutcomeTag};
use crate::trace::CompressionStats;
use crate::wamp::WampScenario;

/// Generated payload, materialized when the case starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Literal(Bytes),
    /// `pattern` repeated and truncated to `len` octets
    Repeat { pattern: Bytes, len: usize },
    /// Pseudo-random octets from a fixed seed
    Random { len: usize, seed: u64 },
}

impl Payload {
    pub fn repeat(pattern: &'static [u8], len: usize) -> Self {
        Payload::Repeat {
            pattern: Bytes::from_static(pattern),
            len,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Literal(b) => b.len(),
            Payload::Repeat { len, .. } | Payload::Random { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn materialize(&self) -> Bytes {
        match self {
            Payload::Literal(b) => b.clone(),
            Payload::Repeat { pattern, len } => {
                if pattern.is_empty() {
                    return Bytes::from(vec![0u8; *len]);
                }
                let mut out = BytesMut::with_capacity(*len);
                while out.len() < *len {
                    let take = (*len - out.len()).min(pattern.len());
                    out.extend_from_slice(&pattern[..take]);
                }
                out.freeze()
            }
            Payload::Random { len, seed } => {
                let mut rng = fastrand::Rng::with_seed(*seed);
                let mut out = vec![0u8; *len];
                rng.fill(&mut out);
                Bytes::from(out)
            }
        }
    }
}

/// One instruction of a frame sequence
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Frame(RawFrame),
    Message { payload: Bytes, binary: bool },
    Close { code: Option<u16>, reason: Bytes },
    /// Stop here and resume with the next step after the delay
    Pause(f64),
    CloseAfter(f64),
    KillAfter(f64),
    Wirelog(bool),
}

/// Explicit frames and timers with expected observations
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSequence {
    pub steps: Vec<Step>,
    pub expected: ExpectedEvents,
    pub expected_close: ExpectedClose,
    pub informational: bool,
}

impl FrameSequence {
    /// Sequence whose correct outcome is `ok`
    pub fn new(steps: Vec<Step>, ok: Vec<Event>, expected_close: ExpectedClose) -> Self {
        let mut expected = ExpectedEvents::new();
        expected.insert(OutcomeTag::Ok, ok);
        Self {
            steps,
            expected,
            expected_close,
            informational: false,
        }
    }

    /// Register an acceptable but not ideal observation
    pub fn non_strict(mut self, events: Vec<Event>) -> Self {
        self.expected.insert(OutcomeTag::NonStrict, events);
        self
    }

    pub fn informational(mut self) -> Self {
        self.informational = true;
        self
    }
}

/// Send a message (possibly many times) and expect exact echoes in time
#[derive(Debug, Clone, PartialEq)]
pub struct EchoRoundTrip {
    pub payload: Payload,
    pub binary: bool,
    pub count: usize,
    /// Split each encoded frame into socket writes of this size
    pub chop_size: Option<usize>,
    pub auto_fragment: Option<usize>,
    pub wait_secs: f64,
    pub report_time: bool,
}

/// Send one message as fixed-size fragments and expect its echo in time
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentedSend {
    pub payload: Payload,
    pub binary: bool,
    pub fragment_size: usize,
    pub wait_secs: f64,
    pub report_time: bool,
}

/// How a UTF-8 probe splits its payload into frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Utf8Split {
    Whole,
    Octets(usize),
    /// One frame per code point; invalid input falls back to octets
    Codepoints,
}

/// Text payload whose UTF-8 validity the peer must judge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utf8Probe {
    pub payload: Bytes,
    pub valid: bool,
    pub split: Utf8Split,
}

/// Compressed echo round trips over permessage-deflate
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedEchoRoundTrip {
    pub corpus: CorpusKey,
    /// Octets (binary corpora) or characters (text corpora) per message
    pub len: usize,
    pub count: usize,
    pub wait_secs: f64,
    pub auto_fragment: Option<usize>,
    /// Client role: extension offers sent in the handshake
    pub offers: Vec<PerMessageDeflateOffer>,
    /// Server role: rules tried against the client's offers
    pub accept_rules: Vec<AcceptRule>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Script {
    Sequence(FrameSequence),
    EchoRoundTrip(EchoRoundTrip),
    FragmentedSend(FragmentedSend),
    Utf8Probe(Utf8Probe),
    CompressedEchoRoundTrip(CompressedEchoRoundTrip),
    /// Multi-session WAMP scenario; runs through [`crate::wamp`], never on one connection
    Wamp(WampScenario),
}

macro_rules! script_from {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Script {
            fn from(s: $ty) -> Self {
                Script::$variant(s)
            }
        })*
    };
}

script_from! {
    FrameSequence => Sequence,
    EchoRoundTrip => EchoRoundTrip,
    FragmentedSend => FragmentedSend,
    Utf8Probe => Utf8Probe,
    CompressedEchoRoundTrip => CompressedEchoRoundTrip,
    WampScenario => Wamp,
}

/// Extra seconds the watchdog grants beyond a script's own wait time
const WATCHDOG_GRACE_SECS: f64 = 10.0;

impl Script {
    /// Seconds after which the runner gives up on the case
    pub fn deadline_secs(&self) -> f64 {
        match self {
            Script::Sequence(_) | Script::Utf8Probe(_) => WATCHDOG_GRACE_SECS,
            Script::EchoRoundTrip(s) => s.wait_secs + WATCHDOG_GRACE_SECS,
            Script::FragmentedSend(s) => s.wait_secs + WATCHDOG_GRACE_SECS,
            Script::CompressedEchoRoundTrip(s) => s.wait_secs + WATCHDOG_GRACE_SECS,
            Script::Wamp(s) => s.deadline_secs(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Script::Sequence(_) => "sequence",
            Script::EchoRoundTrip(_) => "echo",
            Script::FragmentedSend(_) => "fragmented",
            Script::Utf8Probe(_) => "utf8",
            Script::CompressedEchoRoundTrip(_) => "deflate",
            Script::Wamp(_) => "wamp",
        }
    }

    /// Fresh per-connection state machine for this script
    pub fn instantiate(&self, corpus: &dyn Corpus) -> Result<Box<dyn CaseBehavior>> {
        Ok(match self {
            Script::Sequence(s) => Box::new(SequenceBehavior::new(s.clone())),
            Script::EchoRoundTrip(s) => Box::new(EchoBehavior::round_trip(s)),
            Script::FragmentedSend(s) => Box::new(EchoBehavior::fragmented(s)),
            Script::Utf8Probe(s) => Box::new(Utf8ProbeBehavior::new(s.clone())),
            Script::CompressedEchoRoundTrip(s) => {
                let cursor = CorpusCursor::new(corpus.load(s.corpus)?, s.corpus.is_binary())?;
                Box::new(CompressedEchoBehavior::new(s.clone(), cursor))
            }
            Script::Wamp(_) => {
                return Err(Error::CaseInternal(
                    "WAMP scenarios need several sessions and run through the WAMP client".into(),
                ))
            }
        })
    }
}

/// Expectations and observations shared by every behavior
#[derive(Debug, Clone)]
pub struct CaseCore {
    pub expected: ExpectedEvents,
    pub expected_close: ExpectedClose,
    pub observed: Vec<Event>,
    /// Verdict the case settled on itself
    pub preset: Option<(OutcomeTag, String)>,
    pub unimplemented: Option<String>,
    pub informational: bool,
    pub report_time: bool,
    pub report_compression_ratio: bool,
    pub traffic: Option<CompressionStats>,
}

impl Default for CaseCore {
    fn default() -> Self {
        Self {
            expected: ExpectedEvents::new(),
            expected_close: ExpectedClose::normal(),
            observed: Vec::new(),
            preset: None,
            unimplemented: None,
            informational: false,
            report_time: false,
            report_compression_ratio: false,
            traffic: None,
        }
    }
}

impl CaseCore {
    fn settle(&mut self, tag: OutcomeTag, text: impl Into<String>) {
        self.preset = Some((tag, text.into()));
    }
}

/// Hooks a running case receives from its connection
pub trait CaseBehavior: Send + fmt::Debug {
    fn core(&self) -> &CaseCore;

    fn core_mut(&mut self) -> &mut CaseCore;

    /// Extension offers made when this case runs in the client role
    fn deflate_offers(&self) -> &[PerMessageDeflateOffer] {
        &[]
    }

    /// Acceptance rules applied when this case runs in the server role
    fn deflate_accept_rules(&self) -> &[AcceptRule] {
        &[]
    }

    fn on_open(&mut self, conn: &mut dyn Connection) -> Result<()>;

    fn on_message(&mut self, _conn: &mut dyn Connection, payload: Bytes, binary: bool) -> Result<()> {
        self.core_mut().observed.push(Event::Message { payload, binary });
        Ok(())
    }

    fn on_pong(&mut self, _conn: &mut dyn Connection, payload: Bytes) -> Result<()> {
        self.core_mut().observed.push(Event::Pong { payload });
        Ok(())
    }

    fn on_close(&mut self, _was_clean: bool, _code: Option<u16>, _reason: Option<&str>) {}

    fn on_continue(&mut self, _conn: &mut dyn Connection, tag: &str) -> Result<()> {
        Err(Error::CaseInternal(format!("unexpected continuation '{}'", tag)))
    }

    fn on_connection_lost(&mut self, _failed_by_me: bool) {}
}

// ============================================================================
// Frame sequences
// ============================================================================

const STEP_TAG_PREFIX: &str = "step-";

#[derive(Debug)]
struct SequenceBehavior {
    script: FrameSequence,
    core: CaseCore,
}

impl SequenceBehavior {
    fn new(script: FrameSequence) -> Self {
        Self {
            script,
            core: CaseCore::default(),
        }
    }

    fn run_from(&mut self, conn: &mut dyn Connection, start: usize) -> Result<()> {
        for (idx, step) in self.script.steps.iter().enumerate().skip(start) {
            match step {
                Step::Frame(frame) => conn.send_frame(frame.clone()),
                Step::Message { payload, binary } => conn.send_message(payload, *binary)?,
                Step::Close { code, reason } => conn.send_close(*code, reason),
                Step::Pause(secs) => {
                    conn.continue_after(*secs, &format!("{}{}", STEP_TAG_PREFIX, idx + 1));
                    return Ok(());
                }
                Step::CloseAfter(secs) => conn.close_after(*secs),
                Step::KillAfter(secs) => conn.kill_after(*secs),
                Step::Wirelog(enabled) => conn.enable_wirelog(*enabled),
            }
        }
        Ok(())
    }
}

impl CaseBehavior for SequenceBehavior {
    fn core(&self) -> &CaseCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut CaseCore {
        &mut self.core
    }

    fn on_open(&mut self, conn: &mut dyn Connection) -> Result<()> {
        self.core.expected = self.script.expected.clone();
        self.core.expected_close = self.script.expected_close.clone();
        self.core.informational = self.script.informational;
        self.run_from(conn, 0)
    }

    fn on_continue(&mut self, conn: &mut dyn Connection, tag: &str) -> Result<()> {
        let next = tag
            .strip_prefix(STEP_TAG_PREFIX)
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|n| *n <= self.script.steps.len())
            .ok_or_else(|| Error::CaseInternal(format!("unknown continuation '{}'", tag)))?;
        self.run_from(conn, next)
    }
}

// ============================================================================
// Echo round trips
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum SendPlan {
    Message { chop_size: Option<usize> },
    Fragments(usize),
}

#[derive(Debug)]
struct EchoBehavior {
    payload: Payload,
    binary: bool,
    count: usize,
    plan: SendPlan,
    auto_fragment: Option<usize>,
    wait_secs: f64,
    sent: usize,
    data: Bytes,
    core: CaseCore,
}

impl EchoBehavior {
    fn round_trip(s: &EchoRoundTrip) -> Self {
        Self::build(
            s.payload.clone(),
            s.binary,
            s.count.max(1),
            SendPlan::Message {
                chop_size: s.chop_size,
            },
            s.auto_fragment,
            s.wait_secs,
            s.report_time,
        )
    }

    fn fragmented(s: &FragmentedSend) -> Self {
        Self::build(
            s.payload.clone(),
            s.binary,
            1,
            SendPlan::Fragments(s.fragment_size.max(1)),
            None,
            s.wait_secs,
            s.report_time,
        )
    }

    fn build(
        payload: Payload,
        binary: bool,
        count: usize,
        plan: SendPlan,
        auto_fragment: Option<usize>,
        wait_secs: f64,
        report_time: bool,
    ) -> Self {
        Self {
            payload,
            binary,
            count,
            plan,
            auto_fragment,
            wait_secs,
            sent: 0,
            data: Bytes::new(),
            core: CaseCore {
                report_time,
                ..CaseCore::default()
            },
        }
    }

    fn opcode(&self) -> u8 {
        if self.binary {
            OpCode::Binary.as_u8()
        } else {
            OpCode::Text.as_u8()
        }
    }

    fn send_one(&mut self, conn: &mut dyn Connection) -> Result<()> {
        match self.plan {
            SendPlan::Message { chop_size: None } => conn.send_message(&self.data, self.binary)?,
            SendPlan::Message {
                chop_size: Some(size),
            } => conn.send_frame(RawFrame::new(self.opcode(), self.data.clone()).chop(size)),
            SendPlan::Fragments(size) => {
                for frame in fragment_frames(&self.data, self.opcode(), size) {
                    conn.send_frame(frame);
                }
            }
        }
        self.sent += 1;
        Ok(())
    }
}

/// Split a message into frames of at most `size` octets
pub fn fragment_frames(data: &Bytes, opcode: u8, size: usize) -> Vec<RawFrame> {
    if data.is_empty() {
        return vec![RawFrame::new(opcode, Bytes::new())];
    }
    let size = size.max(1);
    let total = data.len().div_ceil(size);
    (0..total)
        .map(|i| {
            let chunk = data.slice(i * size..((i + 1) * size).min(data.len()));
            let op = if i == 0 { opcode } else { OpCode::Continuation.as_u8() };
            RawFrame::new(op, chunk).fin(i + 1 == total)
        })
        .collect()
}

impl CaseBehavior for EchoBehavior {
    fn core(&self) -> &CaseCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut CaseCore {
        &mut self.core
    }

    fn on_open(&mut self, conn: &mut dyn Connection) -> Result<()> {
        self.data = self.payload.materialize();
        self.core.expected_close = ExpectedClose::normal();
        self.core.expected.insert(
            OutcomeTag::Ok,
            vec![Event::Message {
                payload: self.data.clone(),
                binary: self.binary,
            }],
        );
        self.core.settle(
            OutcomeTag::Failed,
            format!("Case did not finish within {} seconds.", self.wait_secs),
        );
        if self.auto_fragment.is_some() {
            conn.set_auto_fragment_size(self.auto_fragment);
        }
        conn.close_after(self.wait_secs);
        self.send_one(conn)
    }

    fn on_message(&mut self, conn: &mut dyn Connection, payload: Bytes, binary: bool) -> Result<()> {
        if let Some(text) = describe_echo_mismatch(&self.data, self.binary, &payload, binary) {
            self.core.observed.push(Event::Message { payload, binary });
            self.core.settle(OutcomeTag::Failed, text);
            conn.send_close(Some(CloseReason::NORMAL), b"");
        } else if self.sent < self.count {
            self.send_one(conn)?;
        } else {
            if self.count == 1 {
                self.core.observed.push(Event::Message { payload, binary });
            }
            self.core.settle(
                OutcomeTag::Ok,
                format!("Received all {} echo'ed messages in time.", self.count),
            );
            conn.send_close(Some(CloseReason::NORMAL), b"");
        }
        Ok(())
    }
}

// ============================================================================
// UTF-8 probes
// ============================================================================

/// Seconds an invalid probe waits for the peer to fail the connection
pub const UTF8_KILL_SECS: f64 = 0.5;

#[derive(Debug)]
struct Utf8ProbeBehavior {
    probe: Utf8Probe,
    core: CaseCore,
}

impl Utf8ProbeBehavior {
    fn new(probe: Utf8Probe) -> Self {
        Self {
            probe,
            core: CaseCore::default(),
        }
    }

    fn frames(&self) -> Vec<RawFrame> {
        let text = OpCode::Text.as_u8();
        match self.probe.split {
            Utf8Split::Whole => vec![RawFrame::new(text, self.probe.payload.clone())],
            Utf8Split::Octets(n) => fragment_frames(&self.probe.payload, text, n),
            Utf8Split::Codepoints => match std::str::from_utf8(&self.probe.payload) {
                Ok(s) if !s.is_empty() => {
                    let chars: Vec<_> = s.char_indices().collect();
                    let last = chars.len() - 1;
                    chars
                        .iter()
                        .enumerate()
                        .map(|(i, (start, c))| {
                            let chunk = self.probe.payload.slice(*start..start + c.len_utf8());
                            let op = if i == 0 { text } else { OpCode::Continuation.as_u8() };
                            RawFrame::new(op, chunk).fin(i == last)
                        })
                        .collect()
                }
                _ => fragment_frames(&self.probe.payload, text, 1),
            },
        }
    }
}

impl CaseBehavior for Utf8ProbeBehavior {
    fn core(&self) -> &CaseCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut CaseCore {
        &mut self.core
    }

    fn on_open(&mut self, conn: &mut dyn Connection) -> Result<()> {
        if self.probe.valid {
            self.core
                .expected
                .insert(OutcomeTag::Ok, vec![Event::text(self.probe.payload.clone())]);
            self.core.expected_close = ExpectedClose::normal();
        } else {
            self.core.expected.insert(OutcomeTag::Ok, Vec::new());
            self.core.expected_close =
                ExpectedClose::peer_fails(&[CloseReason::INVALID_PAYLOAD]).fatal_if_wrong_endpoint();
        }

        match self.probe.split {
            Utf8Split::Whole => conn.send_message(&self.probe.payload, false)?,
            _ => {
                for frame in self.frames() {
                    conn.send_frame(frame);
                }
            }
        }

        if self.probe.valid {
            conn.close_after(1.0);
        } else {
            conn.kill_after(UTF8_KILL_SECS);
        }
        Ok(())
    }

    fn on_message(&mut self, conn: &mut dyn Connection, payload: Bytes, binary: bool) -> Result<()> {
        self.core.observed.push(Event::Message { payload, binary });
        if self.probe.valid && conn.state() == ConnState::Open {
            conn.send_close(Some(CloseReason::NORMAL), b"");
        }
        Ok(())
    }
}

// ============================================================================
// Compressed echo round trips
// ============================================================================

#[derive(Debug)]
struct CompressedEchoBehavior {
    script: CompressedEchoRoundTrip,
    cursor: CorpusCursor,
    last_sent: Bytes,
    sent: usize,
    core: CaseCore,
}

impl CompressedEchoBehavior {
    fn new(script: CompressedEchoRoundTrip, cursor: CorpusCursor) -> Self {
        Self {
            script,
            cursor,
            last_sent: Bytes::new(),
            sent: 0,
            core: CaseCore {
                report_time: true,
                report_compression_ratio: true,
                ..CaseCore::default()
            },
        }
    }

    fn binary(&self) -> bool {
        self.script.corpus.is_binary()
    }

    fn send_one(&mut self, conn: &mut dyn Connection) -> Result<()> {
        self.last_sent = self.cursor.next_slice(self.script.len);
        conn.send_message(&self.last_sent, self.binary())?;
        self.sent += 1;
        Ok(())
    }
}

impl CaseBehavior for CompressedEchoBehavior {
    fn core(&self) -> &CaseCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut CaseCore {
        &mut self.core
    }

    fn deflate_offers(&self) -> &[PerMessageDeflateOffer] {
        &self.script.offers
    }

    fn deflate_accept_rules(&self) -> &[AcceptRule] {
        &self.script.accept_rules
    }

    fn on_open(&mut self, conn: &mut dyn Connection) -> Result<()> {
        conn.enable_wirelog(false);
        self.core.expected_close = ExpectedClose::normal();
        if let Some(size) = self.script.auto_fragment {
            conn.set_auto_fragment_size(Some(size));
        }

        if conn.deflate().is_none() {
            self.core.unimplemented = Some("permessage-deflate was not negotiated".to_string());
            conn.send_close(Some(CloseReason::NORMAL), b"");
            return Ok(());
        }

        self.core.settle(
            OutcomeTag::Failed,
            format!("Case did not finish within {} seconds.", self.script.wait_secs),
        );
        conn.close_after(self.script.wait_secs);
        self.send_one(conn)
    }

    fn on_message(&mut self, conn: &mut dyn Connection, payload: Bytes, binary: bool) -> Result<()> {
        if let Some(text) = describe_echo_mismatch(&self.last_sent, self.binary(), &payload, binary) {
            self.core.settle(OutcomeTag::Failed, text);
            conn.enable_wirelog(true);
            conn.send_close(Some(CloseReason::NORMAL), b"");
        } else if self.sent < self.script.count {
            self.send_one(conn)?;
        } else {
            self.core
                .settle(OutcomeTag::Ok, "Ok, received all echo'ed messages in time.");
            self.core.traffic = Some(conn.trace().compression_stats());
            conn.enable_wirelog(true);
            conn.send_close(Some(CloseReason::NORMAL), b"");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::DeflateParams;
    use crate::connection::{Recorded, RecordingConnection};
    use crate::corpus::SyntheticCorpus;

    #[test]
    fn test_payload_materialize() {
        assert_eq!(&Payload::repeat(b"ab", 5).materialize()[..], b"ababa");
        let a = Payload::Random { len: 32, seed: 7 }.materialize();
        let b = Payload::Random { len: 32, seed: 7 }.materialize();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(Payload::Literal(Bytes::new()).is_empty());
    }

    #[test]
    fn test_fragment_frames() {
        let frames = fragment_frames(&Bytes::from_static(b"abcdefg"), 1, 3);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].opcode, 1);
        assert!(!frames[0].fin);
        assert_eq!(frames[1].opcode, 0);
        assert!(frames[2].fin);
        assert_eq!(&frames[2].payload[..], b"g");

        let empty = fragment_frames(&Bytes::new(), 2, 3);
        assert_eq!(empty.len(), 1);
        assert!(empty[0].fin);
    }

    #[test]
    fn test_sequence_pauses_and_resumes() {
        let seq = FrameSequence::new(
            vec![
                Step::Frame(RawFrame::text("a").fin(false)),
                Step::Pause(1.0),
                Step::Frame(RawFrame::continuation("b")),
                Step::CloseAfter(1.0),
            ],
            vec![Event::text("ab")],
            ExpectedClose::normal(),
        );
        let mut case = Script::Sequence(seq)
            .instantiate(&SyntheticCorpus)
            .unwrap();
        let mut conn = RecordingConnection::new(true);

        case.on_open(&mut conn).unwrap();
        let calls = conn.take();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], Recorded::ContinueAfter(1.0, "step-2".into()));

        case.on_continue(&mut conn, "step-2").unwrap();
        let calls = conn.take();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], Recorded::CloseAfter(1.0));

        assert!(case.on_continue(&mut conn, "bogus").is_err());
    }

    #[test]
    fn test_echo_round_trip_counts_and_settles() {
        let script = Script::EchoRoundTrip(EchoRoundTrip {
            payload: Payload::repeat(b"x", 10),
            binary: true,
            count: 2,
            chop_size: None,
            auto_fragment: None,
            wait_secs: 5.0,
            report_time: true,
        });
        let mut case = script.instantiate(&SyntheticCorpus).unwrap();
        let mut conn = RecordingConnection::new(false);
        case.on_open(&mut conn).unwrap();
        assert_eq!(case.core().preset.as_ref().unwrap().0, OutcomeTag::Failed);
        assert!(case.core().report_time);

        let echo = Bytes::from(vec![b'x'; 10]);
        case.on_message(&mut conn, echo.clone(), true).unwrap();
        assert_eq!(conn.state, ConnState::Open);
        case.on_message(&mut conn, echo, true).unwrap();
        assert_eq!(case.core().preset.as_ref().unwrap().0, OutcomeTag::Ok);
        assert_eq!(conn.state, ConnState::Closing);

        let sent = conn
            .calls
            .iter()
            .filter(|c| matches!(c, Recorded::Message { .. }))
            .count();
        assert_eq!(sent, 2);
    }

    #[test]
    fn test_echo_mismatch_settles_failed() {
        let script = Script::EchoRoundTrip(EchoRoundTrip {
            payload: Payload::repeat(b"x", 4),
            binary: true,
            count: 1,
            chop_size: Some(2),
            auto_fragment: None,
            wait_secs: 5.0,
            report_time: false,
        });
        let mut case = script.instantiate(&SyntheticCorpus).unwrap();
        let mut conn = RecordingConnection::new(true);
        case.on_open(&mut conn).unwrap();
        assert!(conn
            .calls
            .iter()
            .any(|c| matches!(c, Recorded::Frame(f) if f.chopsize == Some(2))));

        case.on_message(&mut conn, Bytes::from_static(b"xxxx"), false)
            .unwrap();
        let (tag, text) = case.core().preset.clone().unwrap();
        assert_eq!(tag, OutcomeTag::Failed);
        assert!(text.contains("type differs"));
    }

    #[test]
    fn test_utf8_probe_invalid_expectations() {
        let script = Script::Utf8Probe(Utf8Probe {
            payload: Bytes::from_static(b"\xff"),
            valid: false,
            split: Utf8Split::Whole,
        });
        let mut case = script.instantiate(&SyntheticCorpus).unwrap();
        let mut conn = RecordingConnection::new(true);
        case.on_open(&mut conn).unwrap();
        let core = case.core();
        assert_eq!(core.expected.get(&OutcomeTag::Ok), Some(&Vec::new()));
        assert!(!core.expected_close.closed_by_me);
        assert_eq!(core.expected_close.close_codes, vec![1007]);
        assert!(core.expected_close.closed_by_wrong_endpoint_is_fatal);
        assert_eq!(conn.calls.last(), Some(&Recorded::KillAfter(UTF8_KILL_SECS)));
    }

    #[test]
    fn test_utf8_probe_codepoint_split() {
        let probe = Utf8ProbeBehavior::new(Utf8Probe {
            payload: Bytes::from("aé€"),
            valid: true,
            split: Utf8Split::Codepoints,
        });
        let frames = probe.frames();
        let sizes: Vec<usize> = frames.iter().map(|f| f.payload.len()).collect();
        assert_eq!(sizes, vec![1, 2, 3]);
        assert!(frames[2].fin && !frames[1].fin);
    }

    #[test]
    fn test_compressed_echo_unimplemented_without_deflate() {
        let script = Script::CompressedEchoRoundTrip(CompressedEchoRoundTrip {
            corpus: CorpusKey::JsonData1,
            len: 64,
            count: 3,
            wait_secs: 60.0,
            auto_fragment: None,
            offers: vec![PerMessageDeflateOffer::default()],
            accept_rules: vec![AcceptRule::default()],
        });
        let mut case = script.instantiate(&SyntheticCorpus).unwrap();
        assert_eq!(case.deflate_offers().len(), 1);

        let mut conn = RecordingConnection::new(true);
        case.on_open(&mut conn).unwrap();
        assert!(case.core().unimplemented.is_some());
        assert_eq!(conn.state, ConnState::Closing);

        let mut case = script.instantiate(&SyntheticCorpus).unwrap();
        let mut conn = RecordingConnection::new(true);
        conn.deflate = Some(DeflateParams::default());
        case.on_open(&mut conn).unwrap();
        assert!(case.core().unimplemented.is_none());
        assert!(!conn.trace.is_enabled());
        let corpus = SyntheticCorpus.load(CorpusKey::JsonData1).unwrap();
        let mut cursor = CorpusCursor::new(corpus, false).unwrap();
        for _ in 0..3 {
            let echo = cursor.next_slice(64);
            case.on_message(&mut conn, echo, false).unwrap();
        }
        assert_eq!(case.core().preset.as_ref().unwrap().0, OutcomeTag::Ok);
        assert!(case.core().traffic.is_some());
        assert!(conn.trace.is_enabled());
    }
}
