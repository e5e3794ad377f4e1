//! The connection surface cases and command handlers drive
//!
//! Both endpoint roles implement [`Connection`]. Cases never see sockets;
//! they queue frames, arm timers and read closing facts through this trait,
//! which keeps them testable against an in-memory recorder.

use bytes::Bytes;
use serde::Serialize;

use crate::compression::DeflateParams;
use crate::error::Result;
use crate::frame::RawFrame;
use crate::outcome::ClosingFacts;
use crate::trace::WireTrace;

/// Lifecycle of a WebSocket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Operations available to a running case
pub trait Connection {
    /// True for the accepting side of the connection
    fn is_server(&self) -> bool;

    fn state(&self) -> ConnState;

    /// Queue a frame exactly as described; never touches close state
    fn send_frame(&mut self, frame: RawFrame);

    /// Queue a complete message, compressing and auto-fragmenting as
    /// negotiated
    fn send_message(&mut self, payload: &[u8], binary: bool) -> Result<()>;

    /// Start the closing handshake, or answer the peer's close
    fn send_close(&mut self, code: Option<u16>, reason: &[u8]);

    /// Fail the connection: drop TCP when failing by drop, otherwise close
    /// with 1001 and drop once the handshake ends
    fn fail_connection(&mut self);

    fn close_after(&mut self, secs: f64);

    fn kill_after(&mut self, secs: f64);

    /// Arrange for the handler's `on_continue(tag)` after `secs`
    fn continue_after(&mut self, secs: f64, tag: &str);

    fn enable_wirelog(&mut self, enabled: bool);

    /// Split outgoing messages into frames of at most `size` octets
    fn set_auto_fragment_size(&mut self, size: Option<usize>);

    /// permessage-deflate parameters, when negotiated
    fn deflate(&self) -> Option<&DeflateParams>;

    fn closing_facts(&self) -> &ClosingFacts;

    fn trace(&self) -> &WireTrace;

    /// Peer's `User-Agent` or `Server` header
    fn peer_agent(&self) -> Option<&str>;

    /// Negotiated subprotocol
    fn protocol(&self) -> Option<&str> {
        None
    }

    /// Opening handshake request as seen on the wire
    fn http_request(&self) -> Option<&str> {
        None
    }

    fn http_response(&self) -> Option<&str> {
        None
    }
}

/// Everything a [`RecordingConnection`] was asked to do
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Frame(RawFrame),
    Message { payload: Bytes, binary: bool },
    Close { code: Option<u16>, reason: Bytes },
    Fail,
    CloseAfter(f64),
    KillAfter(f64),
    ContinueAfter(f64, String),
    Wirelog(bool),
    AutoFragment(Option<usize>),
}

/// In-memory [`Connection`] that records calls instead of doing I/O
#[derive(Debug)]
pub struct RecordingConnection {
    pub calls: Vec<Recorded>,
    pub state: ConnState,
    pub is_server: bool,
    pub deflate: Option<DeflateParams>,
    pub facts: ClosingFacts,
    pub trace: WireTrace,
    pub peer_agent: Option<String>,
    pub protocol: Option<String>,
}

impl RecordingConnection {
    pub fn new(is_server: bool) -> Self {
        Self {
            calls: Vec::new(),
            state: ConnState::Open,
            is_server,
            deflate: None,
            facts: ClosingFacts::default(),
            trace: WireTrace::new(),
            peer_agent: None,
            protocol: None,
        }
    }

    /// Drain recorded calls
    pub fn take(&mut self) -> Vec<Recorded> {
        std::mem::take(&mut self.calls)
    }
}

impl Connection for RecordingConnection {
    fn is_server(&self) -> bool {
        self.is_server
    }

    fn state(&self) -> ConnState {
        self.state
    }

    fn send_frame(&mut self, frame: RawFrame) {
        self.calls.push(Recorded::Frame(frame));
    }

    fn send_message(&mut self, payload: &[u8], binary: bool) -> Result<()> {
        self.calls.push(Recorded::Message {
            payload: Bytes::copy_from_slice(payload),
            binary,
        });
        Ok(())
    }

    fn send_close(&mut self, code: Option<u16>, reason: &[u8]) {
        if self.state == ConnState::Open {
            self.state = ConnState::Closing;
            self.facts.closed_by_me = true;
            self.facts.local_close_code = code;
        }
        self.calls.push(Recorded::Close {
            code,
            reason: Bytes::copy_from_slice(reason),
        });
    }

    fn fail_connection(&mut self) {
        self.facts.failed_by_me = true;
        self.calls.push(Recorded::Fail);
    }

    fn close_after(&mut self, secs: f64) {
        self.calls.push(Recorded::CloseAfter(secs));
    }

    fn kill_after(&mut self, secs: f64) {
        self.calls.push(Recorded::KillAfter(secs));
    }

    fn continue_after(&mut self, secs: f64, tag: &str) {
        self.calls.push(Recorded::ContinueAfter(secs, tag.to_string()));
    }

    fn enable_wirelog(&mut self, enabled: bool) {
        self.trace.set_enabled(enabled);
        self.calls.push(Recorded::Wirelog(enabled));
    }

    fn set_auto_fragment_size(&mut self, size: Option<usize>) {
        self.calls.push(Recorded::AutoFragment(size));
    }

    fn deflate(&self) -> Option<&DeflateParams> {
        self.deflate.as_ref()
    }

    fn closing_facts(&self) -> &ClosingFacts {
        &self.facts
    }

    fn trace(&self) -> &WireTrace {
        &self.trace
    }

    fn peer_agent(&self) -> Option<&str> {
        self.peer_agent.as_deref()
    }

    fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }
}
