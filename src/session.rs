//! Connection actor
//!
//! One tokio task per TCP connection owns an [`Endpoint`]: the read buffer,
//! the write queue, the scheduled actions, the wire trace and the closing
//! handshake bookkeeping. After the opening handshake the task loops over
//! socket reads, timer deadlines and deferred replies, handing messages and
//! timer continuations to a [`SessionHandler`]. Handlers only ever see the
//! endpoint through [`Connection`].
//!
//! The endpoint validates what the peer sends (masking, reserved bits and
//! opcodes, control frame rules, fragmentation, close payloads, UTF-8) and
//! fails the connection on violations. It never validates what it is asked
//! to send: cases rely on putting broken frames on the wire.

use std::collections::VecDeque;
use std::io;
use std::marker::PhantomData;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use url::Url;

use crate::compression::{
    parse_offers, parse_response, AcceptRule, DeflateCodec, DeflateParams, PerMessageDeflateAccept,
    PerMessageDeflateOffer,
};
use crate::connection::{ConnState, Connection};
use crate::error::{CloseReason, Error, Result};
use crate::frame::{
    chop, encode_frame, is_reserved_opcode, Frame, FrameHeader, FrameParser, OpCode, RawFrame,
    MAX_CONTROL_PAYLOAD,
};
use crate::handshake::{
    client_request, error_response, find_header_end, generate_key, server_response,
    HandshakeRequest, HandshakeResponse, MAX_HANDSHAKE_SIZE,
};
use crate::mask::generate_mask;
use crate::outcome::ClosingFacts;
use crate::script::fragment_frames;
use crate::spec::ProtocolOptions;
use crate::timer::{ScheduledAction, ScheduledActionQueue};
use crate::trace::WireTrace;
use crate::utf8::{validate_utf8, Utf8Validator};

/// Agent string sent in `Server` and `User-Agent` headers
pub const DEFAULT_AGENT: &str = concat!("sockudo-wstest/", env!("CARGO_PKG_VERSION"));

const READ_CHUNK: usize = 16 * 1024;

/// Wake-up interval when nothing is scheduled
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

/// Longest close reason that still fits a control frame
const MAX_CLOSE_REASON: usize = MAX_CONTROL_PAYLOAD - 2;

// ============================================================================
// Roles
// ============================================================================

/// Which end of the connection an [`Endpoint`] is
pub trait Role: Send + Sync + 'static {
    const IS_SERVER: bool;

    /// Mask key for frames that do not carry an explicit one
    fn frame_mask() -> Option<[u8; 4]>;
}

/// Accepting side: frames go out unmasked
#[derive(Debug)]
pub struct ServerRole;

impl Role for ServerRole {
    const IS_SERVER: bool = true;

    fn frame_mask() -> Option<[u8; 4]> {
        None
    }
}

/// Connecting side: every frame gets a fresh random mask
#[derive(Debug)]
pub struct ClientRole;

impl Role for ClientRole {
    const IS_SERVER: bool = false;

    fn frame_mask() -> Option<[u8; 4]> {
        Some(generate_mask())
    }
}

pub type ServerConnection = Endpoint<ServerRole>;
pub type ClientConnection = Endpoint<ClientRole>;

// ============================================================================
// Configuration and handler surface
// ============================================================================

/// Per-connection protocol settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub fail_by_drop: bool,
    pub open_handshake_timeout: Duration,
    pub close_handshake_timeout: Duration,
    pub server_connection_drop_timeout: Duration,
    pub max_message_size: usize,
    /// Sent as `Server` (server role) or `User-Agent` (client role)
    pub agent: String,
    /// Client role: subprotocols offered in the upgrade request
    pub protocols: Vec<String>,
}

impl SessionConfig {
    pub fn from_options(options: &ProtocolOptions, agent: impl Into<String>) -> Self {
        Self {
            fail_by_drop: options.fail_by_drop(),
            open_handshake_timeout: options.open_handshake_timeout(),
            close_handshake_timeout: options.close_handshake_timeout(),
            server_connection_drop_timeout: options.server_connection_drop_timeout(),
            max_message_size: options.max_message_size(),
            agent: agent.into(),
            protocols: Vec::new(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_options(&ProtocolOptions::default(), DEFAULT_AGENT)
    }
}

/// Reply a handler waits for outside its own connection
pub type Deferred = BoxFuture<'static, Option<String>>;

/// Callbacks the connection actor drives
///
/// Errors returned from a hook fail the connection with the error's close
/// code; they never escape the actor.
pub trait SessionHandler: Send {
    /// Server role: inspect the upgrade request before answering it
    ///
    /// The returned rules decide which permessage-deflate offer, if any, is
    /// accepted. An error rejects the upgrade with an HTTP error response.
    fn on_request(&mut self, _request: &HandshakeRequest) -> Result<Vec<AcceptRule>> {
        Ok(Vec::new())
    }

    /// Server role: pick one of the subprotocols the client offered
    fn select_protocol(&mut self, _offered: &[&str]) -> Option<String> {
        None
    }

    /// Client role: permessage-deflate offers for the upgrade request
    fn deflate_offers(&self) -> Vec<PerMessageDeflateOffer> {
        Vec::new()
    }

    fn on_open(&mut self, conn: &mut dyn Connection) -> Result<()>;

    fn on_message(&mut self, conn: &mut dyn Connection, payload: Bytes, binary: bool) -> Result<()>;

    fn on_pong(&mut self, _conn: &mut dyn Connection, _payload: Bytes) -> Result<()> {
        Ok(())
    }

    /// A `continue_after` timer fired
    fn on_continue(&mut self, _conn: &mut dyn Connection, _tag: &str) -> Result<()> {
        Ok(())
    }

    /// Hand the actor a reply to wait for; polled after every hook
    fn take_deferred(&mut self) -> Option<Deferred> {
        None
    }

    fn on_deferred(&mut self, _conn: &mut dyn Connection, _reply: Option<String>) -> Result<()> {
        Ok(())
    }

    /// The TCP connection is gone; `conn` holds the final closing facts
    fn on_connection_lost(&mut self, _conn: &dyn Connection) {}
}

// ============================================================================
// Endpoint
// ============================================================================

#[derive(Debug)]
struct Outgoing {
    data: Bytes,
    /// Write and flush on its own
    sync: bool,
}

/// Text or binary message being reassembled from fragments
#[derive(Debug)]
struct Assembly {
    binary: bool,
    compressed: bool,
    data: BytesMut,
    utf8: Utf8Validator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// Flush pending writes, then close the socket
    Graceful,
    /// Close the socket, discarding pending writes
    Abort,
}

enum Wake {
    Timer,
    Read(io::Result<usize>),
    Deferred(Option<String>),
}

/// One side of a WebSocket connection
#[derive(Debug)]
pub struct Endpoint<R: Role> {
    config: SessionConfig,
    state: ConnState,
    facts: ClosingFacts,
    trace: WireTrace,
    timers: ScheduledActionQueue,
    outbox: VecDeque<Outgoing>,
    codec: Option<DeflateCodec>,
    auto_fragment: Option<usize>,
    parser: FrameParser,
    read_buf: BytesMut,
    assembly: Option<Assembly>,
    close_received: bool,
    /// Framing was lost; later input is ignored
    discard_input: bool,
    teardown: Option<Teardown>,
    close_deadline: Option<Instant>,
    drop_deadline: Option<Instant>,
    peer_agent: Option<String>,
    protocol: Option<String>,
    http_request: Option<String>,
    http_response: Option<String>,
    _role: PhantomData<R>,
}

impl<R: Role> Endpoint<R> {
    pub fn new(config: SessionConfig) -> Self {
        let parser = FrameParser::new(config.max_message_size);
        Self {
            config,
            state: ConnState::Connecting,
            facts: ClosingFacts::default(),
            trace: WireTrace::new(),
            timers: ScheduledActionQueue::new(),
            outbox: VecDeque::new(),
            codec: None,
            auto_fragment: None,
            parser,
            read_buf: BytesMut::new(),
            assembly: None,
            close_received: false,
            discard_input: false,
            teardown: None,
            close_deadline: None,
            drop_deadline: None,
            peer_agent: None,
            protocol: None,
            http_request: None,
            http_response: None,
            _role: PhantomData,
        }
    }

    /// Opening handshake completed
    pub fn open(&mut self, deflate: Option<DeflateParams>) {
        self.codec = deflate.map(|params| DeflateCodec::new(params, R::IS_SERVER));
        self.state = ConnState::Open;
    }

    fn queue_frame(&mut self, frame: &RawFrame) {
        let payload = frame.effective_payload();
        let header = frame.header(R::frame_mask());
        self.trace
            .log_tx_frame(&header, &payload, frame.repeat_len, frame.chopsize, frame.sync);

        let mut buf = BytesMut::with_capacity(header.encoded_len() + payload.len());
        encode_frame(&header, &payload, &mut buf);
        let chunks = chop(buf.freeze(), frame.chopsize);
        let sync = frame.sync || chunks.len() > 1;
        self.outbox
            .extend(chunks.into_iter().map(|data| Outgoing { data, sync }));
    }

    /// Send a close frame; `is_reply` answers the peer's close
    fn close_frame(&mut self, code: Option<u16>, reason: &[u8], is_reply: bool) {
        if self.state != ConnState::Open {
            tracing::debug!(state = ?self.state, "close frame not sent, connection is not open");
            return;
        }
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        if let Some(code) = code {
            payload.put_u16(code);
        }
        payload.put_slice(reason);
        self.queue_frame(&RawFrame::new(OpCode::Close.as_u8(), payload.freeze()));

        self.state = ConnState::Closing;
        self.facts.closed_by_me = !is_reply;
        self.facts.local_close_code = code;
        self.facts.local_close_reason =
            (!reason.is_empty()).then(|| String::from_utf8_lossy(reason).into_owned());
        if !is_reply {
            self.close_deadline = Some(Instant::now() + self.config.close_handshake_timeout);
        }
    }

    fn fail(&mut self, code: u16, reason: &str) {
        if self.state == ConnState::Closed {
            return;
        }
        self.facts.failed_by_me = true;
        if self.config.fail_by_drop {
            self.facts.was_clean = false;
            self.facts.was_not_clean_reason =
                Some("I failed the WebSocket connection by dropping the TCP connection".into());
            self.drop_connection(Teardown::Abort);
            return;
        }
        if self.state == ConnState::Open {
            self.close_frame(Some(code), truncate_reason(reason).as_bytes(), false);
        }
        if self.close_received {
            self.finish_close_handshake();
        }
    }

    fn fail_with(&mut self, err: &Error) {
        tracing::debug!(error = %err, kind = err.metric_name(), "failing connection");
        self.fail(err.close_code(), &err.to_string());
    }

    /// Both close frames are exchanged: the server drops TCP, the client
    /// waits for it to
    fn finish_close_handshake(&mut self) {
        self.close_deadline = None;
        if R::IS_SERVER {
            self.drop_connection(Teardown::Graceful);
        } else if self.drop_deadline.is_none() {
            self.drop_deadline = Some(Instant::now() + self.config.server_connection_drop_timeout);
        }
    }

    fn drop_connection(&mut self, how: Teardown) {
        if self.teardown.is_none() {
            self.facts.dropped_by_me = true;
            self.teardown = Some(how);
        }
    }

    /// Frames received in this state reach the handler
    fn delivers(&self) -> bool {
        match self.state {
            ConnState::Open => true,
            ConnState::Closing => !self.close_received && !self.facts.failed_by_me,
            ConnState::Connecting | ConnState::Closed => false,
        }
    }

    fn accepts_input(&self) -> bool {
        self.state != ConnState::Closed && self.teardown.is_none() && !self.discard_input
    }

    /// Append received octets and process every complete frame
    pub fn feed(&mut self, data: &[u8], handler: &mut dyn SessionHandler) {
        self.read_buf.extend_from_slice(data);
        self.after_read(data.len(), handler);
    }

    fn after_read(&mut self, n: usize, handler: &mut dyn SessionHandler) {
        let start = self.read_buf.len() - n;
        self.trace.log_rx(&self.read_buf[start..]);
        self.process_incoming(handler);
    }

    fn process_incoming(&mut self, handler: &mut dyn SessionHandler) {
        while self.accepts_input() {
            let frame = match self.parser.parse(&mut self.read_buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    // the oversized payload is still in the stream
                    self.read_buf.clear();
                    self.discard_input = true;
                    self.fail_with(&e);
                    break;
                }
            };
            self.trace.log_rx_frame(&frame.header, &frame.payload);
            if let Err(e) = self.on_frame(frame, handler) {
                self.fail_with(&e);
            }
        }
    }

    fn on_frame(&mut self, frame: Frame, handler: &mut dyn SessionHandler) -> Result<()> {
        let Frame { header, payload } = frame;

        if R::IS_SERVER != header.mask.is_some() {
            return Err(Error::Protocol(if R::IS_SERVER {
                "unmasked frame from client"
            } else {
                "masked frame from server"
            }));
        }
        if is_reserved_opcode(header.opcode) {
            return Err(Error::Protocol("reserved opcode"));
        }
        if !header.is_control() {
            return self.on_data_frame(header, payload, handler);
        }

        if let Err(e) = check_control_frame(&header, payload.len()) {
            // a malformed close still ends the peer's side of the handshake
            if header.opcode == OpCode::Close.as_u8() {
                self.close_received = true;
            }
            return Err(e);
        }
        match OpCode::from_u8(header.opcode) {
            Some(OpCode::Close) => self.on_close_frame(&payload),
            Some(OpCode::Ping) => {
                if self.state == ConnState::Open {
                    self.queue_frame(&RawFrame::pong(payload));
                }
                Ok(())
            }
            Some(OpCode::Pong) if self.delivers() => handler.on_pong(self, payload),
            Some(OpCode::Pong) => Ok(()),
            _ => Err(Error::Protocol("reserved opcode")),
        }
    }

    fn on_data_frame(
        &mut self,
        header: FrameHeader,
        payload: Bytes,
        handler: &mut dyn SessionHandler,
    ) -> Result<()> {
        let compressed = header.rsv1();
        if header.rsv & 0x3 != 0 {
            return Err(Error::Protocol("reserved bits set"));
        }
        if header.opcode == OpCode::Continuation.as_u8() {
            if compressed {
                return Err(Error::Protocol("RSV1 set on continuation frame"));
            }
            if self.assembly.is_none() {
                return Err(Error::Protocol("continuation frame without a message in progress"));
            }
        } else {
            if self.assembly.is_some() {
                return Err(Error::Protocol("data frame while a fragmented message is in progress"));
            }
            if compressed && self.codec.is_none() {
                return Err(Error::Protocol("RSV1 set without negotiated compression"));
            }
            self.assembly = Some(Assembly {
                binary: header.opcode == OpCode::Binary.as_u8(),
                compressed,
                data: BytesMut::new(),
                utf8: Utf8Validator::new(),
            });
        }

        let max = self.config.max_message_size;
        let Some(asm) = self.assembly.as_mut() else {
            return Ok(());
        };
        if asm.data.len() + payload.len() > max {
            return Err(Error::FrameTooLarge);
        }
        if !asm.binary && !asm.compressed {
            let status = asm.utf8.validate(&payload);
            if !status.valid || (header.fin && !status.ends_on_codepoint) {
                return Err(Error::InvalidUtf8);
            }
        }
        asm.data.extend_from_slice(&payload);
        if !header.fin {
            return Ok(());
        }

        let Some(Assembly {
            binary,
            compressed,
            data,
            ..
        }) = self.assembly.take()
        else {
            return Ok(());
        };
        let wire_len = data.len();
        let data = match self.codec.as_mut() {
            Some(codec) if compressed => codec.decompress(&data, max)?,
            _ => data.freeze(),
        };
        if !binary && compressed && !validate_utf8(&data) {
            return Err(Error::InvalidUtf8);
        }
        self.trace.record_incoming_message(data.len(), wire_len);

        if self.delivers() {
            handler.on_message(self, data, binary)?;
        }
        Ok(())
    }

    fn on_close_frame(&mut self, payload: &[u8]) -> Result<()> {
        if self.close_received {
            return Ok(());
        }
        self.close_received = true;

        match payload.len() {
            0 => {}
            1 => return Err(Error::Protocol("close frame payload of 1 octet")),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                self.facts.remote_close_code = Some(code);
                if !CloseReason::is_valid_code(code) {
                    return Err(Error::InvalidCloseCode(code));
                }
                let reason = &payload[2..];
                if !validate_utf8(reason) {
                    return Err(Error::InvalidUtf8);
                }
                self.facts.remote_close_reason =
                    (!reason.is_empty()).then(|| String::from_utf8_lossy(reason).into_owned());
            }
        }

        self.facts.was_clean = true;
        if self.state == ConnState::Open {
            // echo the peer's code, without a reason
            self.close_frame(self.facts.remote_close_code, b"", true);
        }
        self.finish_close_handshake();
        Ok(())
    }

    /// Earliest timer, close-handshake or server-drop deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.timers.next_deadline(),
            self.close_deadline,
            self.drop_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub(crate) fn fire_due(&mut self, handler: &mut dyn SessionHandler) {
        let now = Instant::now();
        if self.close_deadline.is_some_and(|d| d <= now) {
            self.close_deadline = None;
            self.facts.was_close_handshake_timeout = true;
            self.facts.was_clean = false;
            self.facts.was_not_clean_reason =
                Some("peer did not respond (in time) in closing handshake".into());
            self.drop_connection(Teardown::Abort);
        }
        if self.drop_deadline.is_some_and(|d| d <= now) {
            self.drop_deadline = None;
            self.facts.was_server_connection_drop_timeout = true;
            self.drop_connection(Teardown::Abort);
        }

        while self.teardown.is_none() {
            let Some(action) = self.timers.pop_due(now, self.state, &mut self.trace) else {
                break;
            };
            match action {
                ScheduledAction::Close => self.close_frame(None, b"", false),
                ScheduledAction::Kill => self.fail(CloseReason::GOING_AWAY, "Going Away"),
                ScheduledAction::Continue(tag) => {
                    if let Err(e) = handler.on_continue(self, &tag) {
                        self.fail_with(&e);
                    }
                }
            }
        }
    }

    pub(crate) fn connection_lost(&mut self) {
        self.state = ConnState::Closed;
        self.close_deadline = None;
        self.drop_deadline = None;
        if !self.facts.was_clean && self.facts.was_not_clean_reason.is_none() {
            self.facts.was_not_clean_reason = Some(if self.facts.dropped_by_me {
                "I dropped the TCP connection".into()
            } else {
                "peer dropped the TCP connection without previous WebSocket closing handshake".into()
            });
        }
        tracing::debug!(
            server = R::IS_SERVER,
            clean = self.facts.was_clean,
            dropped_by_me = self.facts.dropped_by_me,
            remote_code = ?self.facts.remote_close_code,
            "connection lost"
        );
    }

    async fn flush(&mut self, stream: &mut TcpStream) -> io::Result<()> {
        while let Some(out) = self.outbox.pop_front() {
            self.trace.log_tx(&out.data, out.sync);
            stream.write_all(&out.data).await?;
            if out.sync {
                stream.flush().await?;
                tokio::task::yield_now().await;
            }
        }
        stream.flush().await
    }

    /// Drive the open connection until the socket is gone
    async fn run(mut self, mut stream: TcpStream, handler: &mut dyn SessionHandler) {
        if let Err(e) = handler.on_open(&mut self) {
            self.fail_with(&e);
        }
        // frames that arrived together with the handshake
        if !self.read_buf.is_empty() {
            self.process_incoming(handler);
        }
        let mut deferred = handler.take_deferred();

        loop {
            if self.teardown != Some(Teardown::Abort) {
                if let Err(e) = self.flush(&mut stream).await {
                    tracing::debug!(error = %e, "write failed");
                    break;
                }
            }
            if self.teardown.is_some() {
                let _ = stream.shutdown().await;
                break;
            }

            let sleep_at = self
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE_WAKEUP);
            self.read_buf.reserve(READ_CHUNK);

            let wake = tokio::select! {
                biased;

                _ = tokio::time::sleep_until(sleep_at) => Wake::Timer,
                read = stream.read_buf(&mut self.read_buf) => Wake::Read(read),
                reply = wait_deferred(&mut deferred) => Wake::Deferred(reply),
            };

            match wake {
                Wake::Timer => self.fire_due(handler),
                Wake::Read(Ok(0)) => {
                    tracing::debug!("peer closed the TCP connection");
                    break;
                }
                Wake::Read(Ok(n)) => self.after_read(n, handler),
                Wake::Read(Err(e)) => {
                    tracing::debug!(error = %e, "read failed");
                    break;
                }
                Wake::Deferred(reply) => {
                    deferred = None;
                    if let Err(e) = handler.on_deferred(&mut self, reply) {
                        self.fail_with(&e);
                    }
                }
            }
            if deferred.is_none() {
                deferred = handler.take_deferred();
            }
        }

        self.connection_lost();
        handler.on_connection_lost(&self);
    }

    #[cfg(test)]
    pub(crate) fn written(&mut self) -> BytesMut {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.outbox.pop_front() {
            out.extend_from_slice(&chunk.data);
        }
        out
    }
}

fn check_control_frame(header: &FrameHeader, len: usize) -> Result<()> {
    if header.rsv != 0 {
        return Err(Error::Protocol("reserved bits set on control frame"));
    }
    if !header.fin {
        return Err(Error::Protocol("fragmented control frame"));
    }
    if len > MAX_CONTROL_PAYLOAD {
        return Err(Error::Protocol("control frame payload exceeds 125 octets"));
    }
    Ok(())
}

async fn wait_deferred(slot: &mut Option<Deferred>) -> Option<String> {
    match slot {
        Some(reply) => reply.await,
        None => std::future::pending().await,
    }
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

impl<R: Role> Connection for Endpoint<R> {
    fn is_server(&self) -> bool {
        R::IS_SERVER
    }

    fn state(&self) -> ConnState {
        self.state
    }

    fn send_frame(&mut self, frame: RawFrame) {
        if self.state == ConnState::Closed || self.teardown.is_some() {
            tracing::debug!(opcode = frame.opcode, "frame not sent, connection is going away");
            return;
        }
        self.queue_frame(&frame);
    }

    fn send_message(&mut self, payload: &[u8], binary: bool) -> Result<()> {
        if self.state != ConnState::Open {
            tracing::debug!(state = ?self.state, "message not sent, connection is not open");
            return Ok(());
        }
        let opcode = if binary {
            OpCode::Binary.as_u8()
        } else {
            OpCode::Text.as_u8()
        };
        let (data, compressed) = match self.codec.as_mut() {
            Some(codec) => (codec.compress(payload)?, true),
            None => (Bytes::copy_from_slice(payload), false),
        };
        self.trace.record_outgoing_message(payload.len(), data.len());

        let frames = match self.auto_fragment {
            Some(size) if size > 0 => fragment_frames(&data, opcode, size),
            _ => vec![RawFrame::new(opcode, data)],
        };
        for (i, frame) in frames.into_iter().enumerate() {
            let frame = if compressed && i == 0 { frame.rsv(0x4) } else { frame };
            self.queue_frame(&frame);
        }
        Ok(())
    }

    fn send_close(&mut self, code: Option<u16>, reason: &[u8]) {
        self.close_frame(code, reason, false);
    }

    fn fail_connection(&mut self) {
        self.fail(CloseReason::GOING_AWAY, "Going Away");
    }

    fn close_after(&mut self, secs: f64) {
        self.timers.close_after(Instant::now(), secs, &mut self.trace);
    }

    fn kill_after(&mut self, secs: f64) {
        self.timers.kill_after(Instant::now(), secs, &mut self.trace);
    }

    fn continue_after(&mut self, secs: f64, tag: &str) {
        self.timers
            .continue_after(Instant::now(), secs, tag, &mut self.trace);
    }

    fn enable_wirelog(&mut self, enabled: bool) {
        self.trace.set_enabled(enabled);
    }

    fn set_auto_fragment_size(&mut self, size: Option<usize>) {
        self.auto_fragment = size;
    }

    fn deflate(&self) -> Option<&DeflateParams> {
        self.codec.as_ref().map(DeflateCodec::params)
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

    fn http_request(&self) -> Option<&str> {
        self.http_request.as_deref()
    }

    fn http_response(&self) -> Option<&str> {
        self.http_response.as_deref()
    }
}

// ============================================================================
// Opening handshakes
// ============================================================================

/// Read up to and including the blank line ending an HTTP header block
async fn read_head(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    trace: &mut WireTrace,
) -> Result<BytesMut> {
    loop {
        if let Some(end) = find_header_end(buf) {
            return Ok(buf.split_to(end));
        }
        if buf.len() > MAX_HANDSHAKE_SIZE {
            return Err(Error::InvalidHttp("handshake header block too large".into()));
        }
        buf.reserve(4096);
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        trace.log_rx(&buf[buf.len() - n..]);
    }
}

impl Endpoint<ServerRole> {
    /// Answer a parsed upgrade request; returns the response to send
    fn negotiate(&mut self, head: &[u8], handler: &mut dyn SessionHandler) -> Result<String> {
        let request = HandshakeRequest::parse(head)?;
        self.http_request = Some(String::from_utf8_lossy(head).into_owned());
        self.peer_agent = request.header("User-Agent").map(str::to_string);
        let key = request.websocket_key()?.to_string();

        let rules = handler.on_request(&request)?;
        let offered = request.protocols();
        self.protocol = handler
            .select_protocol(&offered)
            .filter(|p| offered.contains(&p.as_str()));
        let offers = request
            .header("Sec-WebSocket-Extensions")
            .map(parse_offers)
            .unwrap_or_default();
        let accept = PerMessageDeflateAccept::choose(&rules, &offers);
        let extensions = accept.map(|a| a.to_header_value());
        self.codec = accept.map(|a| DeflateCodec::new(a.params(), true));

        Ok(server_response(
            &key,
            extensions.as_deref(),
            self.protocol.as_deref(),
            &self.config.agent,
        ))
    }

    async fn accept_handshake(
        &mut self,
        stream: &mut TcpStream,
        handler: &mut dyn SessionHandler,
    ) -> Result<()> {
        let head = read_head(stream, &mut self.read_buf, &mut self.trace).await?;
        match self.negotiate(&head, handler) {
            Ok(response) => {
                self.trace.log_tx(response.as_bytes(), false);
                stream.write_all(response.as_bytes()).await?;
                self.http_response = Some(response);
                self.state = ConnState::Open;
                Ok(())
            }
            Err(e) => {
                let status = match e {
                    Error::CaseSelection(_) => 404,
                    _ => 400,
                };
                let response = error_response(status, &e.to_string());
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
                Err(e)
            }
        }
    }
}

/// Run the server side of one accepted TCP connection
pub async fn serve(
    mut stream: TcpStream,
    config: SessionConfig,
    handler: &mut dyn SessionHandler,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let mut endpoint = ServerConnection::new(config);
    let timeout = endpoint.config.open_handshake_timeout;
    match tokio::time::timeout(timeout, endpoint.accept_handshake(&mut stream, handler)).await {
        Ok(result) => result?,
        Err(_) => return Err(Error::HandshakeTimeout),
    }
    endpoint.run(stream, handler).await;
    Ok(())
}

impl Endpoint<ClientRole> {
    async fn open_client(
        &mut self,
        url: &Url,
        offers: &[PerMessageDeflateOffer],
    ) -> Result<TcpStream> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidHttp(format!("url '{}' has no host", url)))?;
        let port = url.port_or_known_default().unwrap_or(80);
        let mut stream = TcpStream::connect((host, port)).await?;
        let _ = stream.set_nodelay(true);

        let key = generate_key();
        let extensions = (!offers.is_empty()).then(|| {
            offers
                .iter()
                .map(PerMessageDeflateOffer::to_header_value)
                .collect::<Vec<_>>()
                .join(", ")
        });
        let request = client_request(
            url,
            &key,
            extensions.as_deref(),
            &self.config.protocols,
            &self.config.agent,
        )?;
        self.trace.log_tx(request.as_bytes(), false);
        stream.write_all(request.as_bytes()).await?;
        self.http_request = Some(request);

        let head = read_head(&mut stream, &mut self.read_buf, &mut self.trace).await?;
        self.http_response = Some(String::from_utf8_lossy(&head).into_owned());
        let response = HandshakeResponse::parse(&head)?;
        response.verify(&key)?;
        self.protocol = response.protocol(&self.config.protocols)?;
        self.peer_agent = response.header("Server").map(str::to_string);

        let deflate = match response.header("Sec-WebSocket-Extensions") {
            Some(header) => parse_response(header)?,
            None => None,
        };
        if deflate.is_some() && offers.is_empty() {
            return Err(Error::HandshakeFailed(
                "server accepted an extension that was not offered".into(),
            ));
        }
        self.open(deflate);
        Ok(stream)
    }
}

/// Connect to `url` and run the client side of the connection
pub async fn connect(
    url: &Url,
    config: SessionConfig,
    handler: &mut dyn SessionHandler,
) -> Result<()> {
    let mut endpoint = ClientConnection::new(config);
    let offers = handler.deflate_offers();
    let timeout = endpoint.config.open_handshake_timeout;
    let stream = match tokio::time::timeout(timeout, endpoint.open_client(url, &offers)).await {
        Ok(result) => result?,
        Err(_) => return Err(Error::HandshakeTimeout),
    };
    endpoint.run(stream, handler).await;
    Ok(())
}
