//! Tester-side WAMP session
//!
//! A peer only relays: messages the orchestrator queues go out as text
//! frames, and everything the testee sends comes back as a [`PeerNotice`].

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use super::message::WampMessage;
use super::{Mailbox, Transcript, SUBPROTOCOL};
use crate::connection::Connection;
use crate::error::{CloseReason, Error, Result};
use crate::session::{self, Deferred, SessionConfig, SessionHandler};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PeerEvent {
    Welcome { session: String, server: String },
    Event { topic: String, event: Value },
    CallResult { call_id: String, result: Value },
    CallError { call_id: String, error: String, description: String },
    /// Connection finished; `error` is set when it never opened
    Gone { error: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PeerNotice {
    pub peer: usize,
    pub event: PeerEvent,
}

pub(crate) struct WampPeer {
    index: usize,
    session: Option<String>,
    /// Why the session was refused after the upgrade
    refused: Option<String>,
    mailbox: Mailbox,
    notices: mpsc::UnboundedSender<PeerNotice>,
    transcript: Transcript,
}

impl WampPeer {
    fn new(
        index: usize,
        rx: mpsc::UnboundedReceiver<String>,
        notices: mpsc::UnboundedSender<PeerNotice>,
        transcript: Transcript,
    ) -> Self {
        Self {
            index,
            session: None,
            refused: None,
            mailbox: Mailbox::new(rx),
            notices,
            transcript,
        }
    }

    fn log(&self, message: impl Into<String>) {
        self.transcript.push(Some(self.index), self.session.as_deref(), message);
    }

    fn notify(&self, event: PeerEvent) {
        let _ = self.notices.send(PeerNotice {
            peer: self.index,
            event,
        });
    }
}

impl SessionHandler for WampPeer {
    fn on_open(&mut self, conn: &mut dyn Connection) -> Result<()> {
        if conn.protocol() != Some(SUBPROTOCOL) {
            let reason = format!("testee did not select the '{}' subprotocol", SUBPROTOCOL);
            self.refused = Some(reason.clone());
            return Err(Error::HandshakeFailed(reason));
        }
        Ok(())
    }

    fn on_message(&mut self, _conn: &mut dyn Connection, payload: Bytes, binary: bool) -> Result<()> {
        if binary {
            return Err(Error::Wamp("binary message on a WAMP session".into()));
        }
        let text = String::from_utf8_lossy(&payload);
        self.log(format!("RX <= {}", text));

        match WampMessage::parse(&text)? {
            WampMessage::Welcome { session, server, .. } => {
                self.session = Some(session.clone());
                self.log(format!("WAMP session {} opened to {}", session, server));
                self.notify(PeerEvent::Welcome { session, server });
            }
            WampMessage::Event { topic, event } => {
                self.notify(PeerEvent::Event { topic, event });
            }
            WampMessage::CallResult { call_id, result } => {
                self.notify(PeerEvent::CallResult { call_id, result });
            }
            WampMessage::CallError {
                call_id,
                error,
                description,
                ..
            } => {
                self.notify(PeerEvent::CallError {
                    call_id,
                    error,
                    description,
                });
            }
            other => {
                return Err(Error::Wamp(format!(
                    "broker sent message type {}",
                    other.type_id()
                )))
            }
        }
        Ok(())
    }

    fn take_deferred(&mut self) -> Option<Deferred> {
        self.mailbox.deferred()
    }

    fn on_deferred(&mut self, conn: &mut dyn Connection, reply: Option<String>) -> Result<()> {
        match reply {
            Some(text) => {
                self.log(format!("TX => {}", text));
                conn.send_message(text.as_bytes(), false)
            }
            None => {
                self.mailbox.close();
                conn.send_close(Some(CloseReason::NORMAL), b"");
                Ok(())
            }
        }
    }

    fn on_connection_lost(&mut self, conn: &dyn Connection) {
        let facts = conn.closing_facts();
        let reason = match &facts.was_not_clean_reason {
            Some(reason) => reason.clone(),
            None if facts.was_clean => "closed cleanly".to_string(),
            None => "closed".to_string(),
        };
        self.log(format!("Client connection lost: {}", reason));
        let error = self.refused.take();
        self.notify(PeerEvent::Gone { error });
    }
}

/// Orchestrator's end of one running peer
pub(crate) struct PeerHandle {
    outbox: Option<mpsc::UnboundedSender<String>>,
    task: JoinHandle<()>,
}

impl PeerHandle {
    /// Connect in the background; notices arrive on `notices`
    pub fn spawn(
        index: usize,
        url: Url,
        config: SessionConfig,
        notices: mpsc::UnboundedSender<PeerNotice>,
        transcript: Transcript,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut peer = WampPeer::new(index, rx, notices.clone(), transcript.clone());
            if let Err(e) = session::connect(&url, config, &mut peer).await {
                tracing::debug!(peer = index, url = %url, error = %e, "WAMP session failed to open");
                transcript.push(Some(index), None, format!("Client connection failed: {}", e));
                let _ = notices.send(PeerNotice {
                    peer: index,
                    event: PeerEvent::Gone {
                        error: Some(e.to_string()),
                    },
                });
            }
        });
        Self {
            outbox: Some(tx),
            task,
        }
    }

    pub fn send(&self, message: &WampMessage) {
        if let Some(tx) = &self.outbox {
            let _ = tx.send(message.to_text());
        }
    }

    /// Ask for a closing handshake once queued messages are out
    pub fn close(&mut self) {
        self.outbox = None;
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}
