//! WAMPv1 conformance cases
//!
//! The WAMP case set checks a broker's publish/subscribe routing and RPC
//! echo over the `wamp` WebSocket subprotocol. A case opens several client
//! sessions at once, so it cannot run as a single-connection frame script.
//! Each session is a [`crate::session::connect`] actor driven by a thin
//! [`peer`] handler, and [`WampCase`] orchestrates them from the outside
//! through channels. [`broker`] is the matching testee.

mod broker;
mod case;
mod message;
mod peer;
mod scenario;

pub use broker::{run_wamp_testee_server, Broker, BrokerSession};
pub use case::{run_fuzzing_wamp_client, WampCase, WampClient, WampOutcome};
pub use message::{PublishOptions, Routing, WampMessage};
pub use scenario::{PubSubScenario, Publication, RpcEchoScenario, WampScenario};

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::session::Deferred;

/// WebSocket subprotocol both sides must agree on
pub const SUBPROTOCOL: &str = "wamp";

/// Procedure the tester calls to have the testee publish on its behalf
pub const CONTROL_DISPATCH: &str = "http://api.testsuite.wamp.ws/testee/control#dispatch";

/// Base URI of the testee's per-case procedures
pub const CASE_URI: &str = "http://api.testsuite.wamp.ws/case";

pub const ERROR_NO_SUCH_PROCEDURE: &str = "http://api.testsuite.wamp.ws/error#noSuchProcedure";
pub const ERROR_INVALID_ARGUMENT: &str = "http://api.testsuite.wamp.ws/error#invalidArgument";

/// Text messages queued for a connection by tasks outside its actor
///
/// Handed to the actor as a [`Deferred`]; a `None` delivery means every
/// sender is gone and the connection should close.
#[derive(Debug)]
struct Mailbox {
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    open: bool,
}

impl Mailbox {
    fn new(rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            open: true,
        }
    }

    fn deferred(&mut self) -> Option<Deferred> {
        if !self.open {
            return None;
        }
        let rx = self.rx.clone();
        Some(Box::pin(async move { rx.lock().await.recv().await }))
    }

    fn close(&mut self) {
        self.open = false;
    }
}

/// One line of a WAMP case log
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Milliseconds since the case started
    pub elapsed_ms: f64,
    pub peer: Option<usize>,
    pub session: Option<String>,
    pub message: String,
}

/// Case log shared by the orchestrator and every peer
#[derive(Debug, Clone)]
pub(crate) struct Transcript {
    started: Instant,
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl Transcript {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn push(&self, peer: Option<usize>, session: Option<&str>, message: impl Into<String>) {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.entries.lock().push(LogEntry {
            elapsed_ms,
            peer,
            session: session.map(str::to_string),
            message: message.into(),
        });
    }

    fn note(&self, message: impl Into<String>) {
        self.push(None, None, message);
    }

    fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }
}
