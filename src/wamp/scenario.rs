//! WAMP case parameters
//!
//! A scenario is the WAMP counterpart of a frame script: plain data the
//! catalog carries and [`crate::wamp::WampCase`] interprets.

use serde_json::Value;

/// Seconds the sequencer may wait for one WAMP case before giving up
const CASE_LIMIT_SECS: f64 = 30.0;

#[derive(Debug, Clone, PartialEq)]
pub enum WampScenario {
    PubSub(PubSubScenario),
    RpcEcho(RpcEchoScenario),
}

impl WampScenario {
    pub fn deadline_secs(&self) -> f64 {
        CASE_LIMIT_SECS
    }

    /// Sessions the case opens to the testee
    pub fn session_count(&self) -> usize {
        match self {
            WampScenario::PubSub(s) => s.peers.len(),
            WampScenario::RpcEcho(_) => 1,
        }
    }
}

impl From<PubSubScenario> for WampScenario {
    fn from(s: PubSubScenario) -> Self {
        WampScenario::PubSub(s)
    }
}

impl From<RpcEchoScenario> for WampScenario {
    fn from(s: RpcEchoScenario) -> Self {
        WampScenario::RpcEcho(s)
    }
}

/// How the first session gets its events to the others
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publication {
    /// A PUBLISH message
    Publish,
    /// A call to the testee's dispatch control procedure
    Dispatch,
}

/// Sessions subscribe, the first one publishes, receivers are checked
#[derive(Debug, Clone, PartialEq)]
pub struct PubSubScenario {
    /// Topics each session subscribes to; session 0 is the publisher
    pub peers: Vec<Vec<String>>,
    pub topic: String,
    pub publication: Publication,
    pub exclude_me: Option<bool>,
    /// Session indices
    pub exclude: Option<Vec<usize>>,
    /// Session indices
    pub eligible: Option<Vec<usize>>,
    /// One event per payload, published in order
    pub payloads: Vec<Value>,
    /// Session indices expected to receive every event
    pub receivers: Vec<usize>,
}

/// Numbers sent to an echo procedure, expected back unchanged
#[derive(Debug, Clone, PartialEq)]
pub struct RpcEchoScenario {
    pub procedure: String,
    pub values: Vec<f64>,
}
