//! WAMPv1 testee broker
//!
//! A small publish/subscribe broker and RPC endpoint with the topics and
//! procedures the WAMP case set exercises. Every connection is a
//! [`BrokerSession`] on the shared session engine; events for other
//! sessions travel through each session's mailbox.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use super::message::{PublishOptions, Routing, WampMessage, PROTOCOL_VERSION};
use super::{Mailbox, CASE_URI, CONTROL_DISPATCH, ERROR_INVALID_ARGUMENT, ERROR_NO_SUCH_PROCEDURE, SUBPROTOCOL};
use crate::compression::AcceptRule;
use crate::connection::Connection;
use crate::error::{CloseReason, Error, Result};
use crate::handshake::HandshakeRequest;
use crate::session::{self, Deferred, SessionConfig, SessionHandler};

/// Topics the case set publishes to
const TESTSUITE_TOPICS: &[(&str, bool)] = &[
    ("http://example.com/simple", true),
    ("http://example.com/foobar", false),
];

#[derive(Debug, Clone)]
struct TopicRule {
    uri: String,
    /// Also matches every URI that starts with `uri`
    prefix: bool,
}

impl TopicRule {
    fn matches(&self, topic: &str) -> bool {
        if self.prefix {
            topic.starts_with(&self.uri)
        } else {
            topic == self.uri
        }
    }
}

#[derive(Debug, Default)]
struct BrokerInner {
    sessions: HashMap<String, mpsc::UnboundedSender<String>>,
    topics: Vec<TopicRule>,
    subscriptions: BTreeMap<String, BTreeSet<String>>,
}

/// State shared by every session of one testee server
#[derive(Debug)]
pub struct Broker {
    agent: String,
    inner: Mutex<BrokerInner>,
}

impl Broker {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            inner: Mutex::new(BrokerInner::default()),
        }
    }

    /// Broker with the case set's topics registered
    pub fn testsuite(agent: impl Into<String>) -> Self {
        let broker = Self::new(agent);
        for (uri, prefix) in TESTSUITE_TOPICS {
            broker.register_topic(*uri, *prefix);
        }
        broker
    }

    pub fn register_topic(&self, uri: impl Into<String>, prefix: bool) {
        self.inner.lock().topics.push(TopicRule {
            uri: uri.into(),
            prefix,
        });
    }

    pub fn is_registered(&self, topic: &str) -> bool {
        self.inner.lock().topics.iter().any(|t| t.matches(topic))
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    fn join(&self, outbox: mpsc::UnboundedSender<String>) -> String {
        let mut inner = self.inner.lock();
        loop {
            let id: String = std::iter::repeat_with(fastrand::alphanumeric).take(16).collect();
            if !inner.sessions.contains_key(&id) {
                inner.sessions.insert(id.clone(), outbox);
                return id;
            }
        }
    }

    fn leave(&self, session: &str) {
        let mut inner = self.inner.lock();
        inner.sessions.remove(session);
        for subscribers in inner.subscriptions.values_mut() {
            subscribers.remove(session);
        }
        inner.subscriptions.retain(|_, s| !s.is_empty());
    }

    /// Subscribe `session`; unregistered topics are ignored
    pub fn subscribe(&self, session: &str, topic: &str) -> bool {
        let mut inner = self.inner.lock();
        if !inner.topics.iter().any(|t| t.matches(topic)) {
            return false;
        }
        inner
            .subscriptions
            .entry(topic.to_string())
            .or_default()
            .insert(session.to_string());
        true
    }

    pub fn unsubscribe(&self, session: &str, topic: &str) {
        let mut inner = self.inner.lock();
        if let Some(subscribers) = inner.subscriptions.get_mut(topic) {
            subscribers.remove(session);
        }
    }

    /// Send an EVENT to every admitted subscriber; returns how many got it
    pub fn publish(&self, topic: &str, event: &Value, routing: &Routing, publisher: &str) -> usize {
        let inner = self.inner.lock();
        if !inner.topics.iter().any(|t| t.matches(topic)) {
            tracing::debug!(topic, "publication to unregistered topic dropped");
            return 0;
        }
        let Some(subscribers) = inner.subscriptions.get(topic) else {
            return 0;
        };
        let text = WampMessage::Event {
            topic: topic.to_string(),
            event: event.clone(),
        }
        .to_text();

        subscribers
            .iter()
            .filter(|s| routing.admits(publisher, s))
            .filter_map(|s| inner.sessions.get(s))
            .filter(|tx| tx.send(text.clone()).is_ok())
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Procedure {
    Dispatch,
    Echo,
    Concat,
    Add,
}

fn procedure(uri: &str) -> Option<Procedure> {
    if uri == CONTROL_DISPATCH {
        return Some(Procedure::Dispatch);
    }
    let case = uri.strip_prefix(CASE_URI)?.strip_prefix('/')?;
    let (id, reference) = match case.split_once('#') {
        Some((id, r)) => (id, Some(r)),
        None => (case, None),
    };
    match (id, reference) {
        ("3.1.1" | "3.1.2", Some("1" | "2" | "3" | "4")) | ("1.3.1", None) => Some(Procedure::Echo),
        ("1.1.5", None) => Some(Procedure::Concat),
        ("1.2.4" | "1.2.5", None) => Some(Procedure::Add),
        _ => None,
    }
}

#[derive(Debug)]
struct CallFailure {
    error: &'static str,
    description: String,
}

impl CallFailure {
    fn invalid(description: impl Into<String>) -> Self {
        Self {
            error: ERROR_INVALID_ARGUMENT,
            description: description.into(),
        }
    }
}

fn add(args: &[Value]) -> std::result::Result<Value, CallFailure> {
    if args.len() < 2 || !args.iter().all(Value::is_number) {
        return Err(CallFailure::invalid("expected two or more numbers"));
    }
    let integers: Option<Vec<i64>> = args.iter().map(Value::as_i64).collect();
    if let Some(sum) = integers.and_then(|n| n.into_iter().try_fold(0i64, i64::checked_add)) {
        return Ok(json!(sum));
    }
    Ok(json!(args.iter().filter_map(Value::as_f64).sum::<f64>()))
}

/// One client connection to the broker
pub struct BrokerSession {
    broker: Arc<Broker>,
    session: Option<String>,
    mailbox: Option<Mailbox>,
    prefixes: HashMap<String, String>,
}

impl BrokerSession {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            session: None,
            mailbox: None,
            prefixes: HashMap::new(),
        }
    }

    /// Expand a CURIE whose prefix this session declared
    fn resolve(&self, uri: &str) -> String {
        match uri.split_once(':') {
            Some((prefix, rest)) => match self.prefixes.get(prefix) {
                Some(base) => format!("{}{}", base, rest),
                None => uri.to_string(),
            },
            None => uri.to_string(),
        }
    }

    fn call(&self, me: &str, uri: &str, args: Vec<Value>) -> std::result::Result<Value, CallFailure> {
        let proc = procedure(uri).ok_or_else(|| CallFailure {
            error: ERROR_NO_SUCH_PROCEDURE,
            description: format!("no procedure registered for {}", uri),
        })?;
        match proc {
            Procedure::Dispatch => {
                let [topic, event, options] = <[Value; 3]>::try_from(args)
                    .map_err(|_| CallFailure::invalid("expected topic, event and options"))?;
                let topic = topic
                    .as_str()
                    .map(|t| self.resolve(t))
                    .ok_or_else(|| CallFailure::invalid("topic is not a string"))?;
                let options: PublishOptions = serde_json::from_value(options)
                    .map_err(|e| CallFailure::invalid(format!("bad dispatch options: {}", e)))?;
                let routing = options.routing(me);
                let sent = self.broker.publish(&topic, &event, &routing, me);
                tracing::debug!(topic = %topic, receivers = sent, "dispatched on request");
                Ok(Value::Null)
            }
            Procedure::Echo => match <[Value; 1]>::try_from(args) {
                Ok([value]) => Ok(value),
                Err(_) => Err(CallFailure::invalid("expected exactly one argument")),
            },
            Procedure::Concat => match args.as_slice() {
                [Value::String(a), Value::String(b)] => Ok(Value::String(format!("{}{}", a, b))),
                _ => Err(CallFailure::invalid("expected two strings")),
            },
            Procedure::Add => add(&args),
        }
    }
}

impl SessionHandler for BrokerSession {
    fn on_request(&mut self, request: &HandshakeRequest) -> Result<Vec<AcceptRule>> {
        if !request.protocols().contains(&SUBPROTOCOL) {
            return Err(Error::HandshakeFailed(format!(
                "client did not offer the '{}' subprotocol",
                SUBPROTOCOL
            )));
        }
        Ok(Vec::new())
    }

    fn select_protocol(&mut self, offered: &[&str]) -> Option<String> {
        offered
            .contains(&SUBPROTOCOL)
            .then(|| SUBPROTOCOL.to_string())
    }

    fn on_open(&mut self, conn: &mut dyn Connection) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = self.broker.join(tx);
        self.mailbox = Some(Mailbox::new(rx));
        let welcome = WampMessage::Welcome {
            session: session.clone(),
            version: PROTOCOL_VERSION,
            server: self.broker.agent.clone(),
        };
        tracing::debug!(session = %session, "WAMP session opened");
        self.session = Some(session);
        conn.send_message(welcome.to_text().as_bytes(), false)
    }

    fn on_message(&mut self, conn: &mut dyn Connection, payload: Bytes, binary: bool) -> Result<()> {
        if binary {
            return Err(Error::Wamp("binary message on a WAMP session".into()));
        }
        let me = self
            .session
            .clone()
            .ok_or_else(|| Error::Wamp("message before the session opened".into()))?;

        match WampMessage::parse(&String::from_utf8_lossy(&payload))? {
            WampMessage::Prefix { prefix, uri } => {
                self.prefixes.insert(prefix, uri);
            }
            WampMessage::Call {
                call_id,
                procedure,
                args,
            } => {
                let uri = self.resolve(&procedure);
                let reply = match self.call(&me, &uri, args) {
                    Ok(result) => WampMessage::CallResult { call_id, result },
                    Err(failure) => WampMessage::CallError {
                        call_id,
                        error: failure.error.to_string(),
                        description: failure.description,
                        details: None,
                    },
                };
                conn.send_message(reply.to_text().as_bytes(), false)?;
            }
            WampMessage::Subscribe { topic } => {
                let topic = self.resolve(&topic);
                if !self.broker.subscribe(&me, &topic) {
                    tracing::debug!(session = %me, topic = %topic, "subscription to unregistered topic ignored");
                }
            }
            WampMessage::Unsubscribe { topic } => {
                let topic = self.resolve(&topic);
                self.broker.unsubscribe(&me, &topic);
            }
            WampMessage::Publish { topic, event, routing } => {
                let topic = self.resolve(&topic);
                self.broker.publish(&topic, &event, &routing, &me);
            }
            other => {
                return Err(Error::Wamp(format!(
                    "client sent message type {}",
                    other.type_id()
                )))
            }
        }
        Ok(())
    }

    fn take_deferred(&mut self) -> Option<Deferred> {
        self.mailbox.as_mut()?.deferred()
    }

    fn on_deferred(&mut self, conn: &mut dyn Connection, reply: Option<String>) -> Result<()> {
        match reply {
            Some(text) => conn.send_message(text.as_bytes(), false),
            None => {
                if let Some(mailbox) = self.mailbox.as_mut() {
                    mailbox.close();
                }
                conn.send_close(Some(CloseReason::GOING_AWAY), b"");
                Ok(())
            }
        }
    }

    fn on_connection_lost(&mut self, _conn: &dyn Connection) {
        if let Some(session) = self.session.take() {
            tracing::debug!(session = %session, "WAMP session closed");
            self.broker.leave(&session);
        }
    }
}

/// Serve `broker` to every connection accepted on `listener` until `shutdown` fires
pub async fn run_wamp_testee_server(
    listener: TcpListener,
    config: SessionConfig,
    broker: Arc<Broker>,
    shutdown: broadcast::Sender<()>,
) -> Result<()> {
    let mut shutdown_rx = shutdown.subscribe();
    tracing::info!(addr = %listener.local_addr()?, agent = %config.agent, "WAMP testee listening");

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let config = config.clone();
                        let broker = broker.clone();
                        tokio::spawn(async move {
                            let mut handler = BrokerSession::new(broker);
                            if let Err(e) = session::serve(stream, config, &mut handler).await {
                                tracing::debug!(%peer, error = %e, "WAMP connection rejected");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
        }
    }
    Ok(())
}
