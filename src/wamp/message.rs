//! WAMPv1 message codec
//!
//! Every message is a JSON array whose first element is the message type id.
//! Decoding is strict about element types and lenient about nothing else:
//! a message that does not fit its type's shape is an [`Error::Wamp`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};

pub const WELCOME: u64 = 0;
pub const PREFIX: u64 = 1;
pub const CALL: u64 = 2;
pub const CALLRESULT: u64 = 3;
pub const CALLERROR: u64 = 4;
pub const SUBSCRIBE: u64 = 5;
pub const UNSUBSCRIBE: u64 = 6;
pub const PUBLISH: u64 = 7;
pub const EVENT: u64 = 8;

/// Protocol version announced in WELCOME
pub const PROTOCOL_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum WampMessage {
    Welcome {
        session: String,
        version: u64,
        server: String,
    },
    Prefix {
        prefix: String,
        uri: String,
    },
    Call {
        call_id: String,
        procedure: String,
        args: Vec<Value>,
    },
    CallResult {
        call_id: String,
        result: Value,
    },
    CallError {
        call_id: String,
        error: String,
        description: String,
        details: Option<Value>,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        event: Value,
        routing: Routing,
    },
    Event {
        topic: String,
        event: Value,
    },
}

/// Receiver selection carried by PUBLISH
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Routing {
    /// Everyone but the publisher
    #[default]
    Default,
    ExcludeMe(bool),
    /// Everyone but the listed sessions
    Exclude(Vec<String>),
    /// Only the listed eligible sessions that are not excluded
    ExcludeEligible {
        exclude: Vec<String>,
        eligible: Vec<String>,
    },
}

impl Routing {
    /// Sessions to skip and, when restricted, the sessions allowed
    pub fn resolve(&self, publisher: &str) -> (Vec<String>, Option<Vec<String>>) {
        match self {
            Routing::Default | Routing::ExcludeMe(true) => (vec![publisher.to_string()], None),
            Routing::ExcludeMe(false) => (Vec::new(), None),
            Routing::Exclude(exclude) => (exclude.clone(), None),
            Routing::ExcludeEligible { exclude, eligible } => (exclude.clone(), Some(eligible.clone())),
        }
    }

    /// Whether `session` gets an event published by `publisher`
    pub fn admits(&self, publisher: &str, session: &str) -> bool {
        let (exclude, eligible) = self.resolve(publisher);
        !exclude.iter().any(|s| s == session)
            && eligible.map_or(true, |e| e.iter().any(|s| s == session))
    }
}

/// Publication options as a tester states them
///
/// Also the options object of the testee's dispatch control procedure.
/// An explicit `exclude` list takes precedence over `excludeMe`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_me: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eligible: Option<Vec<String>>,
    /// Session the dispatch is on behalf of
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<String>,
}

impl PublishOptions {
    /// The PUBLISH wire form of these options for publisher `me`
    pub fn routing(&self, me: &str) -> Routing {
        match (&self.exclude, &self.eligible) {
            (Some(exclude), Some(eligible)) => Routing::ExcludeEligible {
                exclude: exclude.clone(),
                eligible: eligible.clone(),
            },
            (Some(exclude), None) => Routing::Exclude(exclude.clone()),
            (None, Some(eligible)) => Routing::ExcludeEligible {
                exclude: match self.exclude_me {
                    Some(false) => Vec::new(),
                    _ => vec![me.to_string()],
                },
                eligible: eligible.clone(),
            },
            (None, None) => self.exclude_me.map_or(Routing::Default, Routing::ExcludeMe),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.exclude_me.is_none() && self.exclude.is_none() && self.eligible.is_none()
    }
}

impl WampMessage {
    pub fn type_id(&self) -> u64 {
        match self {
            WampMessage::Welcome { .. } => WELCOME,
            WampMessage::Prefix { .. } => PREFIX,
            WampMessage::Call { .. } => CALL,
            WampMessage::CallResult { .. } => CALLRESULT,
            WampMessage::CallError { .. } => CALLERROR,
            WampMessage::Subscribe { .. } => SUBSCRIBE,
            WampMessage::Unsubscribe { .. } => UNSUBSCRIBE,
            WampMessage::Publish { .. } => PUBLISH,
            WampMessage::Event { .. } => EVENT,
        }
    }

    pub fn to_value(&self) -> Value {
        let id = self.type_id();
        match self {
            WampMessage::Welcome {
                session,
                version,
                server,
            } => json!([id, session, version, server]),
            WampMessage::Prefix { prefix, uri } => json!([id, prefix, uri]),
            WampMessage::Call {
                call_id,
                procedure,
                args,
            } => {
                let mut items = vec![json!(id), json!(call_id), json!(procedure)];
                items.extend(args.iter().cloned());
                Value::Array(items)
            }
            WampMessage::CallResult { call_id, result } => json!([id, call_id, result]),
            WampMessage::CallError {
                call_id,
                error,
                description,
                details,
            } => match details {
                Some(details) => json!([id, call_id, error, description, details]),
                None => json!([id, call_id, error, description]),
            },
            WampMessage::Subscribe { topic } | WampMessage::Unsubscribe { topic } => json!([id, topic]),
            WampMessage::Publish { topic, event, routing } => match routing {
                Routing::Default => json!([id, topic, event]),
                Routing::ExcludeMe(flag) => json!([id, topic, event, flag]),
                Routing::Exclude(exclude) => json!([id, topic, event, exclude]),
                Routing::ExcludeEligible { exclude, eligible } => {
                    json!([id, topic, event, exclude, eligible])
                }
            },
            WampMessage::Event { topic, event } => json!([id, topic, event]),
        }
    }

    /// Compact JSON text for a text frame
    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }

    pub fn parse(text: &str) -> Result<WampMessage> {
        let items: Vec<Value> = serde_json::from_str(text)
            .map_err(|e| Error::Wamp(format!("message is not a JSON array: {}", e)))?;
        let id = items
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Wamp("message type id missing".into()))?;
        let m = Fields { id, items: &items };

        Ok(match id {
            WELCOME => {
                m.arity(4, 4)?;
                WampMessage::Welcome {
                    session: m.string(1)?,
                    version: m.items[2]
                        .as_u64()
                        .ok_or_else(|| m.bad(2, "an integer"))?,
                    server: m.string(3)?,
                }
            }
            PREFIX => {
                m.arity(3, 3)?;
                WampMessage::Prefix {
                    prefix: m.string(1)?,
                    uri: m.string(2)?,
                }
            }
            CALL => {
                m.arity(3, usize::MAX)?;
                WampMessage::Call {
                    call_id: m.string(1)?,
                    procedure: m.string(2)?,
                    args: items[3..].to_vec(),
                }
            }
            CALLRESULT => {
                m.arity(3, 3)?;
                WampMessage::CallResult {
                    call_id: m.string(1)?,
                    result: items[2].clone(),
                }
            }
            CALLERROR => {
                m.arity(4, 5)?;
                WampMessage::CallError {
                    call_id: m.string(1)?,
                    error: m.string(2)?,
                    description: m.string(3)?,
                    details: items.get(4).cloned(),
                }
            }
            SUBSCRIBE => {
                m.arity(2, 2)?;
                WampMessage::Subscribe { topic: m.string(1)? }
            }
            UNSUBSCRIBE => {
                m.arity(2, 2)?;
                WampMessage::Unsubscribe { topic: m.string(1)? }
            }
            PUBLISH => {
                m.arity(3, 5)?;
                let routing = match (items.get(3), items.get(4)) {
                    (None, _) => Routing::Default,
                    (Some(Value::Bool(flag)), None) => Routing::ExcludeMe(*flag),
                    (Some(_), None) => Routing::Exclude(m.strings(3)?),
                    (Some(_), Some(_)) => Routing::ExcludeEligible {
                        exclude: m.strings(3)?,
                        eligible: m.strings(4)?,
                    },
                };
                WampMessage::Publish {
                    topic: m.string(1)?,
                    event: items[2].clone(),
                    routing,
                }
            }
            EVENT => {
                m.arity(3, 3)?;
                WampMessage::Event {
                    topic: m.string(1)?,
                    event: items[2].clone(),
                }
            }
            other => return Err(Error::Wamp(format!("unknown message type {}", other))),
        })
    }
}

struct Fields<'a> {
    id: u64,
    items: &'a [Value],
}

impl Fields<'_> {
    fn arity(&self, min: usize, max: usize) -> Result<()> {
        let n = self.items.len();
        if n < min || n > max {
            return Err(Error::Wamp(format!(
                "message type {} with {} elements",
                self.id, n
            )));
        }
        Ok(())
    }

    fn bad(&self, at: usize, what: &str) -> Error {
        Error::Wamp(format!("message type {}: element {} is not {}", self.id, at, what))
    }

    fn string(&self, at: usize) -> Result<String> {
        self.items[at]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| self.bad(at, "a string"))
    }

    fn strings(&self, at: usize) -> Result<Vec<String>> {
        self.items[at]
            .as_array()
            .and_then(|a| a.iter().map(|v| v.as_str().map(str::to_string)).collect())
            .ok_or_else(|| self.bad(at, "a list of session ids"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wire_forms() {
        let m = WampMessage::parse(r#"[0, "v59mbCGDXZ7WTyxB", 1, "Autobahn/0.5.1"]"#).unwrap();
        assert_eq!(
            m,
            WampMessage::Welcome {
                session: "v59mbCGDXZ7WTyxB".into(),
                version: 1,
                server: "Autobahn/0.5.1".into(),
            }
        );

        let m = WampMessage::parse(r#"[2, "7DK6TdN4wLiUJgNM", "http://example.com/api#add", 23, 99]"#).unwrap();
        assert!(matches!(&m, WampMessage::Call { args, .. } if args == &[json!(23), json!(99)]));

        let m = WampMessage::parse(r#"[7, "http://example.com/simple", null, true]"#).unwrap();
        assert!(matches!(m, WampMessage::Publish { routing: Routing::ExcludeMe(true), .. }));

        let m = WampMessage::parse(r#"[7, "t", {"a": 1}, [], ["s1"]]"#).unwrap();
        assert_eq!(
            m,
            WampMessage::Publish {
                topic: "t".into(),
                event: json!({"a": 1}),
                routing: Routing::ExcludeEligible {
                    exclude: vec![],
                    eligible: vec!["s1".into()],
                },
            }
        );
    }

    #[test]
    fn test_encode_publish_options() {
        let m = WampMessage::Publish {
            topic: "t".into(),
            event: json!("Hello, world!"),
            routing: Routing::Exclude(vec!["a".into()]),
        };
        assert_eq!(m.to_text(), r#"[7,"t","Hello, world!",["a"]]"#);
        assert_eq!(WampMessage::parse(&m.to_text()).unwrap(), m);

        let m = WampMessage::CallError {
            call_id: "c".into(),
            error: "http://example.com/error#generic".into(),
            description: "boom".into(),
            details: None,
        };
        assert_eq!(m.to_value().as_array().map(Vec::len), Some(4));
    }

    #[test]
    fn test_malformed_messages() {
        for text in [
            "{}",
            "[]",
            r#"["0"]"#,
            r#"[0, "s", 1]"#,
            r#"[5, 17]"#,
            r#"[7, "t", 1, [2]]"#,
            r#"[9, "t"]"#,
        ] {
            assert!(matches!(WampMessage::parse(text), Err(Error::Wamp(_))), "{}", text);
        }
    }

    #[test]
    fn test_exclude_wins_over_exclude_me() {
        let options = PublishOptions {
            exclude_me: Some(true),
            exclude: Some(vec![]),
            ..Default::default()
        };
        assert_eq!(options.routing("me"), Routing::Exclude(vec![]));
        assert!(options.routing("me").admits("me", "me"));

        let options = PublishOptions {
            exclude_me: Some(false),
            eligible: Some(vec!["me".into()]),
            ..Default::default()
        };
        assert!(options.routing("me").admits("me", "me"));
        assert!(!options.routing("me").admits("me", "other"));

        assert!(!Routing::Default.admits("me", "me"));
        assert!(Routing::Default.admits("me", "other"));
    }

    #[test]
    fn test_options_object_round_trip() {
        let options = PublishOptions {
            exclude: Some(vec!["a".into()]),
            me: Some("b".into()),
            ..Default::default()
        };
        let value = serde_json::to_value(&options).unwrap();
        assert_eq!(value, json!({"exclude": ["a"], "me": "b"}));
        assert_eq!(serde_json::from_value::<PublishOptions>(value).unwrap(), options);
        assert!(PublishOptions::default().is_empty());
    }
}
