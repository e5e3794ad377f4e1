//! Outcome classification
//!
//! After a connection is gone, the observed application events and the
//! closing facts are compared against the case's expectations to produce
//! two verdicts: one for protocol behavior, one for the closing handshake.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};

use bytes::Bytes;
use serde::{Deserialize, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::trace::{ascii_log_data, MAX_WIRE_LOG_DATA};

/// Behavior verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeTag {
    Ok,
    NonStrict,
    Failed,
    NoClose,
    Informational,
    Unimplemented,
}

impl OutcomeTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeTag::Ok => "OK",
            OutcomeTag::NonStrict => "NON_STRICT",
            OutcomeTag::Failed => "FAILED",
            OutcomeTag::NoClose => "NO_CLOSE",
            OutcomeTag::Informational => "INFORMATIONAL",
            OutcomeTag::Unimplemented => "UNIMPLEMENTED",
        }
    }
}

impl fmt::Display for OutcomeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closing handshake verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseOutcomeTag {
    Ok,
    NonStrict,
    FailedByClient,
    WrongCode,
    Unclean,
    Informational,
    Failed,
}

impl CloseOutcomeTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseOutcomeTag::Ok => "OK",
            CloseOutcomeTag::NonStrict => "NON_STRICT",
            CloseOutcomeTag::FailedByClient => "FAILED_BY_CLIENT",
            CloseOutcomeTag::WrongCode => "WRONG_CODE",
            CloseOutcomeTag::Unclean => "UNCLEAN",
            CloseOutcomeTag::Informational => "INFORMATIONAL",
            CloseOutcomeTag::Failed => "FAILED",
        }
    }
}

impl fmt::Display for CloseOutcomeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn preview<S: Serializer>(payload: &Bytes, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&ascii_log_data(payload, MAX_WIRE_LOG_DATA))
}

/// Application-level event observed on a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Event {
    Message {
        #[serde(serialize_with = "preview")]
        payload: Bytes,
        binary: bool,
    },
    Pong {
        #[serde(serialize_with = "preview")]
        payload: Bytes,
    },
}

impl Event {
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Event::Message {
            payload: payload.into(),
            binary: false,
        }
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Event::Message {
            payload: payload.into(),
            binary: true,
        }
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Event::Pong {
            payload: payload.into(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Event::Message { .. } => "message",
            Event::Pong { .. } => "pong",
        }
    }

    fn payload(&self) -> &Bytes {
        match self {
            Event::Message { payload, .. } | Event::Pong { payload } => payload,
        }
    }
}

/// Expected event sequences keyed by the verdict they earn
pub type ExpectedEvents = BTreeMap<OutcomeTag, Vec<Event>>;

/// What a correct peer does when the case ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedClose {
    /// True when the harness is expected to start the closing handshake
    pub closed_by_me: bool,
    /// Acceptable remote close codes
    pub close_codes: Vec<u16>,
    pub require_clean: bool,
    /// Closing by the wrong endpoint also fails the behavior verdict
    pub closed_by_wrong_endpoint_is_fatal: bool,
}

impl ExpectedClose {
    /// Harness closes normally and the peer answers 1000
    pub fn normal() -> Self {
        Self {
            closed_by_me: true,
            close_codes: vec![1000],
            require_clean: true,
            closed_by_wrong_endpoint_is_fatal: false,
        }
    }

    /// Peer is expected to fail the connection with one of `codes`
    pub fn peer_fails(codes: &[u16]) -> Self {
        Self {
            closed_by_me: false,
            close_codes: codes.to_vec(),
            require_clean: false,
            closed_by_wrong_endpoint_is_fatal: false,
        }
    }

    pub fn fatal_if_wrong_endpoint(mut self) -> Self {
        self.closed_by_wrong_endpoint_is_fatal = true;
        self
    }

    pub fn require_clean(mut self, clean: bool) -> Self {
        self.require_clean = clean;
        self
    }
}

/// Facts the connection recorded about how it ended
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosingFacts {
    pub closed_by_me: bool,
    pub failed_by_me: bool,
    pub dropped_by_me: bool,
    pub was_clean: bool,
    pub was_not_clean_reason: Option<String>,
    pub was_open_handshake_timeout: bool,
    pub was_close_handshake_timeout: bool,
    pub was_server_connection_drop_timeout: bool,
    pub local_close_code: Option<u16>,
    pub local_close_reason: Option<String>,
    pub remote_close_code: Option<u16>,
    pub remote_close_reason: Option<String>,
}

/// Everything the classifier looks at
#[derive(Debug, Clone, Copy)]
pub struct ClassifierInput<'a> {
    pub expected: &'a ExpectedEvents,
    pub observed: &'a [Event],
    pub expected_close: &'a ExpectedClose,
    pub facts: &'a ClosingFacts,
    /// Verdict a case settled on itself while running
    pub preset: Option<(OutcomeTag, &'a str)>,
    /// Reason the feature under test is not supported by the peer
    pub unimplemented: Option<&'a str>,
    pub informational: bool,
    /// Deadline in seconds if the case watchdog fired
    pub timed_out: Option<f64>,
    pub is_server: bool,
}

/// Pair of verdicts with explanations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub behavior: OutcomeTag,
    pub result: String,
    pub behavior_close: CloseOutcomeTag,
    pub result_close: String,
}

/// Hex SHA1 of a payload, used in mismatch reports
pub fn sha1_hex(data: &[u8]) -> String {
    let digest = Sha1::digest(data);
    let mut out = String::with_capacity(40);
    for b in digest {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Describe how an echoed message differs from the one sent
pub fn describe_echo_mismatch(
    sent: &[u8],
    sent_binary: bool,
    got: &[u8],
    got_binary: bool,
) -> Option<String> {
    if got_binary != sent_binary {
        Some(format!(
            "Echo'ed message type differs from what I sent (got binary {}, expected binary {}).",
            got_binary, sent_binary
        ))
    } else if got.len() != sent.len() {
        Some(format!(
            "Echo'ed message length differs from what I sent (got length {}, expected length {}).",
            got.len(),
            sent.len()
        ))
    } else if got != sent {
        Some(format!(
            "Echo'ed message contents differs from what I sent (got SHA1 {}, expected SHA1 {}).",
            sha1_hex(got),
            sha1_hex(sent)
        ))
    } else {
        None
    }
}

/// First difference between the expected and observed event lists
pub fn describe_mismatch(expected: &[Event], observed: &[Event]) -> String {
    for (i, (want, got)) in expected.iter().zip(observed).enumerate() {
        if want == got {
            continue;
        }
        return match (want, got) {
            (
                Event::Message {
                    payload: sent,
                    binary: sent_binary,
                },
                Event::Message {
                    payload: echoed,
                    binary: echoed_binary,
                },
            ) => describe_echo_mismatch(sent, *sent_binary, echoed, *echoed_binary)
                .unwrap_or_else(|| format!("Event {} differs from what was expected.", i + 1)),
            (Event::Pong { payload: want }, Event::Pong { payload: got }) => format!(
                "Pong payload differs from ping payload (got length {}, expected length {}).",
                got.len(),
                want.len()
            ),
            _ => format!(
                "Event {} is a {} with {} octets, expected a {} with {} octets.",
                i + 1,
                got.kind(),
                got.payload().len(),
                want.kind(),
                want.payload().len()
            ),
        };
    }
    if expected.len() != observed.len() {
        format!(
            "Actual events differ from any expected (expected {} events, received {}).",
            expected.len(),
            observed.len()
        )
    } else {
        "Actual events differ from any expected.".to_string()
    }
}

fn classify_behavior(input: &ClassifierInput<'_>) -> (OutcomeTag, String) {
    if let Some(reason) = input.unimplemented {
        return (OutcomeTag::Unimplemented, reason.to_string());
    }
    if let Some((tag, text)) = input.preset {
        return (tag, text.to_string());
    }

    let matches = |tag: OutcomeTag| {
        input
            .expected
            .get(&tag)
            .is_some_and(|events| events.as_slice() == input.observed)
    };
    if matches(OutcomeTag::Ok) {
        return (
            OutcomeTag::Ok,
            "Actual events match at least one expected.".to_string(),
        );
    }
    if matches(OutcomeTag::NonStrict) {
        return (
            OutcomeTag::NonStrict,
            "Actual events match a non-strict expectation.".to_string(),
        );
    }
    let wanted = input
        .expected
        .get(&OutcomeTag::Ok)
        .map(Vec::as_slice)
        .unwrap_or_default();
    (OutcomeTag::Failed, describe_mismatch(wanted, input.observed))
}

fn classify_close(input: &ClassifierInput<'_>) -> (CloseOutcomeTag, String) {
    let expected = input.expected_close;
    let facts = input.facts;

    if let Some(secs) = input.timed_out {
        return (
            CloseOutcomeTag::Failed,
            format!("Case did not finish within {} seconds.", secs),
        );
    }
    if input.informational {
        return (
            CloseOutcomeTag::Informational,
            "Connection was closed; any outcome is acceptable.".to_string(),
        );
    }
    if expected.closed_by_me != facts.closed_by_me {
        return (
            CloseOutcomeTag::FailedByClient,
            "The connection was failed by the wrong endpoint".to_string(),
        );
    }
    if expected.require_clean && !facts.was_clean {
        return (
            CloseOutcomeTag::Unclean,
            format!(
                "The spec requires the connection to be failed cleanly here ({})",
                facts
                    .was_not_clean_reason
                    .as_deref()
                    .unwrap_or("no reason recorded")
            ),
        );
    }
    if let Some(code) = facts.remote_close_code {
        if !expected.close_codes.contains(&code) {
            let allowed: Vec<String> = expected.close_codes.iter().map(u16::to_string).collect();
            return (
                CloseOutcomeTag::WrongCode,
                format!(
                    "The close code should have been {} or empty (got {})",
                    allowed.join(","),
                    code
                ),
            );
        }
    }
    if !input.is_server && facts.dropped_by_me {
        return (
            CloseOutcomeTag::NonStrict,
            "It is preferred that the server close the TCP connection".to_string(),
        );
    }
    (
        CloseOutcomeTag::Ok,
        "Connection was properly closed".to_string(),
    )
}

/// Produce both verdicts for a finished case
pub fn classify(input: ClassifierInput<'_>) -> Verdict {
    let (mut behavior, mut result) = classify_behavior(&input);
    let (behavior_close, result_close) = classify_close(&input);

    if behavior != OutcomeTag::Unimplemented {
        if input.informational {
            behavior = OutcomeTag::Informational;
        } else if let Some(secs) = input.timed_out {
            if behavior == OutcomeTag::Ok {
                behavior = OutcomeTag::NoClose;
                result = format!(
                    "Events matched but the connection was not closed within {} seconds.",
                    secs
                );
            } else if behavior != OutcomeTag::NoClose {
                behavior = OutcomeTag::Failed;
                result = format!("Case did not finish within {} seconds.", secs);
            }
        } else if input.expected_close.closed_by_wrong_endpoint_is_fatal
            && input.expected_close.closed_by_me != input.facts.closed_by_me
        {
            behavior = OutcomeTag::Failed;
            result = "The connection was closed by the wrong endpoint".to_string();
        }
    }

    Verdict {
        behavior,
        result,
        behavior_close,
        result_close,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected_ok(events: Vec<Event>) -> ExpectedEvents {
        let mut map = ExpectedEvents::new();
        map.insert(OutcomeTag::Ok, events);
        map
    }

    fn clean_close() -> ClosingFacts {
        ClosingFacts {
            closed_by_me: true,
            was_clean: true,
            remote_close_code: Some(1000),
            ..Default::default()
        }
    }

    fn input<'a>(
        expected: &'a ExpectedEvents,
        observed: &'a [Event],
        expected_close: &'a ExpectedClose,
        facts: &'a ClosingFacts,
    ) -> ClassifierInput<'a> {
        ClassifierInput {
            expected,
            observed,
            expected_close,
            facts,
            preset: None,
            unimplemented: None,
            informational: false,
            timed_out: None,
            is_server: true,
        }
    }

    #[test]
    fn test_matching_echo_is_ok() {
        let expected = expected_ok(vec![Event::text("Hello, world!")]);
        let observed = vec![Event::text("Hello, world!")];
        let close = ExpectedClose::normal();
        let facts = clean_close();
        let v = classify(input(&expected, &observed, &close, &facts));
        assert_eq!(v.behavior, OutcomeTag::Ok);
        assert_eq!(v.behavior_close, CloseOutcomeTag::Ok);
    }

    #[test]
    fn test_type_mismatch_reported() {
        let payload = vec![0xfeu8; 125];
        let expected = expected_ok(vec![Event::binary(payload.clone())]);
        let observed = vec![Event::text(payload)];
        let close = ExpectedClose::normal();
        let facts = clean_close();
        let v = classify(input(&expected, &observed, &close, &facts));
        assert_eq!(v.behavior, OutcomeTag::Failed);
        assert!(v.result.contains("type differs"), "{}", v.result);
    }

    #[test]
    fn test_length_and_content_mismatch() {
        let text = describe_echo_mismatch(b"abc", false, b"ab", false).unwrap();
        assert!(text.contains("got length 2, expected length 3"));
        let text = describe_echo_mismatch(b"abc", false, b"abd", false).unwrap();
        assert!(text.contains(&format!("expected SHA1 {}", sha1_hex(b"abc"))));
        assert!(describe_echo_mismatch(b"abc", true, b"abc", true).is_none());
    }

    #[test]
    fn test_sha1_hex() {
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_non_strict_alternative() {
        let mut expected = expected_ok(vec![Event::pong("a"), Event::pong("b")]);
        expected.insert(OutcomeTag::NonStrict, vec![Event::pong("b")]);
        let observed = vec![Event::pong("b")];
        let close = ExpectedClose::normal();
        let facts = clean_close();
        let v = classify(input(&expected, &observed, &close, &facts));
        assert_eq!(v.behavior, OutcomeTag::NonStrict);
    }

    #[test]
    fn test_wrong_endpoint_is_fatal() {
        let expected = expected_ok(vec![]);
        let close = ExpectedClose::peer_fails(&[1007]).fatal_if_wrong_endpoint();
        let facts = ClosingFacts {
            closed_by_me: true,
            failed_by_me: true,
            was_clean: true,
            remote_close_code: Some(1000),
            ..Default::default()
        };
        let v = classify(input(&expected, &[], &close, &facts));
        assert_eq!(v.behavior, OutcomeTag::Failed);
        assert_eq!(v.behavior_close, CloseOutcomeTag::FailedByClient);
    }

    #[test]
    fn test_peer_fails_with_expected_code() {
        let expected = expected_ok(vec![]);
        let close = ExpectedClose::peer_fails(&[1007]).fatal_if_wrong_endpoint();
        let facts = ClosingFacts {
            remote_close_code: Some(1007),
            was_clean: true,
            ..Default::default()
        };
        let v = classify(input(&expected, &[], &close, &facts));
        assert_eq!(v.behavior, OutcomeTag::Ok);
        assert_eq!(v.behavior_close, CloseOutcomeTag::Ok);
    }

    #[test]
    fn test_wrong_code_and_unclean() {
        let expected = expected_ok(vec![]);
        let close = ExpectedClose::normal();
        let facts = ClosingFacts {
            remote_close_code: Some(1001),
            ..clean_close()
        };
        let v = classify(input(&expected, &[], &close, &facts));
        assert_eq!(v.behavior_close, CloseOutcomeTag::WrongCode);

        let facts = ClosingFacts {
            was_clean: false,
            was_not_clean_reason: Some("peer dropped TCP".into()),
            ..clean_close()
        };
        let v = classify(input(&expected, &[], &close, &facts));
        assert_eq!(v.behavior_close, CloseOutcomeTag::Unclean);
        assert!(v.result_close.contains("peer dropped TCP"));
    }

    #[test]
    fn test_client_drop_is_non_strict() {
        let expected = expected_ok(vec![]);
        let close = ExpectedClose::normal();
        let facts = ClosingFacts {
            dropped_by_me: true,
            ..clean_close()
        };
        let mut inp = input(&expected, &[], &close, &facts);
        inp.is_server = false;
        assert_eq!(classify(inp).behavior_close, CloseOutcomeTag::NonStrict);
        inp.is_server = true;
        assert_eq!(classify(inp).behavior_close, CloseOutcomeTag::Ok);
    }

    #[test]
    fn test_timeout_verdicts() {
        let expected = expected_ok(vec![Event::text("x")]);
        let close = ExpectedClose::normal();
        let facts = clean_close();
        let observed = vec![Event::text("x")];
        let mut inp = input(&expected, &observed, &close, &facts);
        inp.timed_out = Some(10.0);
        let v = classify(inp);
        assert_eq!(v.behavior, OutcomeTag::NoClose);
        assert_eq!(v.behavior_close, CloseOutcomeTag::Failed);
        assert_eq!(v.result_close, "Case did not finish within 10 seconds.");

        let mut inp = input(&expected, &[], &close, &facts);
        inp.timed_out = Some(10.0);
        let v = classify(inp);
        assert_eq!(v.behavior, OutcomeTag::Failed);
        assert_eq!(v.result, "Case did not finish within 10 seconds.");
    }

    #[test]
    fn test_unimplemented_and_informational() {
        let expected = expected_ok(vec![]);
        let close = ExpectedClose::normal();
        let facts = clean_close();
        let mut inp = input(&expected, &[], &close, &facts);
        inp.unimplemented = Some("permessage-deflate not accepted");
        assert_eq!(classify(inp).behavior, OutcomeTag::Unimplemented);

        let observed = [Event::text("z")];
        let mut inp = input(&expected, &observed, &close, &facts);
        inp.informational = true;
        let v = classify(inp);
        assert_eq!(v.behavior, OutcomeTag::Informational);
        assert_eq!(v.behavior_close, CloseOutcomeTag::Informational);
    }

    #[test]
    fn test_preset_verdict_wins() {
        let expected = expected_ok(vec![Event::text("never")]);
        let close = ExpectedClose::normal();
        let facts = clean_close();
        let mut inp = input(&expected, &[], &close, &facts);
        inp.preset = Some((OutcomeTag::Ok, "Received all echos"));
        let v = classify(inp);
        assert_eq!(v.behavior, OutcomeTag::Ok);
        assert_eq!(v.result, "Received all echos");
    }

    #[test]
    fn test_tags_serialize_as_names() {
        assert_eq!(serde_json::to_string(&OutcomeTag::NonStrict).unwrap(), "\"NON_STRICT\"");
        assert_eq!(
            serde_json::to_string(&CloseOutcomeTag::FailedByClient).unwrap(),
            "\"FAILED_BY_CLIENT\""
        );
        let json = serde_json::to_value(Event::binary(vec![0xff])).unwrap();
        assert_eq!(json["kind"], "message");
        assert_eq!(json["payload"], "0xff");
    }
}
