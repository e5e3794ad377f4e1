//! WAMPv1 case tables: publish/subscribe routing and RPC echo

use serde_json::{json, Value};

use crate::catalog::CatalogBuilder;
use crate::wamp::{PubSubScenario, Publication, RpcEchoScenario, WampScenario, CASE_URI};

const SIMPLE: &str = "http://example.com/simple";
const FOOBAR: &str = "http://example.com/foobar";
const UNREGISTERED: &str = "http://example.com/barbaz";

const N: Option<bool> = None;
const T: Option<bool> = Some(true);
const F: Option<bool> = Some(false);

const NOBODY: &[usize] = &[];
const S0: &[usize] = &[0];
const S1: &[usize] = &[1];
const BOTH: &[usize] = &[0, 1];

/// Subscriptions per session, publication topic, expected receivers
type TopicRow = (&'static [&'static [&'static str]], &'static str, &'static [usize]);

const TOPIC_ROWS: &[TopicRow] = &[
    (&[&[SIMPLE], &[SIMPLE], &[SIMPLE, FOOBAR], &[FOOBAR], &[]], SIMPLE, &[1, 2]),
    (&[&[], &[SIMPLE], &[SIMPLE, FOOBAR], &[FOOBAR], &[]], SIMPLE, &[1, 2]),
    (&[&[SIMPLE], &[SIMPLE], &[SIMPLE, FOOBAR], &[FOOBAR], &[]], UNREGISTERED, &[]),
    (&[&[UNREGISTERED], &[UNREGISTERED], &[UNREGISTERED, FOOBAR], &[FOOBAR], &[]], UNREGISTERED, &[]),
    (
        &[&[SIMPLE], &[SIMPLE], &[SIMPLE], &[SIMPLE], &[SIMPLE], &[SIMPLE], &[SIMPLE], &[SIMPLE], &[SIMPLE], &[SIMPLE]],
        SIMPLE,
        &[1, 2, 3, 4, 5, 6, 7, 8, 9],
    ),
];

/// excludeMe, exclude, eligible, expected receivers; both sessions subscribe
type RoutingRow = (Option<bool>, Option<&'static [usize]>, Option<&'static [usize]>, &'static [usize]);

const ROUTING_ROWS: &[RoutingRow] = &[
    (N, None, None, S1),
    (T, None, None, S1),
    (F, None, None, BOTH),
    // an exclude list takes precedence over excludeMe
    (N, Some(NOBODY), None, BOTH),
    (T, Some(NOBODY), None, BOTH),
    (F, Some(NOBODY), None, BOTH),
    (N, Some(S0), None, S1),
    (T, Some(S0), None, S1),
    (F, Some(S0), None, S1),
    (N, Some(S1), None, S0),
    (T, Some(S1), None, S0),
    (F, Some(S1), None, S0),
    (N, Some(BOTH), None, NOBODY),
    (T, Some(BOTH), None, NOBODY),
    (F, Some(BOTH), None, NOBODY),
    (N, None, Some(NOBODY), NOBODY),
    (N, None, Some(S0), NOBODY),
    (N, None, Some(S1), S1),
    (N, None, Some(BOTH), S1),
    (T, None, Some(NOBODY), NOBODY),
    (T, None, Some(S0), NOBODY),
    (T, None, Some(S1), S1),
    (T, None, Some(BOTH), S1),
    (F, None, Some(NOBODY), NOBODY),
    (F, None, Some(S0), S0),
    (F, None, Some(S1), S1),
    (F, None, Some(BOTH), BOTH),
    (N, Some(NOBODY), Some(NOBODY), NOBODY),
    (N, Some(NOBODY), Some(S0), S0),
    (N, Some(NOBODY), Some(S1), S1),
    (N, Some(NOBODY), Some(BOTH), BOTH),
    (T, Some(NOBODY), Some(NOBODY), NOBODY),
    (T, Some(NOBODY), Some(S0), S0),
    (T, Some(NOBODY), Some(S1), S1),
    (T, Some(NOBODY), Some(BOTH), BOTH),
    (F, Some(NOBODY), Some(NOBODY), NOBODY),
    (F, Some(NOBODY), Some(S0), S0),
    (F, Some(NOBODY), Some(S1), S1),
    (F, Some(NOBODY), Some(BOTH), BOTH),
    (N, Some(S0), Some(NOBODY), NOBODY),
    (N, Some(S0), Some(S0), NOBODY),
    (N, Some(S0), Some(S1), S1),
    (N, Some(S0), Some(BOTH), S1),
    (T, Some(S0), Some(NOBODY), NOBODY),
    (T, Some(S0), Some(S0), NOBODY),
    (T, Some(S0), Some(S1), S1),
    (T, Some(S0), Some(BOTH), S1),
    (F, Some(S0), Some(NOBODY), NOBODY),
    (F, Some(S0), Some(S0), NOBODY),
    (F, Some(S0), Some(S1), S1),
    (F, Some(S0), Some(BOTH), S1),
    (N, Some(S1), Some(NOBODY), NOBODY),
    (N, Some(S1), Some(S0), S0),
    (N, Some(S1), Some(S1), NOBODY),
    (N, Some(S1), Some(BOTH), S0),
    (T, Some(S1), Some(NOBODY), NOBODY),
    (T, Some(S1), Some(S0), S0),
    (T, Some(S1), Some(S1), NOBODY),
    (T, Some(S1), Some(BOTH), S0),
    (F, Some(S1), Some(NOBODY), NOBODY),
    (F, Some(S1), Some(S0), S0),
    (F, Some(S1), Some(S1), NOBODY),
    (F, Some(S1), Some(BOTH), S0),
    (N, Some(BOTH), Some(NOBODY), NOBODY),
    (N, Some(BOTH), Some(S0), NOBODY),
    (N, Some(BOTH), Some(S1), NOBODY),
    (N, Some(BOTH), Some(BOTH), NOBODY),
    (T, Some(BOTH), Some(NOBODY), NOBODY),
    (T, Some(BOTH), Some(S0), NOBODY),
    (T, Some(BOTH), Some(S1), NOBODY),
    (T, Some(BOTH), Some(BOTH), NOBODY),
    (F, Some(BOTH), Some(NOBODY), NOBODY),
    (F, Some(BOTH), Some(S0), NOBODY),
    (F, Some(BOTH), Some(S1), NOBODY),
    (F, Some(BOTH), Some(BOTH), NOBODY),
];

fn topic_payloads() -> Vec<Vec<Value>> {
    vec![
        vec![Value::Null],
        vec![json!(100)],
        vec![json!(-0.248)],
        vec![json!(-1000000)],
        vec![json!("hello")],
        vec![json!(true)],
        vec![json!(false)],
        vec![json!(666), json!(23), json!(999)],
        vec![json!({}), json!([]), Value::Null],
        vec![
            json!(100),
            json!("hello"),
            json!({"foo": "bar"}),
            json!([1, 2, 3]),
            json!(["hello", 20, {"baz": "poo"}]),
        ],
    ]
}

/// Numbers the echo case sends, as floats
const ECHO_VALUES: &[f64] = &[
    0.0,
    127.0,
    255.0,
    32767.0,
    65535.0,
    16777216.0,
    -128.0,
    -32768.0,
    -16777216.0,
];

fn owned(peers: &[&[&str]]) -> Vec<Vec<String>> {
    peers
        .iter()
        .map(|topics| topics.iter().map(|t| t.to_string()).collect())
        .collect()
}

fn routing_scenario(row: &RoutingRow, publication: Publication) -> PubSubScenario {
    let (exclude_me, exclude, eligible, receivers) = *row;
    PubSubScenario {
        peers: owned(&[&[SIMPLE], &[SIMPLE]]),
        topic: SIMPLE.to_string(),
        publication,
        exclude_me,
        exclude: exclude.map(<[usize]>::to_vec),
        eligible: eligible.map(<[usize]>::to_vec),
        payloads: vec![json!("Hello, world!")],
        receivers: receivers.to_vec(),
    }
}

fn list(items: impl IntoIterator<Item = String>) -> String {
    items.into_iter().collect::<Vec<_>>().join(", ")
}

fn describe(s: &PubSubScenario) -> String {
    let subscriptions = list(s.peers.iter().enumerate().map(|(i, topics)| {
        if topics.is_empty() {
            format!("{}: -", i)
        } else {
            format!("{}: {}", i, topics.join(" & "))
        }
    }));
    let plural = if s.payloads.len() == 1 { "" } else { "s" };
    let action = match s.publication {
        Publication::Publish => "publishes",
        Publication::Dispatch => "asks the testee to dispatch",
    };

    let mut options = Vec::new();
    if let Some(v) = s.exclude_me {
        options.push(format!("excludeMe = {}", v));
    }
    if let Some(v) = &s.exclude {
        options.push(format!("exclude = {:?}", v));
    }
    if let Some(v) = &s.eligible {
        options.push(format!("eligible = {:?}", v));
    }
    let options = if options.is_empty() {
        "-".to_string()
    } else {
        options.join(", ")
    };

    format!(
        "The test connects {} WAMP clients to the testee, subscribes the sessions to topics {}, \
         waits 2.5xRTT and then {} {} event{} to the topic {} with payload{} {} from the first session. \
         The test then waits 1.5xRTT to receive events dispatched from the testee. \
         Publication options: {}. Topic URIs carry a per-case suffix such as #6011; the case log shows the URIs used.",
        s.peers.len(),
        subscriptions,
        action,
        s.payloads.len(),
        plural,
        s.topic,
        plural,
        list(s.payloads.iter().map(Value::to_string)),
        options,
    )
}

fn expectation(s: &PubSubScenario) -> String {
    if s.receivers.is_empty() {
        "We expect the testee to dispatch no events to any session.".to_string()
    } else {
        format!(
            "We expect the testee to dispatch the events to us on the sessions {}.",
            list(s.receivers.iter().map(usize::to_string))
        )
    }
}

fn add_pubsub(b: &mut CatalogBuilder, id: [usize; 4], s: PubSubScenario) {
    let id = id.map(|n| n as u32);
    b.case(&id, describe(&s), expectation(&s), WampScenario::from(s));
}

pub(super) fn register(b: &mut CatalogBuilder) {
    b.title(&[2], "Publish and Subscribe");

    b.title(&[2, 1], "Topics and payloads");
    for (j, (peers, topic, receivers)) in TOPIC_ROWS.iter().enumerate() {
        for (i, payloads) in topic_payloads().into_iter().enumerate() {
            let s = PubSubScenario {
                peers: owned(peers),
                topic: topic.to_string(),
                publication: Publication::Publish,
                exclude_me: None,
                exclude: None,
                eligible: None,
                payloads,
                receivers: receivers.to_vec(),
            };
            add_pubsub(b, [2, 1, j + 1, i + 1], s);
        }
    }

    b.title(&[2, 2], "Exclude and eligible");
    for (j, row) in ROUTING_ROWS.iter().enumerate() {
        add_pubsub(b, [2, 2, j + 1, 1], routing_scenario(row, Publication::Publish));
    }

    b.title(&[2, 4], "Server dispatched events");
    for (j, row) in ROUTING_ROWS.iter().enumerate() {
        add_pubsub(b, [2, 4, j + 1, 1], routing_scenario(row, Publication::Dispatch));
    }

    b.title(&[3], "Remote Procedure Calls");
    b.title(&[3, 1], "Argument and return types");
    let procedure = format!("{}/3.1.1#1", CASE_URI);
    b.case(
        &[3, 1, 1, 1],
        format!(
            "The test calls the echo procedure {} once for each of the numbers {} and waits up to 3xRTT for the results.",
            procedure,
            list(ECHO_VALUES.iter().map(|v| v.to_string()))
        ),
        "We expect every call to return its argument unchanged.",
        WampScenario::from(RpcEchoScenario {
            procedure,
            values: ECHO_VALUES.to_vec(),
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CaseCatalog;
    use crate::script::Script;
    use crate::wamp::PublishOptions;

    fn catalog() -> CaseCatalog {
        CaseCatalog::wamp().unwrap()
    }

    #[test]
    fn test_family_sizes() {
        let c = catalog();
        let count = |prefix: &[u32]| c.ids().filter(|id| id.starts_with(prefix)).count();
        assert_eq!(count(&[2, 1]), 50);
        assert_eq!(count(&[2, 2]), 75);
        assert_eq!(count(&[2, 4]), 75);
        assert_eq!(count(&[3]), 1);
        assert_eq!(c.title(&"2.4".parse().unwrap()), Some("Server dispatched events"));
        assert!(c.iter().all(|case| case.script.kind() == "wamp"));
    }

    #[test]
    fn test_routing_table_agrees_with_broker_rules() {
        let sessions = ["s0", "s1"];
        let ids = |list: Option<&[usize]>| list.map(|l| l.iter().map(|i| sessions[*i].to_string()).collect());
        for (n, row) in ROUTING_ROWS.iter().enumerate() {
            let (exclude_me, exclude, eligible, receivers) = *row;
            let routing = PublishOptions {
                exclude_me,
                exclude: ids(exclude),
                eligible: ids(eligible),
                me: None,
            }
            .routing("s0");
            let admitted: Vec<usize> = (0..2).filter(|i| routing.admits("s0", sessions[*i])).collect();
            assert_eq!(admitted, receivers, "row {}", n + 1);
        }
    }

    #[test]
    fn test_descriptions() {
        let c = catalog();
        let case = c.get(&"2.1.5.1".parse().unwrap()).unwrap();
        assert!(case.description.starts_with("The test connects 10 WAMP clients"));
        assert!(case.expectation.ends_with("sessions 1, 2, 3, 4, 5, 6, 7, 8, 9."));

        let case = c.get(&"2.4.16.1".parse().unwrap()).unwrap();
        assert!(case.description.contains("asks the testee to dispatch 1 event "));
        assert!(case.description.contains("eligible = []"));
        assert_eq!(case.expectation, "We expect the testee to dispatch no events to any session.");
        let Script::Wamp(WampScenario::PubSub(s)) = &case.script else {
            panic!("not a pub/sub case");
        };
        assert_eq!(s.publication, Publication::Dispatch);
        assert_eq!(s.eligible, Some(vec![]));

        let echo = c.get(&"3.1.1.1".parse().unwrap()).unwrap();
        assert!(matches!(&echo.script, Script::Wamp(WampScenario::RpcEcho(s)) if s.values.len() == 9));
    }
}
