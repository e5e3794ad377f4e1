//! Cross-module properties of case selection, classification and timers.

use std::time::Duration;

use proptest::prelude::*;
use tokio::time::Instant;

use sockudo_wstest::connection::ConnState;
use sockudo_wstest::outcome::{classify, ClassifierInput, ClosingFacts, Event, ExpectedClose, ExpectedEvents};
use sockudo_wstest::timer::ScheduledActionQueue;
use sockudo_wstest::trace::{WireEvent, WireTrace};
use sockudo_wstest::{CaseCatalog, CaseId, CloseOutcomeTag, OutcomeTag, Spec};

fn spec(json: &str) -> Spec {
    Spec::from_json(json).unwrap()
}

#[test]
fn test_exclude_agent_rule_is_per_agent() {
    let catalog = CaseCatalog::standard().unwrap();
    let spec = spec(r#"{"cases": ["5.*"], "exclude-agent-cases": {"Browser*": ["5.1"]}}"#);
    let excluded: CaseId = "5.1".parse().unwrap();

    let browser = spec.cases_for(&catalog, "BrowserX").unwrap();
    let other = spec.cases_for(&catalog, "Server").unwrap();
    assert!(!browser.contains(&excluded));
    assert!(other.contains(&excluded));
    assert_eq!(other.len(), browser.len() + 1);
}

#[test]
fn test_sub_family_exclusion() {
    let catalog = CaseCatalog::standard().unwrap();
    let spec = spec(r#"{"cases": ["9.*"], "exclude-cases": ["9.1.*"]}"#);
    let cases = spec.server_cases(&catalog).unwrap();
    assert!(!cases.is_empty());
    assert!(cases.iter().all(|id| !id.starts_with(&[9, 1])));
}

#[test]
fn test_empty_fragments_echoed_is_ok() {
    let mut expected = ExpectedEvents::new();
    expected.insert(OutcomeTag::Ok, vec![Event::text("")]);
    let observed = vec![Event::text("")];
    let close = ExpectedClose::normal();
    let facts = ClosingFacts {
        closed_by_me: true,
        was_clean: true,
        remote_close_code: Some(1000),
        ..Default::default()
    };
    let verdict = classify(ClassifierInput {
        expected: &expected,
        observed: &observed,
        expected_close: &close,
        facts: &facts,
        preset: None,
        unimplemented: None,
        informational: false,
        timed_out: None,
        is_server: true,
    });
    assert_eq!(verdict.behavior, OutcomeTag::Ok);
    assert_eq!(verdict.behavior_close, CloseOutcomeTag::Ok);
}

#[test]
fn test_timer_after_close_never_fires() {
    let start = Instant::now();
    let mut trace = WireTrace::new();
    let mut queue = ScheduledActionQueue::new();
    queue.close_after(start, 5.0, &mut trace);

    // closed at t=1s by the peer
    let at_one = start + Duration::from_secs(1);
    assert!(queue.pop_due(at_one, ConnState::Open, &mut trace).is_none());

    let at_five = start + Duration::from_secs(5);
    assert!(queue.pop_due(at_five, ConnState::Closed, &mut trace).is_none());
    assert!(!trace.events().iter().any(|e| matches!(e, WireEvent::CloseFired)));
}

proptest! {
    #[test]
    fn prop_spec_resolution_is_stable(category in prop::sample::select(vec![1u32, 2, 3, 4, 5, 6, 7, 9, 10, 12, 13])) {
        let catalog = CaseCatalog::standard().unwrap();
        let spec = spec(&format!(r#"{{"cases": ["{}.*"]}}"#, category));
        let first = spec.server_cases(&catalog).unwrap();
        let second = spec.server_cases(&catalog).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert!(first.iter().all(|id| id.category() == category));
    }
}
