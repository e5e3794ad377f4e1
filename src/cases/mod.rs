//! RFC 6455 case tables
//!
//! Each submodule registers one or two case families with a
//! [`CatalogBuilder`]. Cases are plain parameter records; the behavior lives
//! in [`crate::script`].

mod close;
mod deflate;
mod fragmentation;
mod framing;
mod limits;
mod utf8;
mod wamp;

pub use utf8::{utf8_test_sequences, Utf8TestGroup};

use crate::catalog::CatalogBuilder;
use crate::error::CloseReason;
use crate::frame::RawFrame;
use crate::outcome::{Event, ExpectedClose};
use crate::script::{FrameSequence, Step};

/// Register every case family in report order
pub fn register_all(b: &mut CatalogBuilder) {
    framing::register(b);
    fragmentation::register(b);
    utf8::register(b);
    close::register(b);
    limits::register(b);
    deflate::register(b);
}

/// Register the WAMPv1 publish/subscribe and RPC cases
pub fn register_wamp(b: &mut CatalogBuilder) {
    wamp::register(b);
}

/// Seconds a sequence waits before closing or killing the connection
const SETTLE_SECS: f64 = 1.0;

fn frames(frames: impl IntoIterator<Item = RawFrame>) -> Vec<Step> {
    frames.into_iter().map(Step::Frame).collect()
}

/// Steps followed by a tester-initiated close
fn echoed(mut steps: Vec<Step>, ok: Vec<Event>) -> FrameSequence {
    steps.push(Step::CloseAfter(SETTLE_SECS));
    FrameSequence::new(steps, ok, ExpectedClose::normal())
}

/// Steps the peer must answer by failing the connection with 1002
fn violation(steps: Vec<Step>, ok: Vec<Event>) -> FrameSequence {
    failing(steps, ok, CloseReason::PROTOCOL_ERROR)
}

fn failing(mut steps: Vec<Step>, ok: Vec<Event>, code: u16) -> FrameSequence {
    steps.push(Step::KillAfter(SETTLE_SECS));
    FrameSequence::new(steps, ok, ExpectedClose::peer_fails(&[code]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CaseCatalog;
    use crate::script::Script;

    fn catalog() -> CaseCatalog {
        CaseCatalog::standard().unwrap()
    }

    fn count(catalog: &CaseCatalog, prefix: &[u32]) -> usize {
        catalog.ids().filter(|id| id.starts_with(prefix)).count()
    }

    #[test]
    fn test_family_sizes() {
        let c = catalog();
        assert_eq!(count(&c, &[1]), 16);
        assert_eq!(count(&c, &[2]), 11);
        assert_eq!(count(&c, &[3]), 7);
        assert_eq!(count(&c, &[4]), 10);
        assert_eq!(count(&c, &[5]), 20);
        assert_eq!(count(&c, &[7, 7]), 13);
        assert_eq!(count(&c, &[7, 9]), 9);
        assert_eq!(count(&c, &[9]), 54);
        assert_eq!(count(&c, &[12]), 5 * 18);
        assert_eq!(count(&c, &[13]), 7 * 18);
    }

    #[test]
    fn test_ids_are_numbered_from_one() {
        let c = catalog();
        for case in c.iter() {
            assert!(case.id.segments().iter().all(|s| *s >= 1), "{}", case.id);
        }
    }

    #[test]
    fn test_violations_expect_peer_failure() {
        let c = catalog();
        let case = c.get(&"3.1".parse().unwrap()).unwrap();
        let Script::Sequence(seq) = &case.script else {
            panic!("3.1 should be a frame sequence");
        };
        assert!(!seq.expected_close.closed_by_me);
        assert_eq!(seq.expected_close.close_codes, vec![1002]);
        assert_eq!(seq.steps.last(), Some(&Step::KillAfter(SETTLE_SECS)));
    }

    #[test]
    fn test_empty_fragments_case() {
        let c = catalog();
        let case = c.get(&"6.1.2".parse().unwrap()).unwrap();
        let Script::Sequence(seq) = &case.script else {
            panic!("6.1.2 should be a frame sequence");
        };
        assert_eq!(seq.steps.len(), 4);
        assert_eq!(
            seq.expected.get(&crate::outcome::OutcomeTag::Ok),
            Some(&vec![Event::text("")])
        );
    }
}
