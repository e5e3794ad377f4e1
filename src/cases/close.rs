//! Family 7: close handling

use bytes::Bytes;

use super::SETTLE_SECS;
use crate::catalog::CatalogBuilder;
use crate::error::CloseReason;
use crate::frame::RawFrame;
use crate::outcome::{Event, ExpectedClose};
use crate::script::{FrameSequence, Step};

/// Close codes a peer must accept and echo
const VALID_CODES: [u16; 13] = [
    1000, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011, 3000, 3999, 4000, 4999,
];

/// Close codes a peer must reject with a protocol error
const INVALID_CODES: [u16; 9] = [0, 999, 1004, 1005, 1006, 1016, 1100, 2000, 2999];

/// Codes outside the registered ranges whose handling is left to the peer
const UNREGISTERED_CODES: [u16; 2] = [5000, 65535];

fn close(code: Option<u16>, reason: impl Into<Bytes>) -> Step {
    Step::Close {
        code,
        reason: reason.into(),
    }
}

/// Tester closes first and the peer must answer with one of `codes`
fn closed_by_me(codes: &[u16], require_clean: bool) -> ExpectedClose {
    ExpectedClose {
        closed_by_me: true,
        close_codes: codes.to_vec(),
        require_clean,
        closed_by_wrong_endpoint_is_fatal: false,
    }
}

fn sequence(mut steps: Vec<Step>, ok: Vec<Event>, expected_close: ExpectedClose) -> FrameSequence {
    steps.push(Step::KillAfter(SETTLE_SECS));
    FrameSequence::new(steps, ok, expected_close)
}

pub(super) fn register(b: &mut CatalogBuilder) {
    b.title(&[7], "Close Handling");
    register_basic(b);
    register_payloads(b);
    register_codes(b);
}

fn register_basic(b: &mut CatalogBuilder) {
    b.title(&[7, 1], "Basic close behavior (fuzzer initiated)");
    let normal = Some(CloseReason::NORMAL);

    b.case(
        &[7, 1, 1],
        "Send a message followed by a close frame",
        "Echoed message followed by clean close with normal code.",
        sequence(
            vec![
                Step::Message {
                    payload: Bytes::from_static(b"Hello World!"),
                    binary: false,
                },
                close(normal, Bytes::new()),
            ],
            vec![Event::text(&b"Hello World!"[..])],
            ExpectedClose::normal(),
        ),
    );
    b.case(
        &[7, 1, 2],
        "Send two close frames",
        "Clean close with normal code. Second close frame ignored.",
        sequence(
            vec![
                close(normal, Bytes::new()),
                Step::Frame(RawFrame::close(normal, b"")),
            ],
            vec![],
            ExpectedClose::normal(),
        ),
    );
    b.case(
        &[7, 1, 3],
        "Send a ping after close message",
        "Clean close with normal code, no pong.",
        sequence(
            vec![
                close(normal, Bytes::new()),
                Step::Frame(RawFrame::ping(&b"ping payload"[..])),
            ],
            vec![],
            ExpectedClose::normal(),
        ),
    );
    b.case(
        &[7, 1, 4],
        "Send text message after sending a close frame",
        "Clean close with normal code. Text message ignored.",
        sequence(
            vec![
                close(normal, Bytes::new()),
                Step::Frame(RawFrame::text(&b"Hello World!"[..])),
            ],
            vec![],
            ExpectedClose::normal(),
        ),
    );
    b.case(
        &[7, 1, 5],
        "Send message fragment1 followed by close then fragment",
        "Clean close with normal code.",
        sequence(
            vec![
                Step::Frame(RawFrame::text(&b"fragment1"[..]).fin(false)),
                close(normal, Bytes::new()),
                Step::Frame(RawFrame::continuation(&b"fragment2"[..])),
            ],
            vec![],
            ExpectedClose::normal(),
        ),
    );
    b.case(
        &[7, 1, 6],
        "Send 256K message followed by close then a ping",
        "Case outcome depends on implementation defined close behavior. Message and close frame are sent back to back. If the close frame is processed before the text message write is complete (as can happen in asynchronous processing models) the close frame is processed first and the text message may not be received or may only be partially recieved.",
        sequence(
            vec![
                Step::Frame(RawFrame::text(&b"BAsd7&jh23"[..]).repeat(256 * 1024)),
                close(normal, Bytes::new()),
                Step::Frame(RawFrame::ping(&b"ping payload"[..])),
            ],
            vec![],
            ExpectedClose::normal(),
        )
        .informational(),
    );
}

fn register_payloads(b: &mut CatalogBuilder) {
    b.title(&[7, 3], "Close frame structure: payload length (fuzzer initiated)");
    let normal = Some(CloseReason::NORMAL);
    let protocol_error = closed_by_me(&[CloseReason::PROTOCOL_ERROR], false);

    b.case(
        &[7, 3, 1],
        "Send a close frame with payload length 0 (no close code, no close reason)",
        "Clean close with normal code.",
        sequence(vec![close(None, Bytes::new())], vec![], ExpectedClose::normal()),
    );
    b.case(
        &[7, 3, 2],
        "Send a close frame with payload length 1",
        "Clean close with protocol error or drop TCP.",
        sequence(
            vec![close(None, Bytes::from_static(b"a"))],
            vec![],
            protocol_error.clone(),
        ),
    );
    b.case(
        &[7, 3, 3],
        "Send a close frame with payload length 2 (regular close with a code)",
        "Clean close with normal code.",
        sequence(vec![close(normal, Bytes::new())], vec![], ExpectedClose::normal()),
    );
    b.case(
        &[7, 3, 4],
        "Send a close frame with close code and close reason",
        "Clean close with normal code.",
        sequence(
            vec![close(normal, Bytes::from_static(b"Hello World!"))],
            vec![],
            ExpectedClose::normal(),
        ),
    );
    b.case(
        &[7, 3, 5],
        "Send a close frame with close code and close reason of maximum length (123)",
        "Clean close with normal code.",
        sequence(
            vec![close(normal, Bytes::from(vec![b'*'; 123]))],
            vec![],
            ExpectedClose::normal(),
        ),
    );
    b.case(
        &[7, 3, 6],
        "Send a close frame with close code and close reason which is too long (124) - total frame payload 126 octets",
        "Clean close with protocol error code or dropped TCP connection.",
        sequence(
            vec![close(normal, Bytes::from(vec![b'*'; 124]))],
            vec![],
            protocol_error,
        ),
    );

    b.title(&[7, 5], "Close frame structure: payload value (fuzzer initiated)");
    b.case(
        &[7, 5, 1],
        "Send a close frame with invalid UTF8 payload",
        "Clean close with protocol error or invalid utf8 code or dropped TCP.",
        sequence(
            vec![close(
                normal,
                Bytes::from_static(b"\xce\xba\xe1\xbd\xb9\xcf\x83\xce\xbc\xce\xb5\xed\xa0\x80\x65\x64\x69\x74\x65\x64"),
            )],
            vec![],
            closed_by_me(
                &[CloseReason::PROTOCOL_ERROR, CloseReason::INVALID_PAYLOAD],
                false,
            ),
        ),
    );
}

fn register_codes(b: &mut CatalogBuilder) {
    b.title(&[7, 7], "Close frame structure: valid close codes (fuzzer initiated)");
    for (n, code) in (1u32..).zip(VALID_CODES) {
        b.case(
            &[7, 7, n],
            format!("Send close with valid close code {}", code),
            format!("Clean close with normal or echoed code {}", code),
            sequence(
                vec![close(Some(code), Bytes::new())],
                vec![],
                closed_by_me(&[CloseReason::NORMAL, code], true),
            ),
        );
    }

    b.title(&[7, 9], "Close frame structure: invalid close codes (fuzzer initiated)");
    for (n, code) in (1u32..).zip(INVALID_CODES) {
        b.case(
            &[7, 9, n],
            format!("Send close with invalid close code {}", code),
            "Clean close with protocol error code or drop TCP",
            sequence(
                vec![close(Some(code), Bytes::new())],
                vec![],
                closed_by_me(&[CloseReason::PROTOCOL_ERROR], false),
            ),
        );
    }

    b.title(&[7, 13], "Informational close information (fuzzer initiated)");
    for (n, code) in (1u32..).zip(UNREGISTERED_CODES) {
        b.case(
            &[7, 13, n],
            format!("Send close with close code {}", code),
            "Actual events are undefined by RFC 6455.",
            sequence(
                vec![close(Some(code), Bytes::new())],
                vec![],
                closed_by_me(&[CloseReason::PROTOCOL_ERROR], false),
            )
            .informational(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CaseCatalog;
    use crate::script::Script;

    #[test]
    fn test_invalid_codes_are_invalid() {
        for code in INVALID_CODES {
            assert!(!CloseReason::is_valid_code(code), "{}", code);
        }
        for code in VALID_CODES {
            assert!(CloseReason::is_valid_code(code), "{}", code);
        }
    }

    #[test]
    fn test_informational_cases() {
        let catalog = CaseCatalog::standard().unwrap();
        for id in ["7.1.6", "7.13.1", "7.13.2"] {
            let case = catalog.get(&id.parse().unwrap()).unwrap();
            let Script::Sequence(seq) = &case.script else {
                panic!("{} should be a frame sequence", id);
            };
            assert!(seq.informational, "{}", id);
        }
    }
}
