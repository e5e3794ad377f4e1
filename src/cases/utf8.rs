//! Family 6: UTF-8 handling
//!
//! 6.1-6.4 are hand-written; 6.5 onward are generated from the UTF-8 decoder
//! stress test sequences (Markus Kuhn's UTF-8-test.txt).

use bytes::Bytes;

use super::{echoed, failing, frames};
use crate::catalog::CatalogBuilder;
use crate::error::CloseReason;
use crate::frame::RawFrame;
use crate::outcome::Event;
use crate::script::{Step, Utf8Probe, Utf8Split};
use crate::trace::bin_log_data;

/// "Hello-µ@ßöäüàá-UTF-8!!"
const MIXED_TEXT: &str = "Hello-\u{b5}@\u{df}\u{f6}\u{e4}\u{fc}\u{e0}\u{e1}-UTF-8!!";

/// "κόσμε"
const KOSME: &[u8] = b"\xce\xba\xe1\xbd\xb9\xcf\x83\xce\xbc\xce\xb5";

/// "κόσμε" followed by a surrogate and "edited"
const KOSME_INVALID: &[u8] =
    b"\xce\xba\xe1\xbd\xb9\xcf\x83\xce\xbc\xce\xb5\xed\xa0\x80\x65\x64\x69\x74\x65\x64";

/// First sub-category generated from the test sequences
const FIRST_GENERATED: u32 = 5;

/// A titled group of UTF-8 test vectors with their validity
#[derive(Debug, Clone)]
pub struct Utf8TestGroup {
    pub title: &'static str,
    pub vectors: Vec<(bool, Vec<u8>)>,
}

fn group(title: &'static str, vectors: Vec<(bool, Vec<u8>)>) -> Utf8TestGroup {
    Utf8TestGroup { title, vectors }
}

fn all(valid: bool, list: &[&[u8]]) -> Vec<(bool, Vec<u8>)> {
    list.iter().map(|v| (valid, v.to_vec())).collect()
}

/// The UTF-8 decoder test sequences, in registration order
pub fn utf8_test_sequences() -> Vec<Utf8TestGroup> {
    let mut groups = Vec::new();

    groups.push(group(
        "Some valid UTF-8 sequences",
        all(
            true,
            &[
                b"hello\x24world",
                b"hello\xc2\xa2world",
                b"hello\xe2\x82\xacworld",
                b"hello\xf0\xa4\xad\xa2world",
                KOSME,
            ],
        ),
    ));

    groups.push(group(
        "All prefixes of a valid UTF-8 string that contains multi-byte code points",
        (1..=KOSME.len())
            .map(|i| {
                let prefix = &KOSME[..i];
                (crate::utf8::validate_utf8(prefix), prefix.to_vec())
            })
            .collect(),
    ));

    groups.push(group(
        "First possible sequence of a certain length",
        all(true, &[b"\x00", b"\xc2\x80", b"\xe0\xa0\x80", b"\xf0\x90\x80\x80"]),
    ));
    groups.push(group(
        "First possible sequence length 5/6 (invalid codepoints)",
        all(false, &[b"\xf8\x88\x80\x80\x80", b"\xfc\x84\x80\x80\x80\x80"]),
    ));
    groups.push(group(
        "Last possible sequence of a certain length",
        all(true, &[b"\x7f", b"\xdf\xbf", b"\xef\xbf\xbf", b"\xf4\x8f\xbf\xbf"]),
    ));
    groups.push(group(
        "Last possible sequence length 4/5/6 (invalid codepoints)",
        all(
            false,
            &[b"\xf7\xbf\xbf\xbf", b"\xfb\xbf\xbf\xbf\xbf", b"\xfd\xbf\xbf\xbf\xbf\xbf"],
        ),
    ));

    let mut boundary = all(
        true,
        &[b"\xed\x9f\xbf", b"\xee\x80\x80", b"\xef\xbf\xbd", b"\xf4\x8f\xbf\xbf"],
    );
    boundary.push((false, b"\xf4\x90\x80\x80".to_vec()));
    groups.push(group("Other boundary conditions", boundary));

    let mut continuation = all(
        false,
        &[
            b"\x80",
            b"\xbf",
            b"\x80\xbf",
            b"\x80\xbf\x80",
            b"\x80\xbf\x80\xbf",
            b"\x80\xbf\x80\xbf\x80",
            b"\x80\xbf\x80\xbf\x80\xbf",
        ],
    );
    continuation.push((false, (0x80u8..0xbf).collect()));
    groups.push(group("Unexpected continuation bytes", continuation));

    groups.push(group(
        "Lonely start characters",
        [(0xc0u8, 0xdfu8), (0xe0, 0xef), (0xf0, 0xf7), (0xf8, 0xfb), (0xfc, 0xfd)]
            .iter()
            .map(|&(from, to)| (false, (from..to).flat_map(|b| [b, 0x20]).collect()))
            .collect(),
    ));

    let truncated: [&[u8]; 10] = [
        b"\xc0",
        b"\xe0\x80",
        b"\xf0\x80\x80",
        b"\xf8\x80\x80\x80",
        b"\xfc\x80\x80\x80\x80",
        b"\xdf",
        b"\xef\xbf",
        b"\xf7\xbf\xbf",
        b"\xfb\xbf\xbf\xbf",
        b"\xfd\xbf\xbf\xbf\xbf",
    ];
    groups.push(group(
        "Sequences with last continuation byte missing",
        all(false, &truncated),
    ));
    groups.push(group(
        "Concatenation of incomplete sequences",
        vec![(false, truncated.concat())],
    ));

    groups.push(group(
        "Impossible bytes",
        all(false, &[b"\xfe", b"\xff", b"\xfe\xfe\xff\xff"]),
    ));
    groups.push(group(
        "Examples of an overlong ASCII character",
        all(
            false,
            &[
                b"\xc0\xaf",
                b"\xe0\x80\xaf",
                b"\xf0\x80\x80\xaf",
                b"\xf8\x80\x80\x80\xaf",
                b"\xfc\x80\x80\x80\x80\xaf",
            ],
        ),
    ));
    groups.push(group(
        "Maximum overlong sequences",
        all(
            false,
            &[
                b"\xc1\xbf",
                b"\xe0\x9f\xbf",
                b"\xf0\x8f\xbf\xbf",
                b"\xf8\x87\xbf\xbf\xbf",
                b"\xfc\x83\xbf\xbf\xbf\xbf",
            ],
        ),
    ));
    groups.push(group(
        "Overlong representation of the NUL character",
        all(
            false,
            &[
                b"\xc0\x80",
                b"\xe0\x80\x80",
                b"\xf0\x80\x80\x80",
                b"\xf8\x80\x80\x80\x80",
                b"\xfc\x80\x80\x80\x80\x80",
            ],
        ),
    ));

    let surrogates: [&[u8]; 7] = [
        b"\xed\xa0\x80",
        b"\xed\xad\xbf",
        b"\xed\xae\x80",
        b"\xed\xaf\xbf",
        b"\xed\xb0\x80",
        b"\xed\xbe\x80",
        b"\xed\xbf\xbf",
    ];
    groups.push(group("Single UTF-16 surrogates", all(false, &surrogates)));

    let mut paired = Vec::new();
    for high in &surrogates[..4] {
        for low in [&b"\xed\xb0\x80"[..], &b"\xed\xbf\xbf"[..]] {
            paired.push((false, [*high, low].concat()));
        }
    }
    groups.push(group("Paired UTF-16 surrogates", paired));

    let mut noncharacters = all(true, &[b"\xef\xbf\xbe", b"\xef\xbf\xbf"]);
    for lead in [0xf0u8, 0xf1, 0xf2, 0xf3, 0xf4] {
        for second in [0x8fu8, 0x9f, 0xaf, 0xbf] {
            // beyond U+10FFFF
            if lead == 0xf4 && second != 0x8f {
                continue;
            }
            for last in [0xbeu8, 0xbf] {
                let seq = vec![lead, second, 0xbf, last];
                // overlong
                if lead == 0xf0 && second == 0x8f {
                    continue;
                }
                noncharacters.push((true, seq));
            }
        }
    }
    groups.push(group("Non-character code points (valid UTF-8)", noncharacters));

    groups.push(group(
        "Unicode specials (i.e. replacement char)",
        (0xb9u8..=0xbf).map(|b| (true, vec![0xef, 0xbf, b])).collect(),
    ));

    groups
}

pub(super) fn register(b: &mut CatalogBuilder) {
    b.title(&[6], "UTF-8 Handling");
    register_fixed(b);

    for (g, test_group) in (FIRST_GENERATED..).zip(utf8_test_sequences()) {
        b.title(&[6, g], test_group.title);
        for (n, (valid, payload)) in (1u32..).zip(test_group.vectors) {
            let (description, expectation) = if valid {
                (
                    "Send a text message with payload which is valid UTF-8 in one fragment.",
                    "The message is echo'ed back to us.",
                )
            } else {
                (
                    "Send a text message with payload which is not valid UTF-8 in one fragment.",
                    "The connection is failed immediately, since the payload is not valid UTF-8.",
                )
            };
            b.case(
                &[6, g, n],
                format!(
                    "{}<br><br>Payload: 0x{}",
                    description,
                    bin_log_data(&payload, usize::MAX)
                ),
                expectation,
                Utf8Probe {
                    payload: Bytes::from(payload),
                    valid,
                    split: Utf8Split::Whole,
                },
            );
        }
    }
}

fn register_fixed(b: &mut CatalogBuilder) {
    b.title(&[6, 1], "Valid UTF-8 with zero payload fragments");
    b.case(
        &[6, 1, 1],
        "Send text message of length 0.",
        "A message is echo'ed back to us (with empty payload).",
        echoed(frames([RawFrame::text(Bytes::new())]), vec![Event::text("")]),
    );
    b.case(
        &[6, 1, 2],
        "Send fragmented text message, 3 fragments each of length 0.",
        "A message is echo'ed back to us (with empty payload).",
        echoed(
            frames([
                RawFrame::text(Bytes::new()).fin(false),
                RawFrame::continuation(Bytes::new()).fin(false),
                RawFrame::continuation(Bytes::new()),
            ]),
            vec![Event::text("")],
        ),
    );
    b.case(
        &[6, 1, 3],
        "Send fragmented text message, 3 fragments, first and last of length 0, middle non-empty.",
        "A message is echo'ed back to us (with payload = payload of middle fragment).",
        echoed(
            frames([
                RawFrame::text(Bytes::new()).fin(false),
                RawFrame::continuation(&b"middle frame payload"[..]).fin(false),
                RawFrame::continuation(Bytes::new()),
            ]),
            vec![Event::text("middle frame payload")],
        ),
    );

    b.title(&[6, 2], "Valid UTF-8 unfragmented, fragmented on code-points and within code-points");
    let mixed = Bytes::from_static(MIXED_TEXT.as_bytes());
    let probes = [
        (
            mixed.clone(),
            Utf8Split::Whole,
            "Send a valid UTF-8 text message in one fragment.",
        ),
        (
            mixed.clone(),
            Utf8Split::Codepoints,
            "Send a valid UTF-8 text message in fragments fragmented on UTF-8 code point boundary.",
        ),
        (
            mixed,
            Utf8Split::Octets(1),
            "Send a valid UTF-8 text message in fragments of 1 octet, resulting in frames ending on positions which are not code point ends.",
        ),
        (
            Bytes::from_static(KOSME),
            Utf8Split::Octets(1),
            "Send a valid UTF-8 text message in fragments of 1 octet, resulting in frames ending on positions which are not code point ends.",
        ),
    ];
    for (n, (payload, split, description)) in (1u32..).zip(probes) {
        b.case(
            &[6, 2, n],
            format!(
                "{}<br><br>MESSAGE:<br>{}",
                description,
                String::from_utf8_lossy(&payload)
            ),
            "The message is echo'ed back to us.",
            Utf8Probe {
                payload,
                valid: true,
                split,
            },
        );
    }

    b.title(&[6, 3], "Invalid UTF-8 differently fragmented");
    for (n, split) in [(1u32, Utf8Split::Whole), (2, Utf8Split::Octets(1))] {
        let how = if n == 1 {
            "in one fragment"
        } else {
            "in fragments of 1 octet"
        };
        b.case(
            &[6, 3, n],
            format!(
                "Send invalid UTF-8 text message {}.<br><br>MESSAGE:<br>{}",
                how,
                bin_log_data(KOSME_INVALID, usize::MAX)
            ),
            "The connection is failed immediately, since the payload is not valid UTF-8.",
            Utf8Probe {
                payload: Bytes::from_static(KOSME_INVALID),
                valid: false,
                split,
            },
        );
    }

    b.title(&[6, 4], "Fail-fast on invalid UTF-8");
    let fast_fail = "The first frame is accepted, we expect to timeout on the first wait. The 2nd frame should be rejected immediately (fail fast on UTF-8). If we timeout, we expect the connection is failed at least then, since the complete message payload is not valid UTF-8.";
    let fragments: [(&[u8], &[u8], &[u8]); 2] = [
        (KOSME, b"\xf4\x90\x80\x80", b"\x65\x64\x69\x74\x65\x64"),
        (
            b"\xce\xba\xe1\xbd\xb9\xcf\x83\xce\xbc\xce\xb5\xf4",
            b"\x90",
            b"\x80\x80\x65\x64\x69\x74\x65\x64",
        ),
    ];
    for (n, (first, second, third)) in (1u32..).zip(fragments) {
        b.case(
            &[6, 4, n],
            format!(
                "Send invalid UTF-8 text message in 3 fragments (frames). First frame payload is valid, then wait, then 2nd frame which contains the payload making the sequence invalid, then wait, then 3rd frame with rest. Note that PART1 and PART3 are valid UTF-8 in themselves, PART2 is a 0x{} sequence.",
                bin_log_data(second, usize::MAX)
            ),
            fast_fail,
            fail_fast(
                RawFrame::text(first).fin(false),
                RawFrame::continuation(second).fin(false),
                RawFrame::continuation(third),
            ),
        );
    }

    let payload = KOSME_INVALID;
    let (valid_part, rest) = payload.split_at(KOSME.len());
    for (n, chop) in [(3u32, None), (4, Some(1))] {
        let tune = |f: RawFrame| match chop {
            Some(size) => f.chop(size).sync(),
            None => f.sync(),
        };
        b.case(
            &[6, 4, n],
            format!(
                "Same as Case 6.4.{}, but we send message not in 3 frames, but in 3 chops of the same message frame.<br><br>MESSAGE PARTS:<br>PART1 = {}<br>PART2 = {}<br>",
                n - 2,
                bin_log_data(valid_part, usize::MAX),
                bin_log_data(rest, usize::MAX)
            ),
            fast_fail,
            fail_fast(
                tune(RawFrame::text(valid_part).fin(false)),
                tune(RawFrame::continuation(&rest[..4]).fin(false)),
                tune(RawFrame::continuation(&rest[4..])),
            ),
        );
    }
}

fn fail_fast(first: RawFrame, second: RawFrame, third: RawFrame) -> crate::script::FrameSequence {
    failing(
        vec![
            Step::Frame(first),
            Step::Pause(1.0),
            Step::Frame(second),
            Step::Pause(1.0),
            Step::Frame(third),
        ],
        vec![],
        CloseReason::INVALID_PAYLOAD,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_groups() {
        let groups = utf8_test_sequences();
        assert_eq!(groups.len(), 19);
        assert_eq!(groups[0].title, "Some valid UTF-8 sequences");
        assert_eq!(groups[1].vectors.len(), KOSME.len());
        assert_eq!(groups[7].vectors.last().unwrap().1.len(), 0xbf - 0x80);
        assert_eq!(groups[16].vectors.len(), 8);
    }

    #[test]
    fn test_validity_agrees_with_validator() {
        for group in utf8_test_sequences() {
            for (valid, bytes) in group.vectors {
                assert_eq!(
                    crate::utf8::validate_utf8(&bytes),
                    valid,
                    "{}: {:02x?}",
                    group.title,
                    bytes
                );
            }
        }
    }

    #[test]
    fn test_noncharacters_skip_overlong_and_out_of_range() {
        let groups = utf8_test_sequences();
        let nonchars = &groups[17].vectors;
        assert!(!nonchars.iter().any(|(_, v)| v == b"\xf0\x8f\xbf\xbe"));
        assert!(!nonchars.iter().any(|(_, v)| v.starts_with(b"\xf4\x9f")));
        assert!(nonchars.iter().any(|(_, v)| v == b"\xf4\x8f\xbf\xbf"));
    }
}
