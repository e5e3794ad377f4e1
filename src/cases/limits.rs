//! Families 9 and 10: limits/performance and miscellaneous

use crate::catalog::CatalogBuilder;
use crate::script::{EchoRoundTrip, FragmentedSend, Payload};

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

const TEXT_PATTERN: &[u8] = b"BAsd7&jh23";
const BINARY_PATTERN: &[u8] = b"\xfe";
const FRAGMENTED_PATTERN: &[u8] = b"*";

/// (size, wait seconds) for the single-message families 9.1 and 9.2
const MESSAGE_SIZES: [(usize, f64); 6] = [
    (64 * KIB, 100.0),
    (256 * KIB, 100.0),
    (MIB, 100.0),
    (4 * MIB, 100.0),
    (8 * MIB, 100.0),
    (16 * MIB, 100.0),
];

/// Fragment sizes for 9.3 and 9.4, all sending a 4M message
const FRAGMENT_SIZES: [usize; 9] = [64, 256, KIB, 4 * KIB, 16 * KIB, 64 * KIB, 256 * KIB, MIB, 4 * MIB];
const FRAGMENTED_LEN: usize = 4 * MIB;

/// Chop sizes for 9.5 and 9.6, all sending a 1M message
const CHOP_SIZES: [usize; 6] = [64, 128, 256, 512, 1024, 2048];
const CHOPPED_LEN: usize = MIB;

/// (size, wait seconds) for the 1000-message round trips of 9.7 and 9.8
const ROUND_TRIP_SIZES: [(usize, f64); 6] = [
    (0, 60.0),
    (16, 60.0),
    (64, 60.0),
    (256, 120.0),
    (1024, 240.0),
    (4096, 480.0),
];
const ROUND_TRIPS: usize = 1000;

const AUTO_FRAGMENT_LEN: usize = 65536;
const AUTO_FRAGMENT_SIZE: usize = 1300;

fn size_name(len: usize) -> String {
    if len >= MIB && len % MIB == 0 {
        format!("{}M", len / MIB)
    } else if len >= KIB && len % KIB == 0 {
        format!("{}k", len / KIB)
    } else {
        len.to_string()
    }
}

fn kind(binary: bool) -> &'static str {
    if binary {
        "binary"
    } else {
        "text"
    }
}

pub(super) fn register(b: &mut CatalogBuilder) {
    b.title(&[9], "Limits/Performance");

    for (sub, binary) in [(1u32, false), (2, true)] {
        b.title(
            &[9, sub],
            if binary {
                "Binary Message (increasing size)"
            } else {
                "Text Message (increasing size)"
            },
        );
        let pattern = if binary { BINARY_PATTERN } else { TEXT_PATTERN };
        for (n, (len, wait_secs)) in (1u32..).zip(MESSAGE_SIZES) {
            b.case(
                &[9, sub, n],
                format!(
                    "Send {} message message with payload of length {} ({}).",
                    kind(binary),
                    len,
                    size_name(len)
                ),
                format!(
                    "Receive echo'ed {} message (with payload as sent).",
                    kind(binary)
                ),
                EchoRoundTrip {
                    payload: Payload::repeat(pattern, len),
                    binary,
                    count: 1,
                    chop_size: None,
                    auto_fragment: None,
                    wait_secs,
                    report_time: true,
                },
            );
        }
    }

    for (sub, binary) in [(3u32, false), (4, true)] {
        b.title(
            &[9, sub],
            if binary {
                "Fragmented Binary Message (fixed size, increasing fragment size)"
            } else {
                "Fragmented Text Message (fixed size, increasing fragment size)"
            },
        );
        let pattern = if binary { BINARY_PATTERN } else { FRAGMENTED_PATTERN };
        for (n, fragment_size) in (1u32..).zip(FRAGMENT_SIZES) {
            b.case(
                &[9, sub, n],
                format!(
                    "Send fragmented {} message message with message payload of length {} ({}). Sent out in fragments of {}.",
                    kind(binary),
                    FRAGMENTED_LEN,
                    size_name(FRAGMENTED_LEN),
                    size_name(fragment_size)
                ),
                format!(
                    "Receive echo'ed {} message (with payload as sent).",
                    kind(binary)
                ),
                FragmentedSend {
                    payload: Payload::repeat(pattern, FRAGMENTED_LEN),
                    binary,
                    fragment_size,
                    wait_secs: 100.0,
                    report_time: true,
                },
            );
        }
    }

    for (sub, binary) in [(5u32, false), (6, true)] {
        b.title(
            &[9, sub],
            if binary {
                "Binary Message (fixed size, increasing chop size)"
            } else {
                "Text Message (fixed size, increasing chop size)"
            },
        );
        let pattern = if binary { BINARY_PATTERN } else { TEXT_PATTERN };
        for (n, chop_size) in (1u32..).zip(CHOP_SIZES) {
            b.case(
                &[9, sub, n],
                format!(
                    "Send {} message message with payload of length {} ({}). Sent out data in chops of {} octets.",
                    kind(binary),
                    CHOPPED_LEN,
                    size_name(CHOPPED_LEN),
                    chop_size
                ),
                format!(
                    "Receive echo'ed {} message (with payload as sent).",
                    kind(binary)
                ),
                EchoRoundTrip {
                    payload: Payload::repeat(pattern, CHOPPED_LEN),
                    binary,
                    count: 1,
                    chop_size: Some(chop_size),
                    auto_fragment: None,
                    wait_secs: 100.0,
                    report_time: true,
                },
            );
        }
    }

    for (sub, binary) in [(7u32, false), (8, true)] {
        b.title(
            &[9, sub],
            if binary {
                "Binary Message Roundtrip Time (fixed number, increasing size)"
            } else {
                "Text Message Roundtrip Time (fixed number, increasing size)"
            },
        );
        let pattern = if binary { BINARY_PATTERN } else { FRAGMENTED_PATTERN };
        for (n, (len, wait_secs)) in (1u32..).zip(ROUND_TRIP_SIZES) {
            b.case(
                &[9, sub, n],
                format!(
                    "Send {} {} messages of payload size {} to measure implementation/network RTT (round trip time) / latency.",
                    ROUND_TRIPS,
                    kind(binary),
                    len
                ),
                format!(
                    "Receive echo'ed {} messages (with payload as sent). Timeout case after {} secs.",
                    kind(binary),
                    wait_secs
                ),
                EchoRoundTrip {
                    payload: Payload::repeat(pattern, len),
                    binary,
                    count: ROUND_TRIPS,
                    chop_size: None,
                    auto_fragment: None,
                    wait_secs,
                    report_time: true,
                },
            );
        }
    }

    b.title(&[10], "Misc");
    b.title(&[10, 1], "Auto-Fragmentation");
    b.case(
        &[10, 1, 1],
        format!(
            "Send text message with payload of length {}, auto-fragmented with autoFragmentSize = {}.",
            AUTO_FRAGMENT_LEN, AUTO_FRAGMENT_SIZE
        ),
        "Receive echo'ed text message (with payload as sent and transmitted frame counts as expected). Clean close with normal code.",
        EchoRoundTrip {
            payload: Payload::repeat(FRAGMENTED_PATTERN, AUTO_FRAGMENT_LEN),
            binary: false,
            count: 1,
            chop_size: None,
            auto_fragment: Some(AUTO_FRAGMENT_SIZE),
            wait_secs: 10.0,
            report_time: false,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_names() {
        assert_eq!(size_name(64 * KIB), "64k");
        assert_eq!(size_name(4 * MIB), "4M");
        assert_eq!(size_name(16), "16");
    }
}
