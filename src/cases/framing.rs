//! Families 1-4: framing, pings and pongs, reserved bits, opcodes

use bytes::Bytes;

use super::{echoed, frames, violation};
use crate::catalog::CatalogBuilder;
use crate::frame::RawFrame;
use crate::outcome::Event;
use crate::script::Step;

const MESSAGE_LENGTHS: [usize; 7] = [0, 125, 126, 127, 128, 65535, 65536];
const CHOPPED_LEN: usize = 65536;
const CHOP_SIZE: usize = 997;

const HELLO: &[u8] = b"Hello, world!";
const BINARY_PAYLOAD: &[u8] = b"\x00\xff\xfe\xfd\xfc\xfb\x00\xff";

pub(super) fn register(b: &mut CatalogBuilder) {
    register_framing(b);
    register_pings(b);
    register_reserved_bits(b);
    register_opcodes(b);
}

fn register_framing(b: &mut CatalogBuilder) {
    b.title(&[1], "Framing");
    for (sub, kind, fill, title) in [(1, "text", b'*', "Text Messages"), (2, "binary", 0xfe, "Binary Messages")] {
        b.title(&[1, sub], title);
        let message = |payload: Bytes| {
            if sub == 1 {
                (RawFrame::text(payload.clone()), Event::text(payload))
            } else {
                (RawFrame::binary(payload.clone()), Event::binary(payload))
            }
        };
        let expectation = format!(
            "Receive echo'ed {} message (with payload as sent). Clean close with normal code.",
            kind
        );

        for (i, len) in MESSAGE_LENGTHS.iter().enumerate() {
            let (frame, event) = message(Bytes::from(vec![fill; *len]));
            b.case(
                &[1, sub, i as u32 + 1],
                format!("Send {} message with payload of length {}.", kind, len),
                expectation.clone(),
                echoed(vec![Step::Frame(frame)], vec![event]),
            );
        }

        let (frame, event) = message(Bytes::from(vec![fill; CHOPPED_LEN]));
        b.case(
            &[1, sub, MESSAGE_LENGTHS.len() as u32 + 1],
            format!(
                "Send {} message message with payload of length {}. Sent out data in chops of {} octets.",
                kind, CHOPPED_LEN, CHOP_SIZE
            ),
            expectation,
            echoed(vec![Step::Frame(frame.chop(CHOP_SIZE))], vec![event]),
        );
    }
}

fn register_pings(b: &mut CatalogBuilder) {
    b.title(&[2], "Pings/Pongs");

    let pong_echo = |payload: Bytes| {
        echoed(
            vec![Step::Frame(RawFrame::ping(payload.clone()))],
            vec![Event::pong(payload)],
        )
    };

    b.case(
        &[2, 1],
        "Send ping without payload.",
        "Pong (with empty payload) is sent in reply to Ping. Clean close with normal code.",
        pong_echo(Bytes::new()),
    );
    b.case(
        &[2, 2],
        "Send ping with small text payload.",
        "Pong with payload echo'ed is sent in reply to Ping. Clean close with normal code.",
        pong_echo(Bytes::from_static(HELLO)),
    );
    b.case(
        &[2, 3],
        "Send ping with small binary (non UTF-8) payload.",
        "Pong with payload echo'ed is sent in reply to Ping. Clean close with normal code.",
        pong_echo(Bytes::from_static(BINARY_PAYLOAD)),
    );
    b.case(
        &[2, 4],
        "Send ping with binary payload of 125 octets.",
        "Pong with payload echo'ed is sent in reply to Ping. Clean close with normal code.",
        pong_echo(Bytes::from(vec![0xfe; 125])),
    );
    b.case(
        &[2, 5],
        "Send ping with binary payload of 126 octets.",
        "Connection is failed immediately (1002/Protocol Error), since control frames are only allowed to have payload up to and including 125 octets.",
        violation(frames([RawFrame::ping(vec![0xfe; 126])]), vec![]),
    );

    let chopped = Bytes::from(vec![0xfe; 125]);
    b.case(
        &[2, 6],
        "Send ping with binary payload of 125 octets, send in octet-wise chops.",
        "Pong with payload echo'ed is sent in reply to Ping. Implementations must be TCP clean. Clean close with normal code.",
        echoed(
            frames([RawFrame::ping(chopped.clone()).chop(1)]),
            vec![Event::pong(chopped)],
        ),
    );

    let unsolicited = Bytes::from_static(b"unsolicited pong payload");
    b.case(
        &[2, 7],
        "Send unsolicited pong without payload. Verify nothing is received. Clean close with normal code.",
        "Nothing.",
        echoed(frames([RawFrame::pong(Bytes::new())]), vec![]),
    );
    b.case(
        &[2, 8],
        "Send unsolicited pong with payload. Verify nothing is received. Clean close with normal code.",
        "Nothing.",
        echoed(frames([RawFrame::pong(unsolicited.clone())]), vec![]),
    );
    b.case(
        &[2, 9],
        "Send unsolicited pong with payload. Send ping with payload. Verify pong for ping is received.",
        "Nothing in reply to own Pong, but Pong with payload echo'ed in reply to Ping. Clean close with normal code.",
        echoed(
            frames([
                RawFrame::pong(unsolicited),
                RawFrame::ping(&b"ping payload"[..]),
            ]),
            vec![Event::pong(&b"ping payload"[..])],
        ),
    );

    for (sub, chopped) in [(10, false), (11, true)] {
        let payloads: Vec<Bytes> = (0..10).map(|i| Bytes::from(format!("payload-{}", i))).collect();
        let pings = payloads.iter().map(|p| {
            let ping = RawFrame::ping(p.clone());
            if chopped {
                ping.chop(1).sync()
            } else {
                ping
            }
        });
        let pongs: Vec<Event> = payloads.iter().cloned().map(Event::pong).collect();
        let last: Vec<Event> = pongs.last().cloned().into_iter().collect();
        let description = if chopped {
            "Send 10 Pings with payload. Send out octets in octet-wise chops."
        } else {
            "Send 10 Pings with payload."
        };
        b.case(
            &[2, sub],
            description,
            "Pongs for our Pings with all the payloads. Note: This is not required by the Spec .. but we check for this behaviour anyway. Clean close with normal code.",
            echoed(frames(pings), pongs).non_strict(last),
        );
    }
}

fn register_reserved_bits(b: &mut CatalogBuilder) {
    b.title(&[3], "Reserved Bits");
    let failed = "The connection is failed immediately, since RSV must be 0.";
    let hello = || Bytes::from_static(HELLO);

    b.case(
        &[3, 1],
        "Send small text message with RSV = 1.",
        failed,
        violation(frames([RawFrame::text(hello()).rsv(1)]), vec![]),
    );

    let echo_then_violate = |rsv: u8, sync: bool, chop: bool| {
        let tune = |f: RawFrame| {
            let f = if sync { f.sync() } else { f };
            if chop {
                f.chop(1)
            } else {
                f
            }
        };
        violation(
            frames([
                tune(RawFrame::text(hello())),
                tune(RawFrame::text(hello()).rsv(rsv)),
                tune(RawFrame::ping(Bytes::new())),
            ]),
            vec![Event::text(hello())],
        )
        .non_strict(vec![])
    };
    let echo_first = "Echo for first message is received, but then connection is failed immediately, since RSV must be 0, when no extension defining RSV meaning has been negotiated. The Pong is not received.";
    b.case(
        &[3, 2],
        "Send small text message, then send again with RSV = 2, then send Ping.",
        echo_first,
        echo_then_violate(2, false, false),
    );
    b.case(
        &[3, 3],
        "Send small text message, then send again with RSV = 3, then send Ping. Octets are sent in frame-wise chops.",
        echo_first,
        echo_then_violate(3, true, false),
    );
    b.case(
        &[3, 4],
        "Send small text message, then send again with RSV = 4, then send Ping. Octets are sent in octet-wise chops.",
        echo_first,
        echo_then_violate(4, true, true),
    );
    b.case(
        &[3, 5],
        "Send small binary message with RSV = 5.",
        failed,
        violation(frames([RawFrame::binary(BINARY_PAYLOAD).rsv(5)]), vec![]),
    );
    b.case(
        &[3, 6],
        "Send Ping with RSV = 6.",
        failed,
        violation(frames([RawFrame::ping(hello()).rsv(6)]), vec![]),
    );
    b.case(
        &[3, 7],
        "Send Close with RSV = 7.",
        failed,
        violation(frames([RawFrame::close(Some(1000), b"").rsv(7)]), vec![]),
    );
}

fn register_opcodes(b: &mut CatalogBuilder) {
    b.title(&[4], "Opcodes");
    b.title(&[4, 1], "Non-control Opcodes");
    b.title(&[4, 2], "Control Opcodes");

    for (sub, opcodes) in [(1u32, [3u8, 4, 5, 6, 7]), (2, [11, 12, 13, 14, 15])] {
        let failed = "The connection is failed immediately.";
        b.case(
            &[4, sub, 1],
            format!("Send frame with reserved {} Opcode = {}.", kind(sub), opcodes[0]),
            failed,
            violation(frames([RawFrame::new(opcodes[0], Bytes::new())]), vec![]),
        );
        b.case(
            &[4, sub, 2],
            format!(
                "Send frame with reserved {} Opcode = {} and non-empty payload.",
                kind(sub),
                opcodes[1]
            ),
            failed,
            violation(
                frames([RawFrame::new(opcodes[1], &b"reserved opcode payload"[..])]),
                vec![]
            ),
        );
        let echo_first = "Echo for first message is received, but then connection is failed immediately, since reserved opcode frame is used. A Pong is not received.";
        b.case(
            &[4, sub, 3],
            format!(
                "Send small text message, then send frame with reserved {} Opcode = {}, then send Ping.",
                kind(sub),
                opcodes[2]
            ),
            echo_first,
            violation(
                frames([
                    RawFrame::text(HELLO),
                    RawFrame::new(opcodes[2], Bytes::new()),
                    RawFrame::ping(Bytes::new()),
                ]),
                vec![Event::text(HELLO)],
            )
            .non_strict(vec![]),
        );
        b.case(
            &[4, sub, 4],
            format!(
                "Send small text message, then send frame with reserved {} Opcode = {} and non-empty payload, then send Ping.",
                kind(sub),
                opcodes[3]
            ),
            echo_first,
            violation(
                frames([
                    RawFrame::text(HELLO),
                    RawFrame::new(opcodes[3], &b"reserved opcode payload"[..]),
                    RawFrame::ping(Bytes::new()),
                ]),
                vec![Event::text(HELLO)],
            )
            .non_strict(vec![]),
        );
        b.case(
            &[4, sub, 5],
            format!(
                "Send small text message, then send frame with reserved {} Opcode = {} and non-empty payload, then send Ping. Octets are sent in octet-wise chops.",
                kind(sub),
                opcodes[4]
            ),
            echo_first,
            violation(
                frames([
                    RawFrame::text(HELLO).chop(1).sync(),
                    RawFrame::new(opcodes[4], &b"reserved opcode payload"[..])
                        .chop(1)
                        .sync(),
                    RawFrame::ping(Bytes::new()).chop(1).sync(),
                ]),
                vec![Event::text(HELLO)],
            )
            .non_strict(vec![]),
        );
    }
}

fn kind(sub: u32) -> &'static str {
    if sub == 1 {
        "non-control"
    } else {
        "control"
    }
}
