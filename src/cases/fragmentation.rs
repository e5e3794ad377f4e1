//! Family 5: fragmentation

use bytes::Bytes;

use super::{echoed, frames, violation};
use crate::catalog::CatalogBuilder;
use crate::frame::RawFrame;
use crate::outcome::Event;
use crate::script::Step;

/// How a sequence's frames hit the socket
#[derive(Clone, Copy)]
enum Delivery {
    Plain,
    /// Each frame flushed on its own
    FrameWise,
    /// Each frame flushed octet by octet
    OctetWise,
}

impl Delivery {
    fn apply(self, frame: RawFrame) -> RawFrame {
        match self {
            Delivery::Plain => frame,
            Delivery::FrameWise => frame.sync(),
            Delivery::OctetWise => frame.chop(1).sync(),
        }
    }

    fn note(self) -> &'static str {
        match self {
            Delivery::Plain => "",
            Delivery::FrameWise => " Octets are sent in frame-wise chops.",
            Delivery::OctetWise => " Octets are sent in octet-wise chops.",
        }
    }
}

const DELIVERIES: [Delivery; 3] = [Delivery::Plain, Delivery::FrameWise, Delivery::OctetWise];

fn deliver(delivery: Delivery, list: impl IntoIterator<Item = RawFrame>) -> Vec<Step> {
    frames(list.into_iter().map(|f| delivery.apply(f)))
}

pub(super) fn register(b: &mut CatalogBuilder) {
    b.title(&[5], "Fragmentation");

    b.case(
        &[5, 1],
        "Send Ping fragmented into 2 fragments.",
        "Connection is failed immediately, since control message MUST NOT be fragmented.",
        violation(
            frames([
                RawFrame::ping(&b"fragment1"[..]).fin(false),
                RawFrame::continuation(&b"fragment2"[..]),
            ]),
            vec![],
        ),
    );
    b.case(
        &[5, 2],
        "Send Pong fragmented into 2 fragments.",
        "Connection is failed immediately, since control message MUST NOT be fragmented.",
        violation(
            frames([
                RawFrame::pong(&b"fragment1"[..]).fin(false),
                RawFrame::continuation(&b"fragment2"[..]),
            ]),
            vec![],
        ),
    );

    // 5.3 - 5.5: two fragments, reassembled
    for (n, delivery) in (3u32..).zip(DELIVERIES) {
        b.case(
            &[5, n],
            format!(
                "Send text Message fragmented into 2 fragments.{}",
                delivery.note()
            ),
            "Message is processed and echo'ed back to us.",
            echoed(
                deliver(
                    delivery,
                    [
                        RawFrame::text(&b"fragment1"[..]).fin(false),
                        RawFrame::continuation(&b"fragment2"[..]),
                    ],
                ),
                vec![Event::text(&b"fragment1fragment2"[..])],
            ),
        );
    }

    // 5.6 - 5.8: a ping between the fragments
    for (n, delivery) in (6u32..).zip(DELIVERIES) {
        b.case(
            &[5, n],
            format!(
                "Send text Message fragmented into 2 fragments, one ping with payload in-between.{}",
                delivery.note()
            ),
            "A pong is received, then the message is echo'ed back to us.",
            echoed(
                deliver(
                    delivery,
                    [
                        RawFrame::text(&b"fragment1"[..]).fin(false),
                        RawFrame::ping(&b"ping payload"[..]),
                        RawFrame::continuation(&b"fragment2"[..]),
                    ],
                ),
                vec![
                    Event::pong(&b"ping payload"[..]),
                    Event::text(&b"fragment1fragment2"[..]),
                ],
            ),
        );
    }

    // 5.9 - 5.14: continuation without a message to continue
    for (n, final_fragment) in [(9u32, true), (12, false)] {
        for (offset, delivery) in (0u32..).zip(DELIVERIES) {
            b.case(
                &[5, n + offset],
                format!(
                    "Send unfragmented Text Message after Continuation Frame with FIN = {}, where there is nothing to continue, sent in one chop.{}",
                    if final_fragment { "true" } else { "false" },
                    delivery.note()
                ),
                "The connection is failed immediately, since there is no message to continue.",
                violation(
                    deliver(
                        delivery,
                        [
                            RawFrame::continuation(&b"non-continuation payload"[..])
                                .fin(final_fragment),
                            RawFrame::text(&b"Hello, world!"[..]),
                        ],
                    ),
                    vec![],
                ),
            );
        }
    }

    b.case(
        &[5, 15],
        "Send text Message fragmented into 2 fragments, then Continuation Frame with FIN = false where there is nothing to continue, then unfragmented Text Message, all sent in one chop.",
        "The connection is failed immediately, since there is no message to continue.",
        violation(
            frames([
                RawFrame::text(&b"fragment1"[..]).fin(false),
                RawFrame::continuation(&b"fragment2"[..]),
                RawFrame::continuation(&b"fragment3"[..]).fin(false),
                RawFrame::text(&b"fragment4"[..]),
            ]),
            vec![Event::text(&b"fragment1fragment2"[..])],
        )
        .non_strict(vec![]),
    );

    for (n, first_fin) in [(16u32, false), (17, true)] {
        let round = || {
            [
                RawFrame::continuation(&b"fragment1"[..]).fin(first_fin),
                RawFrame::text(&b"fragment2"[..]).fin(false),
                RawFrame::continuation(&b"fragment3"[..]),
            ]
        };
        b.case(
            &[5, n],
            format!(
                "Repeated 2x: Continuation Frame with FIN = {} (where there is nothing to continue), then text Message fragmented into 2 fragments.",
                first_fin
            ),
            "The connection is failed immediately, since there is no message to continue.",
            violation(frames(round().into_iter().chain(round())), vec![]),
        );
    }

    b.case(
        &[5, 18],
        "Send text Message fragmented into 2 fragments, with both frame opcodes set to text, sent in one chop.",
        "The connection is failed immediately, since all data frames after the initial data frame must have opcode 0.",
        violation(
            frames([
                RawFrame::text(&b"fragment1"[..]).fin(false),
                RawFrame::text(&b"fragment2"[..]),
            ]),
            vec![],
        ),
    );

    // 5.19 - 5.20: pings between fragments, with a pause in the middle
    for (n, delivery) in [(19u32, Delivery::Plain), (20, Delivery::FrameWise)] {
        let f = |frame: RawFrame| Step::Frame(delivery.apply(frame));
        let steps = vec![
            f(RawFrame::text(&b"fragment1"[..]).fin(false)),
            f(RawFrame::continuation(&b"fragment2"[..]).fin(false)),
            f(RawFrame::ping(&b"pongme 1!"[..])),
            f(RawFrame::continuation(&b"fragment3"[..]).fin(false)),
            Step::Pause(1.0),
            f(RawFrame::continuation(&b"fragment4"[..]).fin(false)),
            f(RawFrame::ping(&b"pongme 2!"[..])),
            f(RawFrame::continuation(&b"fragment5"[..])),
        ];
        b.case(
            &[5, n],
            format!(
                "A fragmented text message is sent in multiple frames. After sending the first 2 frames of the text message, a Ping is sent. Then we wait 1s, then we send 2 more text fragments, another Ping and then the final text fragment. Everything is legal.{}",
                delivery.note()
            ),
            "The peer immediately answers the first Ping before it has received the last text message fragment. The peer pong's back the Ping's payload exactly, and echo's the payload of the fragmented message back to us.",
            echoed(
                steps,
                vec![
                    Event::pong(&b"pongme 1!"[..]),
                    Event::pong(&b"pongme 2!"[..]),
                    Event::text(Bytes::from_static(b"fragment1fragment2fragment3fragment4fragment5")),
                ],
            ),
        );
    }
}
