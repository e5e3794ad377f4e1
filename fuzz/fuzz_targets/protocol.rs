//! Fuzz target for direct-control commands and raw frame encoding
//!
//! Command parsing must reject garbage without panicking, and every frame a
//! valid command produces must encode to bytes the parser reads back.

#![no_main]

use arbitrary::Arbitrary;
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use sockudo_wstest::command::Command;
use sockudo_wstest::frame::{encode_frame, FrameParser, RawFrame};

#[derive(Arbitrary, Debug)]
struct FuzzFrame {
    opcode: u8,
    payload: Vec<u8>,
    fin: bool,
    rsv: u8,
    mask: Option<[u8; 4]>,
}

#[derive(Arbitrary, Debug)]
enum Input {
    Command(Vec<u8>),
    Frame(FuzzFrame),
}

fuzz_target!(|input: Input| {
    match input {
        Input::Command(bytes) => {
            let Ok(Command::SendFrames(frames)) = Command::parse(&bytes, false) else {
                return;
            };
            for frame in frames {
                if frame.effective_payload().len() > 64 * 1024 {
                    continue;
                }
                let mut buf = BytesMut::new();
                encode_frame(&frame.header(None), &frame.effective_payload(), &mut buf);
            }
        }
        Input::Frame(f) => {
            let payload = if f.payload.len() > 4096 { &f.payload[..4096] } else { &f.payload[..] };
            let mut frame = RawFrame::new(f.opcode & 0x0F, payload.to_vec())
                .fin(f.fin)
                .rsv(f.rsv & 0x7);
            if let Some(mask) = f.mask {
                frame = frame.mask(mask);
            }
            let header = frame.header(None);
            let mut buf = BytesMut::new();
            encode_frame(&header, &frame.effective_payload(), &mut buf);

            let mut parser = FrameParser::new(1024 * 1024);
            let decoded = parser
                .parse(&mut buf)
                .expect("encoded frame must parse")
                .expect("encoded frame must be complete");
            assert_eq!(decoded.header.opcode, header.opcode, "opcode mismatch");
            assert_eq!(decoded.header.fin, header.fin, "fin mismatch");
            assert_eq!(decoded.header.rsv, header.rsv, "rsv mismatch");
            assert_eq!(&decoded.payload[..], payload, "payload mismatch");
            assert!(buf.is_empty(), "trailing bytes after one frame");
        }
    }
});
