//! Fuzz target for the streaming frame parser
//!
//! Arbitrary bytes, fed whole and in two pieces, must never panic and must
//! decode to the same frames either way.

#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use sockudo_wstest::frame::FrameParser;

fn drain(parser: &mut FrameParser, buf: &mut BytesMut, out: &mut Vec<sockudo_wstest::frame::Frame>) -> bool {
    loop {
        match parser.parse(buf) {
            Ok(Some(frame)) => out.push(frame),
            Ok(None) => return true,
            Err(_) => return false,
        }
    }
}

fuzz_target!(|data: &[u8]| {
    let mut whole = Vec::new();
    let mut parser = FrameParser::new(1024 * 1024);
    let mut buf = BytesMut::from(data);
    let ok = drain(&mut parser, &mut buf, &mut whole);

    if data.is_empty() || !ok {
        return;
    }

    let split = data[0] as usize % data.len();
    let mut pieces = Vec::new();
    let mut parser = FrameParser::new(1024 * 1024);
    let mut buf = BytesMut::from(&data[..split]);
    if drain(&mut parser, &mut buf, &mut pieces) {
        buf.extend_from_slice(&data[split..]);
        if drain(&mut parser, &mut buf, &mut pieces) {
            assert_eq!(whole, pieces, "split input decoded differently");
        }
    }
});
