//! Direct-control commands
//!
//! A connection with no case bound interprets each text message as a
//! `[name, params]` JSON array and turns it into frames. This is the raw
//! stimulus primitive of the harness exposed over the wire.

use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use crate::connection::Connection;
use crate::error::ProtocolStimulusError;
use crate::frame::{OpCode, RawFrame};

type StimulusResult<T> = std::result::Result<T, ProtocolStimulusError>;

/// One parsed direct-control command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `sendframe` and `sendframes`
    SendFrames(Vec<RawFrame>),
    Close {
        code: Option<u16>,
        reason: Option<String>,
    },
    /// Send the payload back as one text frame
    Echo(RawFrame),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MaskParam {
    Text(String),
    Octets([u8; 4]),
}

#[derive(Debug, Deserialize)]
struct FrameParams {
    opcode: Option<u8>,
    #[serde(default)]
    payload: String,
    #[serde(default = "default_fin")]
    fin: bool,
    #[serde(default)]
    rsv: u8,
    mask: Option<MaskParam>,
    payload_len: Option<usize>,
    chopsize: Option<usize>,
    #[serde(default)]
    sync: bool,
}

fn default_fin() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct CloseParams {
    code: Option<u16>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EchoParams {
    #[serde(default)]
    payload: String,
    payload_len: Option<usize>,
}

fn params<T: for<'de> Deserialize<'de>>(command: &'static str, value: Value) -> StimulusResult<T> {
    serde_json::from_value(value).map_err(|e| ProtocolStimulusError::InvalidField {
        command,
        field: "params",
        reason: e.to_string(),
    })
}

/// `payload` repeated cyclically to `len` octets
fn repeated(command: &'static str, frame: RawFrame, len: Option<usize>) -> StimulusResult<RawFrame> {
    match len {
        None => Ok(frame),
        Some(len) if frame.payload.is_empty() && len > 0 => Err(ProtocolStimulusError::InvalidField {
            command,
            field: "payload_len",
            reason: format!("cannot construct repeated payload with length {} from payload of length 0", len),
        }),
        Some(len) => Ok(frame.repeat(len)),
    }
}

impl FrameParams {
    fn into_frame(self, command: &'static str) -> StimulusResult<RawFrame> {
        let opcode = self.opcode.ok_or(ProtocolStimulusError::MissingField {
            command,
            field: "opcode",
        })?;
        if opcode > 0x0F {
            return Err(ProtocolStimulusError::InvalidField {
                command,
                field: "opcode",
                reason: format!("{} is not a 4-bit opcode", opcode),
            });
        }
        if self.rsv > 7 {
            return Err(ProtocolStimulusError::InvalidField {
                command,
                field: "rsv",
                reason: format!("{} is not a 3-bit value", self.rsv),
            });
        }

        let mut frame = RawFrame::new(opcode, Bytes::from(self.payload))
            .fin(self.fin)
            .rsv(self.rsv);
        frame = repeated(command, frame, self.payload_len)?;
        match self.mask {
            Some(MaskParam::Octets(key)) => frame = frame.mask(key),
            Some(MaskParam::Text(text)) => {
                let key: [u8; 4] = text.as_bytes().try_into().map_err(|_| {
                    ProtocolStimulusError::InvalidField {
                        command,
                        field: "mask",
                        reason: format!("mask must be 4 octets, got {}", text.len()),
                    }
                })?;
                frame = frame.mask(key);
            }
            None => {}
        }
        if let Some(size) = self.chopsize.filter(|size| *size > 0) {
            frame = frame.chop(size);
        }
        if self.sync {
            frame = frame.sync();
        }
        Ok(frame)
    }
}

impl Command {
    /// Parse one command message
    pub fn parse(payload: &[u8], binary: bool) -> StimulusResult<Self> {
        if binary {
            return Err(ProtocolStimulusError::BinaryCommand);
        }
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| ProtocolStimulusError::Unparseable(e.to_string()))?;
        let Value::Array(mut items) = value else {
            return Err(ProtocolStimulusError::Unparseable("expected a JSON array".into()));
        };
        if items.len() != 2 {
            return Err(ProtocolStimulusError::Unparseable(format!(
                "expected [name, params], got {} elements",
                items.len()
            )));
        }
        let args = items.pop().unwrap_or(Value::Null);
        let Some(name) = items.pop().and_then(|v| v.as_str().map(str::to_string)) else {
            return Err(ProtocolStimulusError::Unparseable("command name must be a string".into()));
        };

        match name.as_str() {
            "sendframe" => {
                let frame = params::<FrameParams>("sendframe", args)?.into_frame("sendframe")?;
                Ok(Command::SendFrames(vec![frame]))
            }
            "sendframes" => {
                let list = params::<Vec<FrameParams>>("sendframes", args)?;
                let frames = list
                    .into_iter()
                    .map(|p| p.into_frame("sendframes"))
                    .collect::<StimulusResult<Vec<_>>>()?;
                Ok(Command::SendFrames(frames))
            }
            "close" => {
                let p = params::<CloseParams>("close", args)?;
                Ok(Command::Close {
                    code: p.code,
                    reason: p.reason,
                })
            }
            "echo" => {
                let p = params::<EchoParams>("echo", args)?;
                let frame = RawFrame::new(OpCode::Text.as_u8(), Bytes::from(p.payload));
                Ok(Command::Echo(repeated("echo", frame, p.payload_len)?))
            }
            _ => Err(ProtocolStimulusError::UnknownCommand(name)),
        }
    }

    pub fn execute(self, conn: &mut dyn Connection) {
        match self {
            Command::SendFrames(frames) => {
                for frame in frames {
                    conn.send_frame(frame);
                }
            }
            Command::Close { code, reason } => {
                let reason = reason.unwrap_or_default();
                conn.send_close(code, reason.as_bytes());
            }
            Command::Echo(frame) => conn.send_frame(frame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Recorded, RecordingConnection};

    #[test]
    fn test_sendframe_defaults() {
        let cmd = Command::parse(br#"["sendframe", {"opcode": 1, "payload": "Hello"}]"#, false).unwrap();
        assert_eq!(cmd, Command::SendFrames(vec![RawFrame::text("Hello")]));
    }

    #[test]
    fn test_sendframe_overrides() {
        let cmd = Command::parse(
            br#"["sendframe", {"opcode": 9, "payload": "ab", "fin": false, "rsv": 3,
                "mask": "abcd", "payload_len": 5, "chopsize": 1, "sync": true}]"#,
            false,
        )
        .unwrap();
        let Command::SendFrames(frames) = cmd else {
            panic!("expected frames");
        };
        let f = &frames[0];
        assert_eq!((f.opcode, f.fin, f.rsv), (9, false, 3));
        assert_eq!(f.mask, Some(*b"abcd"));
        assert_eq!(f.effective_payload(), Bytes::from_static(b"ababa"));
        assert_eq!(f.chopsize, Some(1));
        assert!(f.sync);
    }

    #[test]
    fn test_sendframes_and_mask_array() {
        let cmd = Command::parse(
            br#"["sendframes", [{"opcode": 1, "fin": false}, {"opcode": 0, "mask": [1, 2, 3, 4]}]]"#,
            false,
        )
        .unwrap();
        let Command::SendFrames(frames) = cmd else {
            panic!("expected frames");
        };
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].mask, Some([1, 2, 3, 4]));
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            Command::parse(b"[]", true),
            Err(ProtocolStimulusError::BinaryCommand)
        );
        assert!(matches!(
            Command::parse(b"not json", false),
            Err(ProtocolStimulusError::Unparseable(_))
        ));
        assert_eq!(
            Command::parse(br#"["explode", {}]"#, false),
            Err(ProtocolStimulusError::UnknownCommand("explode".into()))
        );
        assert_eq!(
            Command::parse(br#"["sendframe", {"payload": "x"}]"#, false),
            Err(ProtocolStimulusError::MissingField {
                command: "sendframe",
                field: "opcode"
            })
        );
        assert!(matches!(
            Command::parse(br#"["sendframe", {"opcode": 1, "mask": "abc"}]"#, false),
            Err(ProtocolStimulusError::InvalidField { field: "mask", .. })
        ));
        assert!(matches!(
            Command::parse(br#"["echo", {"payload_len": 10}]"#, false),
            Err(ProtocolStimulusError::InvalidField { field: "payload_len", .. })
        ));
    }

    #[test]
    fn test_execute_close_and_echo() {
        let mut conn = RecordingConnection::new(true);
        Command::parse(br#"["echo", {"payload": "*", "payload_len": 3}]"#, false)
            .unwrap()
            .execute(&mut conn);
        Command::parse(br#"["close", {"code": 1000, "reason": "done"}]"#, false)
            .unwrap()
            .execute(&mut conn);
        let calls = conn.take();
        assert_eq!(calls.len(), 2);
        assert!(matches!(&calls[0], Recorded::Frame(f) if f.effective_payload() == Bytes::from_static(b"***")));
        assert!(matches!(&calls[1], Recorded::Close { code: Some(1000), .. }));
    }
}
