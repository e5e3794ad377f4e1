//! Raw WebSocket frame encoding and decoding
//!
//! Unlike a conformant library codec, this module lets every header field be
//! set independently: reserved opcodes, reserved bits, a declared payload
//! length that disagrees with the real payload, explicit mask keys. The
//! parser is equally lenient; it reports headers exactly as received and
//! leaves protocol validation to the session layer.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::mask::{apply_mask, apply_mask_offset};

/// Maximum payload length of a control frame
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket opcodes defined by RFC 6455
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    /// Decode a defined opcode; reserved values yield `None`
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a control frame opcode
    #[inline]
    pub fn is_control(self) -> bool {
        is_control_opcode(self as u8)
    }
}

/// Control opcodes have the high bit of the nibble set, reserved ones included
#[inline]
pub fn is_control_opcode(raw: u8) -> bool {
    raw & 0x08 != 0
}

/// Opcodes 3-7 and 11-15 are reserved by RFC 6455
#[inline]
pub fn is_reserved_opcode(raw: u8) -> bool {
    matches!(raw & 0x0F, 0x3..=0x7 | 0xB..=0xF)
}

/// Frame header with raw field values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    /// RSV1..RSV3 as a 3-bit value (RSV1 is 4)
    pub rsv: u8,
    /// Raw 4-bit opcode
    pub opcode: u8,
    pub mask: Option<[u8; 4]>,
    /// Length announced in the header
    pub payload_len: u64,
}

impl FrameHeader {
    pub fn new(opcode: OpCode, fin: bool, payload_len: u64) -> Self {
        Self {
            fin,
            rsv: 0,
            opcode: opcode.as_u8(),
            mask: None,
            payload_len,
        }
    }

    #[inline]
    pub fn rsv1(&self) -> bool {
        self.rsv & 0x4 != 0
    }

    #[inline]
    pub fn is_control(&self) -> bool {
        is_control_opcode(self.opcode)
    }

    /// Length of the encoded header in bytes
    pub fn encoded_len(&self) -> usize {
        let len_bytes = match self.payload_len {
            0..=125 => 0,
            126..=0xFFFF => 2,
            _ => 8,
        };
        2 + len_bytes + if self.mask.is_some() { 4 } else { 0 }
    }

    /// Encode the header (no payload)
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());

        let b0 = (u8::from(self.fin) << 7) | ((self.rsv & 0x7) << 4) | (self.opcode & 0x0F);
        dst.put_u8(b0);

        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };
        match self.payload_len {
            len @ 0..=125 => dst.put_u8(mask_bit | len as u8),
            len @ 126..=0xFFFF => {
                dst.put_u8(mask_bit | 126);
                dst.put_u16(len as u16);
            }
            len => {
                dst.put_u8(mask_bit | 127);
                dst.put_u64(len);
            }
        }

        if let Some(mask) = self.mask {
            dst.put_slice(&mask);
        }
    }
}

/// Outgoing frame with every wire attribute overridable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub opcode: u8,
    pub fin: bool,
    pub rsv: u8,
    pub payload: Bytes,
    /// Explicit mask key; `None` means the role default
    pub mask: Option<[u8; 4]>,
    /// Declared payload length, if different from the real one
    pub payload_len: Option<u64>,
    /// Repeat the payload cyclically up to this many octets
    pub repeat_len: Option<usize>,
    /// Split the encoded frame into writes of this size
    pub chopsize: Option<usize>,
    /// Flush the frame to the socket before anything else is queued
    pub sync: bool,
}

impl RawFrame {
    pub fn new(opcode: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            fin: true,
            rsv: 0,
            payload: payload.into(),
            mask: None,
            payload_len: None,
            repeat_len: None,
            chopsize: None,
            sync: false,
        }
    }

    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text.as_u8(), payload)
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary.as_u8(), payload)
    }

    pub fn continuation(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Continuation.as_u8(), payload)
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping.as_u8(), payload)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong.as_u8(), payload)
    }

    /// Close frame with an optional status code and reason
    pub fn close(code: Option<u16>, reason: &[u8]) -> Self {
        let mut payload = BytesMut::new();
        if let Some(code) = code {
            payload.put_u16(code);
            payload.put_slice(reason);
        }
        Self::new(OpCode::Close.as_u8(), payload.freeze())
    }

    pub fn fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    pub fn rsv(mut self, rsv: u8) -> Self {
        self.rsv = rsv;
        self
    }

    pub fn mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn payload_len(mut self, len: u64) -> Self {
        self.payload_len = Some(len);
        self
    }

    pub fn repeat(mut self, len: usize) -> Self {
        self.repeat_len = Some(len);
        self
    }

    pub fn chop(mut self, size: usize) -> Self {
        self.chopsize = Some(size);
        self
    }

    pub fn sync(mut self) -> Self {
        self.sync = true;
        self
    }

    /// Payload as it will appear on the wire, before masking
    pub fn effective_payload(&self) -> Bytes {
        match self.repeat_len {
            Some(len) if !self.payload.is_empty() && len != self.payload.len() => {
                let mut out = BytesMut::with_capacity(len);
                while out.len() < len {
                    let take = (len - out.len()).min(self.payload.len());
                    out.put_slice(&self.payload[..take]);
                }
                out.freeze()
            }
            Some(0) => Bytes::new(),
            _ => self.payload.clone(),
        }
    }

    /// Header for this frame, using `mask` when no explicit key is set
    pub fn header(&self, default_mask: Option<[u8; 4]>) -> FrameHeader {
        let payload_len = self
            .payload_len
            .unwrap_or_else(|| self.effective_payload().len() as u64);
        FrameHeader {
            fin: self.fin,
            rsv: self.rsv & 0x7,
            opcode: self.opcode & 0x0F,
            mask: self.mask.or(default_mask),
            payload_len,
        }
    }
}

/// Encode a header followed by its (masked, if keyed) payload
pub fn encode_frame(header: &FrameHeader, payload: &[u8], dst: &mut BytesMut) {
    header.encode(dst);
    let start = dst.len();
    dst.put_slice(payload);
    if let Some(mask) = header.mask {
        apply_mask(&mut dst[start..], mask);
    }
}

/// Split encoded octets into chunks of `chopsize` bytes
pub fn chop(data: Bytes, chopsize: Option<usize>) -> Vec<Bytes> {
    match chopsize {
        Some(size) if size > 0 && data.len() > size => {
            let mut chunks = Vec::with_capacity(data.len().div_ceil(size));
            let mut rest = data;
            while rest.len() > size {
                chunks.push(rest.split_to(size));
            }
            chunks.push(rest);
            chunks
        }
        _ => vec![data],
    }
}

/// A decoded frame with its payload unmasked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Header,
    ExtendedLength {
        fin: bool,
        rsv: u8,
        opcode: u8,
        masked: bool,
        bytes_needed: usize,
    },
    MaskKey {
        fin: bool,
        rsv: u8,
        opcode: u8,
        payload_len: u64,
    },
    Payload {
        fin: bool,
        rsv: u8,
        opcode: u8,
        mask: Option<[u8; 4]>,
        payload_len: u64,
    },
}

/// Streaming frame parser
///
/// Consumes complete frames from the front of a buffer; partial input stays
/// buffered and `parse` returns `Ok(None)` until more arrives.
#[derive(Debug)]
pub struct FrameParser {
    state: DecodeState,
    max_payload: u64,
}

impl FrameParser {
    pub fn new(max_payload: usize) -> Self {
        Self {
            state: DecodeState::Header,
            max_payload: max_payload as u64,
        }
    }

    pub fn parse(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let b0 = src[0];
                    let b1 = src[1];
                    let _ = src.split_to(2);

                    let fin = b0 & 0x80 != 0;
                    let rsv = (b0 >> 4) & 0x7;
                    let opcode = b0 & 0x0F;
                    let masked = b1 & 0x80 != 0;

                    self.state = match b1 & 0x7F {
                        126 => DecodeState::ExtendedLength {
                            fin,
                            rsv,
                            opcode,
                            masked,
                            bytes_needed: 2,
                        },
                        127 => DecodeState::ExtendedLength {
                            fin,
                            rsv,
                            opcode,
                            masked,
                            bytes_needed: 8,
                        },
                        len => self.after_length(fin, rsv, opcode, masked, u64::from(len))?,
                    };
                }

                DecodeState::ExtendedLength {
                    fin,
                    rsv,
                    opcode,
                    masked,
                    bytes_needed,
                } => {
                    if src.len() < bytes_needed {
                        return Ok(None);
                    }
                    let bytes = src.split_to(bytes_needed);
                    let payload_len = if bytes_needed == 2 {
                        u64::from(u16::from_be_bytes([bytes[0], bytes[1]]))
                    } else {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(&bytes);
                        u64::from_be_bytes(raw)
                    };
                    self.state = self.after_length(fin, rsv, opcode, masked, payload_len)?;
                }

                DecodeState::MaskKey {
                    fin,
                    rsv,
                    opcode,
                    payload_len,
                } => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let key = src.split_to(4);
                    self.state = DecodeState::Payload {
                        fin,
                        rsv,
                        opcode,
                        mask: Some([key[0], key[1], key[2], key[3]]),
                        payload_len,
                    };
                }

                DecodeState::Payload {
                    fin,
                    rsv,
                    opcode,
                    mask,
                    payload_len,
                } => {
                    let len = payload_len as usize;
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }
                    let mut payload = src.split_to(len);
                    if let Some(key) = mask {
                        apply_mask_offset(&mut payload, key, 0);
                    }
                    self.state = DecodeState::Header;
                    return Ok(Some(Frame {
                        header: FrameHeader {
                            fin,
                            rsv,
                            opcode,
                            mask,
                            payload_len,
                        },
                        payload: payload.freeze(),
                    }));
                }
            }
        }
    }

    fn after_length(
        &mut self,
        fin: bool,
        rsv: u8,
        opcode: u8,
        masked: bool,
        payload_len: u64,
    ) -> Result<DecodeState> {
        if payload_len > self.max_payload {
            self.state = DecodeState::Header;
            return Err(Error::FrameTooLarge);
        }
        Ok(if masked {
            DecodeState::MaskKey {
                fin,
                rsv,
                opcode,
                payload_len,
            }
        } else {
            DecodeState::Payload {
                fin,
                rsv,
                opcode,
                mask: None,
                payload_len,
            }
        })
    }
}
