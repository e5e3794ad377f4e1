//! permessage-deflate negotiation and codec (RFC 7692)
//!
//! This module provides:
//! - **Offers**: what a client proposes in `Sec-WebSocket-Extensions`
//! - **Accept rules**: data-driven server policies for choosing an offer
//! - **Responses**: the parameters a server returned to a client
//! - **Codec**: raw deflate with context takeover and window bits via `flate2`
//!
//! The compression cases negotiate with deliberately varied parameters, so
//! both sides of the negotiation are exposed as plain values rather than
//! hidden in a connection builder.

use std::fmt;

use bytes::Bytes;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};

/// Extension token
pub const EXTENSION_NAME: &str = "permessage-deflate";

/// Trailer removed from each compressed message (RFC 7692 section 7.2.1)
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Largest LZ77 window
pub const MAX_WINDOW_BITS: u8 = 15;
/// Smallest window the protocol allows
pub const MIN_WINDOW_BITS: u8 = 8;
/// Smallest window the raw-deflate codec supports
const MIN_CODEC_WINDOW_BITS: u8 = 9;

/// One extension entry from a `Sec-WebSocket-Extensions` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionEntry {
    pub name: String,
    pub params: Vec<(String, Option<String>)>,
}

/// Parse a `Sec-WebSocket-Extensions` header value
///
/// Entries are comma-separated, parameters semicolon-separated; quoted
/// parameter values are unquoted.
pub fn parse_extensions(header: &str) -> Vec<ExtensionEntry> {
    header
        .split(',')
        .filter_map(|entry| {
            let mut parts = entry.split(';').map(str::trim);
            let name = parts.next().filter(|n| !n.is_empty())?.to_ascii_lowercase();
            let params = parts
                .filter(|p| !p.is_empty())
                .map(|p| match p.split_once('=') {
                    Some((k, v)) => (
                        k.trim().to_ascii_lowercase(),
                        Some(v.trim().trim_matches('"').to_string()),
                    ),
                    None => (p.to_ascii_lowercase(), None),
                })
                .collect();
            Some(ExtensionEntry { name, params })
        })
        .collect()
}

fn parse_window_bits(value: &str) -> Result<u8> {
    value
        .parse::<u8>()
        .ok()
        .filter(|bits| (MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(bits))
        .ok_or(Error::HandshakeFailed(format!(
            "invalid permessage-deflate window bits '{}'",
            value
        )))
}

// ============================================================================
// Client offers
// ============================================================================

/// A permessage-deflate offer made by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerMessageDeflateOffer {
    /// Client is willing to drop its compression context per message
    pub accept_no_context_takeover: bool,
    /// Client is willing to use a smaller window than 15 bits
    pub accept_max_window_bits: bool,
    /// Ask the server to drop its compression context per message
    pub request_no_context_takeover: bool,
    /// Ask the server to limit its window (0 = no request)
    pub request_max_window_bits: u8,
}

impl Default for PerMessageDeflateOffer {
    fn default() -> Self {
        Self {
            accept_no_context_takeover: true,
            accept_max_window_bits: true,
            request_no_context_takeover: false,
            request_max_window_bits: 0,
        }
    }
}

impl PerMessageDeflateOffer {
    pub fn new(request_no_context_takeover: bool, request_max_window_bits: u8) -> Self {
        Self {
            request_no_context_takeover,
            request_max_window_bits,
            ..Self::default()
        }
    }

    /// Build an offer from a parsed extension entry (server side)
    pub fn from_entry(entry: &ExtensionEntry) -> Result<Self> {
        if entry.name != EXTENSION_NAME {
            return Err(Error::HandshakeFailed(format!(
                "not a {} offer: {}",
                EXTENSION_NAME, entry.name
            )));
        }
        let mut offer = Self {
            accept_no_context_takeover: false,
            accept_max_window_bits: false,
            request_no_context_takeover: false,
            request_max_window_bits: 0,
        };
        for (key, value) in &entry.params {
            match (key.as_str(), value.as_deref()) {
                ("client_max_window_bits", None) => offer.accept_max_window_bits = true,
                ("client_max_window_bits", Some(v)) => {
                    parse_window_bits(v)?;
                    offer.accept_max_window_bits = true;
                }
                ("client_no_context_takeover", None) => offer.accept_no_context_takeover = true,
                ("server_max_window_bits", Some(v)) => {
                    offer.request_max_window_bits = parse_window_bits(v)?
                }
                ("server_no_context_takeover", None) => offer.request_no_context_takeover = true,
                _ => {
                    return Err(Error::HandshakeFailed(format!(
                        "illegal permessage-deflate offer parameter '{}'",
                        key
                    )))
                }
            }
        }
        Ok(offer)
    }

    /// Extension entry text for the opening handshake request
    pub fn to_header_value(&self) -> String {
        let mut out = String::from(EXTENSION_NAME);
        if self.accept_no_context_takeover {
            out.push_str("; client_no_context_takeover");
        }
        if self.accept_max_window_bits {
            out.push_str("; client_max_window_bits");
        }
        if self.request_no_context_takeover {
            out.push_str("; server_no_context_takeover");
        }
        if self.request_max_window_bits != 0 {
            out.push_str(&format!(
                "; server_max_window_bits={}",
                self.request_max_window_bits
            ));
        }
        out
    }
}

/// Parse every permessage-deflate offer in a request header, skipping
/// entries for other extensions and offers with illegal parameters
pub fn parse_offers(header: &str) -> Vec<PerMessageDeflateOffer> {
    parse_extensions(header)
        .iter()
        .filter(|e| e.name == EXTENSION_NAME)
        .filter_map(|e| PerMessageDeflateOffer::from_entry(e).ok())
        .collect()
}

// ============================================================================
// Server acceptance
// ============================================================================

/// One server acceptance preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcceptRule {
    /// Ask the client to drop its context (needs `accept_no_context_takeover`)
    pub request_no_context_takeover: bool,
    /// Ask the client to limit its window (needs `accept_max_window_bits`)
    pub request_max_window_bits: u8,
}

impl AcceptRule {
    pub const fn new(request_no_context_takeover: bool, request_max_window_bits: u8) -> Self {
        Self {
            request_no_context_takeover,
            request_max_window_bits,
        }
    }

    fn admits(&self, offer: &PerMessageDeflateOffer) -> bool {
        (!self.request_no_context_takeover || offer.accept_no_context_takeover)
            && (self.request_max_window_bits == 0 || offer.accept_max_window_bits)
    }
}

/// A server's acceptance of one client offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerMessageDeflateAccept {
    pub offer: PerMessageDeflateOffer,
    pub rule: AcceptRule,
}

impl PerMessageDeflateAccept {
    /// Try the rules in order, each against every offer in order
    pub fn choose(rules: &[AcceptRule], offers: &[PerMessageDeflateOffer]) -> Option<Self> {
        rules.iter().find_map(|rule| {
            offers.iter().find(|o| rule.admits(o)).map(|offer| Self {
                offer: *offer,
                rule: *rule,
            })
        })
    }

    /// Extension entry text for the handshake response
    pub fn to_header_value(&self) -> String {
        let mut out = String::from(EXTENSION_NAME);
        if self.offer.request_no_context_takeover {
            out.push_str("; server_no_context_takeover");
        }
        if self.offer.request_max_window_bits != 0 {
            out.push_str(&format!(
                "; server_max_window_bits={}",
                self.offer.request_max_window_bits
            ));
        }
        if self.rule.request_no_context_takeover {
            out.push_str("; client_no_context_takeover");
        }
        if self.rule.request_max_window_bits != 0 {
            out.push_str(&format!(
                "; client_max_window_bits={}",
                self.rule.request_max_window_bits
            ));
        }
        out
    }

    /// Parameters in effect on the server side of the connection
    pub fn params(&self) -> DeflateParams {
        DeflateParams {
            server_no_context_takeover: self.offer.request_no_context_takeover,
            server_max_window_bits: self.offer.request_max_window_bits,
            client_no_context_takeover: self.rule.request_no_context_takeover,
            client_max_window_bits: self.rule.request_max_window_bits,
        }
    }
}

/// Parse the server's permessage-deflate response (client side)
pub fn parse_response(header: &str) -> Result<Option<DeflateParams>> {
    let Some(entry) = parse_extensions(header)
        .into_iter()
        .find(|e| e.name == EXTENSION_NAME)
    else {
        return Ok(None);
    };

    let mut params = DeflateParams::default();
    for (key, value) in &entry.params {
        match (key.as_str(), value.as_deref()) {
            ("server_no_context_takeover", None) => params.server_no_context_takeover = true,
            ("client_no_context_takeover", None) => params.client_no_context_takeover = true,
            ("server_max_window_bits", Some(v)) => params.server_max_window_bits = parse_window_bits(v)?,
            ("client_max_window_bits", Some(v)) => params.client_max_window_bits = parse_window_bits(v)?,
            _ => {
                return Err(Error::HandshakeFailed(format!(
                    "illegal permessage-deflate response parameter '{}'",
                    key
                )))
            }
        }
    }
    Ok(Some(params))
}

// ============================================================================
// Negotiated parameters and codec
// ============================================================================

/// Parameters in effect once permessage-deflate is negotiated
///
/// Window bits of 0 mean the default of 15.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeflateParams {
    pub server_no_context_takeover: bool,
    pub server_max_window_bits: u8,
    pub client_no_context_takeover: bool,
    pub client_max_window_bits: u8,
}

impl fmt::Display for DeflateParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "server(no_context_takeover={}, max_window_bits={}) client(no_context_takeover={}, max_window_bits={})",
            self.server_no_context_takeover,
            effective_bits(self.server_max_window_bits),
            self.client_no_context_takeover,
            effective_bits(self.client_max_window_bits),
        )
    }
}

fn effective_bits(bits: u8) -> u8 {
    if bits == 0 {
        MAX_WINDOW_BITS
    } else {
        bits
    }
}

fn codec_bits(bits: u8) -> u8 {
    effective_bits(bits).clamp(MIN_CODEC_WINDOW_BITS, MAX_WINDOW_BITS)
}

/// Per-connection permessage-deflate codec
pub struct DeflateCodec {
    compressor: Compress,
    decompressor: Decompress,
    reset_compressor: bool,
    reset_decompressor: bool,
    params: DeflateParams,
}

impl fmt::Debug for DeflateCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeflateCodec")
            .field("params", &self.params)
            .finish()
    }
}

impl DeflateCodec {
    /// Create the codec for one endpoint of a negotiated connection
    pub fn new(params: DeflateParams, is_server: bool) -> Self {
        let (own_bits, own_reset, peer_reset) = if is_server {
            (
                params.server_max_window_bits,
                params.server_no_context_takeover,
                params.client_no_context_takeover,
            )
        } else {
            (
                params.client_max_window_bits,
                params.client_no_context_takeover,
                params.server_no_context_takeover,
            )
        };

        Self {
            compressor: Compress::new_with_window_bits(
                Compression::default(),
                false,
                codec_bits(own_bits),
            ),
            // Inflating with the largest window accepts any smaller one
            decompressor: Decompress::new_with_window_bits(false, codec_bits(0)),
            reset_compressor: own_reset,
            reset_decompressor: peer_reset,
            params,
        }
    }

    pub fn params(&self) -> &DeflateParams {
        &self.params
    }

    /// Compress one whole message payload
    pub fn compress(&mut self, data: &[u8]) -> Result<Bytes> {
        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        let start = self.compressor.total_in();

        loop {
            let consumed = (self.compressor.total_in() - start) as usize;
            if out.capacity() - out.len() < 64 {
                out.reserve(out.capacity().max(1024));
            }
            let before_out = self.compressor.total_out();
            self.compressor
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| Error::Compression(e.to_string()))?;
            let consumed = (self.compressor.total_in() - start) as usize;
            if consumed == data.len() && out.len() < out.capacity() {
                break;
            }
            if consumed == data.len() && self.compressor.total_out() == before_out {
                break;
            }
        }

        if out.ends_with(&DEFLATE_TRAILER) {
            out.truncate(out.len() - DEFLATE_TRAILER.len());
        }
        if self.reset_compressor {
            self.compressor.reset();
        }
        Ok(Bytes::from(out))
    }

    /// Decompress one whole message payload, refusing to grow past `max_size`
    pub fn decompress(&mut self, data: &[u8], max_size: usize) -> Result<Bytes> {
        let mut input = Vec::with_capacity(data.len() + DEFLATE_TRAILER.len());
        input.extend_from_slice(data);
        input.extend_from_slice(&DEFLATE_TRAILER);

        let mut out = Vec::with_capacity((data.len() * 3).clamp(64, max_size.max(64)));
        let start = self.decompressor.total_in();

        loop {
            let consumed = (self.decompressor.total_in() - start) as usize;
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(1024));
            }
            let before_in = self.decompressor.total_in();
            let before_out = self.decompressor.total_out();
            let status = self
                .decompressor
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| Error::Compression(e.to_string()))?;

            if out.len() > max_size {
                return Err(Error::Compression(format!(
                    "decompressed message exceeds {} bytes",
                    max_size
                )));
            }
            let consumed = (self.decompressor.total_in() - start) as usize;
            if status == Status::StreamEnd {
                break;
            }
            if consumed == input.len() && out.len() < out.capacity() {
                break;
            }
            if self.decompressor.total_in() == before_in && self.decompressor.total_out() == before_out
            {
                if consumed == input.len() {
                    break;
                }
                return Err(Error::Compression("truncated deflate stream".into()));
            }
        }

        if self.reset_decompressor {
            self.decompressor.reset(false);
        }
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        br#"{"id": 1, "name": "autobahn", "tags": ["ws", "deflate", "fuzzing"]} "#.repeat(40)
    }

    #[test]
    fn test_parse_extensions() {
        let entries = parse_extensions(
            "permessage-deflate; client_max_window_bits; server_max_window_bits=\"10\", x-webkit-deflate-frame",
        );
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "permessage-deflate");
        assert_eq!(
            entries[0].params,
            vec![
                ("client_max_window_bits".to_string(), None),
                ("server_max_window_bits".to_string(), Some("10".to_string())),
            ]
        );
        assert_eq!(entries[1].name, "x-webkit-deflate-frame");
    }

    #[test]
    fn test_offer_header_round_trip() {
        let offer = PerMessageDeflateOffer::new(true, 8);
        let parsed = parse_offers(&offer.to_header_value());
        assert_eq!(parsed, vec![offer]);
        assert_eq!(
            PerMessageDeflateOffer::default().to_header_value(),
            "permessage-deflate; client_no_context_takeover; client_max_window_bits"
        );
    }

    #[test]
    fn test_illegal_offer_is_skipped() {
        let offers = parse_offers("permessage-deflate; bogus, permessage-deflate");
        assert_eq!(offers.len(), 1);
        assert!(!offers[0].accept_max_window_bits);
        assert!(parse_offers("permessage-deflate; server_max_window_bits=7").is_empty());
    }

    #[test]
    fn test_accept_rules_in_order() {
        let offers = [
            PerMessageDeflateOffer::new(true, 8),
            PerMessageDeflateOffer::new(true, 0),
            PerMessageDeflateOffer::default(),
        ];
        let rules = [
            AcceptRule::new(true, 8),
            AcceptRule::new(true, 0),
            AcceptRule::new(false, 0),
        ];
        let accept = PerMessageDeflateAccept::choose(&rules, &offers).unwrap();
        assert_eq!(accept.offer, offers[0]);
        assert_eq!(accept.rule, rules[0]);
        assert_eq!(
            accept.to_header_value(),
            "permessage-deflate; server_no_context_takeover; server_max_window_bits=8; client_no_context_takeover; client_max_window_bits=8"
        );
    }

    #[test]
    fn test_accept_needs_client_consent() {
        let offer = PerMessageDeflateOffer {
            accept_no_context_takeover: false,
            ..PerMessageDeflateOffer::default()
        };
        assert!(PerMessageDeflateAccept::choose(&[AcceptRule::new(true, 0)], &[offer]).is_none());
        assert!(PerMessageDeflateAccept::choose(&[AcceptRule::new(false, 0)], &[offer]).is_some());
    }

    #[test]
    fn test_response_matches_accept() {
        let accept = PerMessageDeflateAccept::choose(
            &[AcceptRule::new(true, 9)],
            &[PerMessageDeflateOffer::new(false, 12)],
        )
        .unwrap();
        let parsed = parse_response(&accept.to_header_value()).unwrap().unwrap();
        assert_eq!(parsed, accept.params());
        assert!(parse_response("x-other").unwrap().is_none());
        assert!(parse_response("permessage-deflate; nonsense").is_err());
    }

    #[test]
    fn test_codec_round_trip_with_context_takeover() {
        let params = DeflateParams::default();
        let mut server = DeflateCodec::new(params, true);
        let mut client = DeflateCodec::new(params, false);

        let data = sample();
        for _ in 0..3 {
            let compressed = server.compress(&data).unwrap();
            assert!(compressed.len() < data.len());
            let restored = client.decompress(&compressed, 1 << 20).unwrap();
            assert_eq!(&restored[..], &data[..]);
        }
    }

    #[test]
    fn test_codec_no_context_takeover_small_window() {
        let params = DeflateParams {
            server_no_context_takeover: true,
            server_max_window_bits: 8,
            client_no_context_takeover: true,
            client_max_window_bits: 9,
        };
        let mut server = DeflateCodec::new(params, true);
        let mut client = DeflateCodec::new(params, false);

        let data = sample();
        let first = client.compress(&data).unwrap();
        let second = client.compress(&data).unwrap();
        // Without context takeover both messages compress identically
        assert_eq!(first, second);
        assert_eq!(&server.decompress(&first, 1 << 20).unwrap()[..], &data[..]);
        assert_eq!(&server.decompress(&second, 1 << 20).unwrap()[..], &data[..]);
    }

    #[test]
    fn test_codec_empty_message() {
        let mut codec = DeflateCodec::new(DeflateParams::default(), false);
        let compressed = codec.compress(b"").unwrap();
        let mut peer = DeflateCodec::new(DeflateParams::default(), true);
        assert!(peer.decompress(&compressed, 1024).unwrap().is_empty());
    }

    #[test]
    fn test_decompress_limit() {
        let mut codec = DeflateCodec::new(DeflateParams::default(), true);
        let compressed = codec.compress(&vec![b'a'; 100_000]).unwrap();
        let mut peer = DeflateCodec::new(DeflateParams::default(), false);
        assert!(matches!(
            peer.decompress(&compressed, 1000),
            Err(Error::Compression(_))
        ));
    }
}
