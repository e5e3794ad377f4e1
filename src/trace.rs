//! Per-connection wire trace and traffic statistics
//!
//! Every octet chunk and frame that crosses the socket is counted in the
//! histograms. The structured event log can be switched off (compression
//! cases silence their bulk traffic), but statistics keep counting and a
//! [`WireEvent::WireLogToggled`] marker records each switch. Timer events
//! are always logged so races between timers and teardown stay visible.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::frame::FrameHeader;

/// Maximum preview of a frame payload kept in the log
pub const MAX_WIRE_LOG_DATA: usize = 256;

/// Maximum preview of a raw octet chunk kept in the log
pub const OCTET_LOG_DATA: usize = 64;

const ELLIPSIS: &str = " ...";

/// Hex preview of binary data, truncated to `maxlen` bytes
pub fn bin_log_data(data: &[u8], maxlen: usize) -> String {
    let shown = &data[..data.len().min(maxlen)];
    let mut out = String::with_capacity(shown.len() * 2 + ELLIPSIS.len());
    for b in shown {
        let _ = write!(out, "{:02x}", b);
    }
    if data.len() > maxlen {
        out.push_str(ELLIPSIS);
    }
    out
}

/// Text preview of a payload, falling back to `0x`-prefixed hex when the
/// (possibly truncated) prefix is not valid UTF-8
pub fn ascii_log_data(data: &[u8], maxlen: usize) -> String {
    let keep = maxlen.saturating_sub(ELLIPSIS.len());
    let truncated = data.len() > keep;
    let shown = if truncated { &data[..keep] } else { data };
    match std::str::from_utf8(shown) {
        Ok(text) if truncated => format!("{}{}", text, ELLIPSIS),
        Ok(text) => text.to_string(),
        Err(_) => format!("0x{}", bin_log_data(data, maxlen)),
    }
}

/// One entry of the wire log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum WireEvent {
    OctetsRx {
        len: usize,
        preview: String,
    },
    OctetsTx {
        len: usize,
        preview: String,
        sync: bool,
    },
    FrameRx {
        len: usize,
        preview: String,
        opcode: u8,
        fin: bool,
        rsv: u8,
        masked: bool,
        mask: Option<String>,
    },
    FrameTx {
        len: usize,
        preview: String,
        opcode: u8,
        fin: bool,
        rsv: u8,
        mask: Option<String>,
        repeat_len: Option<usize>,
        chop_size: Option<usize>,
        sync: bool,
    },
    TimerArmed {
        delay_sec: f64,
        tag: String,
    },
    TimerFired {
        tag: String,
    },
    KillArmed {
        delay_sec: f64,
    },
    KillFired,
    CloseArmed {
        delay_sec: f64,
    },
    CloseFired,
    WireLogToggled {
        enabled: bool,
    },
}

/// Octet and frame histograms for one connection
///
/// Octet histograms are keyed by chunk length, frame histograms by opcode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficHistograms {
    pub rx_octets: BTreeMap<usize, u64>,
    pub tx_octets: BTreeMap<usize, u64>,
    pub rx_frames: BTreeMap<u8, u64>,
    pub tx_frames: BTreeMap<u8, u64>,
}

impl TrafficHistograms {
    /// Total octets received, recomputed from the histogram
    pub fn rx_total(&self) -> u64 {
        self.rx_octets.iter().map(|(len, n)| *len as u64 * n).sum()
    }

    /// Total octets sent, recomputed from the histogram
    pub fn tx_total(&self) -> u64 {
        self.tx_octets.iter().map(|(len, n)| *len as u64 * n).sum()
    }
}

/// Payload octets before and after permessage-deflate
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionStats {
    pub incoming_payload_octets: u64,
    pub incoming_wire_octets: u64,
    pub outgoing_payload_octets: u64,
    pub outgoing_wire_octets: u64,
}

impl CompressionStats {
    pub fn incoming_ratio(&self) -> Option<f64> {
        (self.incoming_payload_octets > 0)
            .then(|| self.incoming_wire_octets as f64 / self.incoming_payload_octets as f64)
    }

    pub fn outgoing_ratio(&self) -> Option<f64> {
        (self.outgoing_payload_octets > 0)
            .then(|| self.outgoing_wire_octets as f64 / self.outgoing_payload_octets as f64)
    }
}

/// Frozen trace contents handed to the case result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSnapshot {
    pub events: Vec<WireEvent>,
    pub histograms: TrafficHistograms,
    pub rx_octets_total: u64,
    pub tx_octets_total: u64,
}

/// Append-only wire log with always-on statistics
#[derive(Debug, Clone)]
pub struct WireTrace {
    enabled: bool,
    events: Vec<WireEvent>,
    histograms: TrafficHistograms,
    rx_total: u64,
    tx_total: u64,
    compression: CompressionStats,
}

impl Default for WireTrace {
    fn default() -> Self {
        Self::new()
    }
}

fn hex_mask(mask: Option<[u8; 4]>) -> Option<String> {
    mask.map(|m| bin_log_data(&m, 4))
}

impl WireTrace {
    pub fn new() -> Self {
        Self {
            enabled: true,
            events: Vec::new(),
            histograms: TrafficHistograms::default(),
            rx_total: 0,
            tx_total: 0,
            compression: CompressionStats::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Switch verbose logging; a marker is appended only on change
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled != self.enabled {
            self.enabled = enabled;
            self.events.push(WireEvent::WireLogToggled { enabled });
        }
    }

    pub fn log_rx(&mut self, data: &[u8]) {
        *self.histograms.rx_octets.entry(data.len()).or_default() += 1;
        self.rx_total += data.len() as u64;
        if self.enabled {
            self.events.push(WireEvent::OctetsRx {
                len: data.len(),
                preview: bin_log_data(data, OCTET_LOG_DATA),
            });
        }
    }

    pub fn log_tx(&mut self, data: &[u8], sync: bool) {
        *self.histograms.tx_octets.entry(data.len()).or_default() += 1;
        self.tx_total += data.len() as u64;
        if self.enabled {
            self.events.push(WireEvent::OctetsTx {
                len: data.len(),
                preview: bin_log_data(data, OCTET_LOG_DATA),
                sync,
            });
        }
    }

    pub fn log_rx_frame(&mut self, header: &FrameHeader, payload: &[u8]) {
        *self.histograms.rx_frames.entry(header.opcode).or_default() += 1;
        if self.enabled {
            self.events.push(WireEvent::FrameRx {
                len: payload.len(),
                preview: ascii_log_data(payload, MAX_WIRE_LOG_DATA),
                opcode: header.opcode,
                fin: header.fin,
                rsv: header.rsv,
                masked: header.mask.is_some(),
                mask: hex_mask(header.mask),
            });
        }
    }

    pub fn log_tx_frame(
        &mut self,
        header: &FrameHeader,
        payload: &[u8],
        repeat_len: Option<usize>,
        chop_size: Option<usize>,
        sync: bool,
    ) {
        *self.histograms.tx_frames.entry(header.opcode).or_default() += 1;
        if self.enabled {
            self.events.push(WireEvent::FrameTx {
                len: payload.len(),
                preview: ascii_log_data(payload, MAX_WIRE_LOG_DATA),
                opcode: header.opcode,
                fin: header.fin,
                rsv: header.rsv,
                mask: hex_mask(header.mask),
                repeat_len,
                chop_size,
                sync,
            });
        }
    }

    /// Record a timer event; these bypass the enable switch
    pub fn log_timer(&mut self, event: WireEvent) {
        self.events.push(event);
    }

    pub fn record_incoming_message(&mut self, payload_octets: usize, wire_octets: usize) {
        self.compression.incoming_payload_octets += payload_octets as u64;
        self.compression.incoming_wire_octets += wire_octets as u64;
    }

    pub fn record_outgoing_message(&mut self, payload_octets: usize, wire_octets: usize) {
        self.compression.outgoing_payload_octets += payload_octets as u64;
        self.compression.outgoing_wire_octets += wire_octets as u64;
    }

    pub fn compression_stats(&self) -> CompressionStats {
        self.compression
    }

    pub fn events(&self) -> &[WireEvent] {
        &self.events
    }

    pub fn histograms(&self) -> &TrafficHistograms {
        &self.histograms
    }

    pub fn snapshot(&self) -> TraceSnapshot {
        TraceSnapshot {
            events: self.events.clone(),
            histograms: self.histograms.clone(),
            rx_octets_total: self.rx_total,
            tx_octets_total: self.tx_total,
        }
    }
}
