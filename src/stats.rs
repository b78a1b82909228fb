//! Link quality samples reported by the egress transport

use serde::{Deserialize, Serialize};

/// Latest link-quality snapshot for one egress peer
///
/// `bitrate_avg` is in kbps, `packet_loss` in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualitySample {
    pub bitrate_avg: u32,
    pub packet_loss: f32,
    pub rtt_ms: u32,
}

impl QualitySample {
    pub fn new(bitrate_avg: u32, packet_loss: f32, rtt_ms: u32) -> Self {
        Self {
            bitrate_avg,
            packet_loss,
            rtt_ms,
        }
    }

    /// Whether this sample is within both path-switch thresholds
    pub fn within(&self, max_packet_loss: f32, max_rtt_ms: u32) -> bool {
        self.packet_loss <= max_packet_loss && self.rtt_ms <= max_rtt_ms
    }
}

/// Sender-side per-peer statistics record
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SenderPeerStats {
    /// Average send bitrate (kbps)
    pub bitrate_avg: u32,
    /// Link quality figure, read as packet loss percent
    pub quality: f32,
    /// Round-trip time (ms)
    pub rtt: u32,
}

/// Receiver-side per-flow statistics record
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReceiverFlowStats {
    pub bitrate_avg: u32,
    pub quality: f32,
    pub lost: u64,
}

/// Statistics records pushed by an egress transport
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransportStats {
    SenderPeer(SenderPeerStats),
    ReceiverFlow(ReceiverFlowStats),
}

impl TransportStats {
    /// Extract a quality sample from a sender-peer record; other kinds yield `None`
    pub fn sender_sample(&self) -> Option<QualitySample> {
        match self {
            TransportStats::SenderPeer(s) => Some(QualitySample::new(s.bitrate_avg, s.quality, s.rtt)),
            TransportStats::ReceiverFlow(_) => None,
        }
    }
}
