//! # Media Relay
//!
//! Low-latency live stream relay for bonded field uplinks.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                                  INGEST                                      │
//! │                                                                             │
//! │   Caller / Listener / Multi                         Pull source             │
//! │  ┌─────────────────────────────────────┐       ┌─────────────────────┐     │
//! │  │  Ingest Manager (ingest::session)   │       │ Pull (ingest::pull) │     │
//! │  │  readiness wait ─ accept ─ route    │       │ video packets only  │     │
//! │  │  session ──► egress peer map        │       │ one reconnect try   │     │
//! │  └──────────────────┬──────────────────┘       └──────────┬──────────┘     │
//! │                     │  ▲ set_active_output                 │                │
//! └─────────────────────┼──┼───────────────────────────────────┼────────────────┘
//!                       │  │                                   │
//!                       │  └─────────────┐                     │
//!                       ▼                │                     ▼
//! ┌──────────────────────────────────────┼──────────────────────────────────────┐
//! │                                 EGRESS                                       │
//! │  ┌──────────────┐   ┌──────────────┐ │ ┌──────────────┐                      │
//! │  │ Egress Peer 0│   │ Egress Peer 1│ │ │ Egress Peer N│   (egress)           │
//! │  │ housekeeping │   │ housekeeping │ │ │ housekeeping │                      │
//! │  │   thread     │   │   thread     │ │ │   thread     │                      │
//! │  └──────┬───────┘   └──────┬───────┘ │ └──────┬───────┘                      │
//! │         │ stats            │ stats   │        │ stats                        │
//! │         ▼                  ▼         │        ▼                              │
//! │  ┌──────────────┐   ┌──────────────┐ │ ┌──────────────┐                      │
//! │  │  Feedback    │   │  Feedback    │ │ │  Feedback    │   (feedback)         │
//! │  │  Controller  │   │  Controller  │ │ │  Controller  │ ──► encoder (UDP)    │
//! │  └──────────────┘   └──────────────┘ │ └──────────────┘                      │
//! └──────────────────────────────────────┼──────────────────────────────────────┘
//!                                        │
//!                      latest samples    │ once per second
//!                  ┌─────────────────────┴──┐
//!                  │  Failover (failover)   │
//!                  └────────────────────────┘
//! ```

pub mod config;
pub mod egress;
pub mod error;
pub mod failover;
pub mod feedback;
pub mod ingest;
pub mod net;
pub mod relay;
pub mod stats;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Ingest receive buffer (100 max-size transport segments)
    pub const INGEST_BUFFER_SIZE: usize = 1456 * 100;

    /// Messages buffered per ingest session before backpressure or drops
    pub const SESSION_QUEUE_DEPTH: usize = 100;

    /// Caller-mode connect timeout
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Upper bound on one readiness wait
    pub const POLL_TIMEOUT: Duration = Duration::from_millis(10);

    /// Default caller-mode port when the URL has none
    pub const DEFAULT_CALLER_PORT: u16 = 1234;

    /// Default transport latency in milliseconds
    pub const DEFAULT_LATENCY_MS: u64 = 200;

    /// Listener accept backlog
    pub const LISTEN_BACKLOG: u32 = 5;

    /// Silence after which an ingest session counts as lost
    pub const DEFAULT_PEER_IDLE_TIMEOUT_MS: u64 = 5000;

    /// Egress statistics callback period
    pub const DEFAULT_STATS_INTERVAL_MS: u64 = 1000;

    /// Egress housekeeping cadence
    pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(10);

    /// Stream id for all egress writes
    pub const EGRESS_STREAM_ID: u16 = 0;

    /// Minimum spacing between failover evaluations
    pub const FAILOVER_CHECK_INTERVAL: Duration = Duration::from_secs(1);

    /// Pull source connect and read timeout
    pub const PULL_TIMEOUT: Duration = Duration::from_secs(5);

    /// Binding placeholder resolved from WAN interfaces
    pub const AUTO_INTERFACE: &str = "auto";

    pub const DEFAULT_FEEDBACK_IP: &str = "192.168.1.50";
    pub const DEFAULT_FEEDBACK_PORT: u16 = 5005;

    /// Loss change (percent points) that triggers a feedback send
    pub const FEEDBACK_LOSS_THRESHOLD: f32 = 0.1;

    /// RTT change (ms) that triggers a feedback send
    pub const FEEDBACK_RTT_THRESHOLD_MS: i64 = 5;

    /// Bitrate hint change (kbps) that triggers a feedback send
    pub const FEEDBACK_BITRATE_THRESHOLD_KBPS: i64 = 100;

    /// Largest datagram read from the wire
    pub const MAX_DATAGRAM_SIZE: usize = 65_536;
}
