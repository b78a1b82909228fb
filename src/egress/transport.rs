//! Egress transport seam
//!
//! An [`EgressBackend`] hands out one [`EgressContext`] per peer. The context
//! owns the sender-side transport state and pushes statistics records
//! through the registered callback from inside `housekeeping`.

use std::sync::Arc;
use std::time::Duration;

use crate::error::EgressError;
use crate::stats::TransportStats;

/// Statistics callback registered on a context
pub type StatsCallback = Arc<dyn Fn(&TransportStats) + Send + Sync>;

/// Factory for per-peer sender contexts
pub trait EgressBackend: Send + Sync {
    fn create_context(&self) -> Result<Box<dyn EgressContext>, EgressError>;
}

/// Sender-side state for one remote peer
pub trait EgressContext: Send {
    /// Register the statistics callback, invoked at most once per `interval`
    fn set_stats_callback(&mut self, interval: Duration, callback: StatsCallback) -> Result<(), EgressError>;

    /// Connect the remote peer described by `url` (`scheme://host:port`)
    fn create_peer(&mut self, url: &str) -> Result<(), EgressError>;

    /// Drive periodic work: authentication, retransmission, statistics
    fn housekeeping(&mut self) -> Result<(), EgressError>;

    /// Submit one data unit on `stream_id`
    fn write(&mut self, data: &[u8], stream_id: u16) -> Result<usize, EgressError>;

    /// Tear down the remote peer; must tolerate being called without a peer
    fn destroy_peer(&mut self);
}
