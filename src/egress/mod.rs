//! Egress subsystem: outbound links to remote peers

pub mod peer;
pub mod transport;
pub mod udp;

pub use peer::{EgressOptions, EgressPeer, EgressStats};
pub use transport::{EgressBackend, EgressContext, StatsCallback};
pub use udp::UdpEgressBackend;
