//! Plain UDP egress backend
//!
//! Sends each data unit as one datagram to the peer. There is no return
//! channel, so loss and RTT are always reported as zero; the bitrate is
//! measured locally over each statistics window.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use super::transport::{EgressBackend, EgressContext, StatsCallback};
use crate::error::EgressError;
use crate::net::parse_host_port;
use crate::stats::{SenderPeerStats, TransportStats};

/// Send buffer requested for egress sockets
const SEND_BUFFER_SIZE: usize = 1024 * 1024;

/// Backend producing [`UdpEgressContext`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpEgressBackend;

impl EgressBackend for UdpEgressBackend {
    fn create_context(&self) -> Result<Box<dyn EgressContext>, EgressError> {
        Ok(Box::new(UdpEgressContext::new()))
    }
}

/// One UDP "peer": a connected socket plus a bitrate window
pub struct UdpEgressContext {
    socket: Option<UdpSocket>,
    callback: Option<StatsCallback>,
    interval: Duration,
    window_start: Instant,
    window_bytes: u64,
}

impl UdpEgressContext {
    pub fn new() -> Self {
        Self {
            socket: None,
            callback: None,
            interval: Duration::from_secs(1),
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    fn connect(url: &str) -> Result<UdpSocket, EgressError> {
        let (host, port) = parse_host_port(url, 0).map_err(EgressError::PeerInit)?;
        if port == 0 {
            return Err(EgressError::PeerInit(format!("missing port in '{}'", url)));
        }

        let remote = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| EgressError::PeerInit(format!("resolve {}: {}", host, e)))?
            .next()
            .ok_or_else(|| EgressError::PeerInit(format!("no address for {}", host)))?;

        let socket = Socket::new(Domain::for_address(remote), Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| EgressError::PeerInit(e.to_string()))?;

        // Best effort; the kernel may cap it
        let _ = socket.set_send_buffer_size(SEND_BUFFER_SIZE);

        let local: SocketAddr = match remote {
            SocketAddr::V4(_) => (IpAddr::from([0u8; 4]), 0).into(),
            SocketAddr::V6(_) => (IpAddr::from([0u16; 8]), 0).into(),
        };
        socket
            .bind(&local.into())
            .map_err(|e| EgressError::PeerInit(e.to_string()))?;
        socket
            .connect(&remote.into())
            .map_err(|e| EgressError::PeerInit(e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| EgressError::PeerInit(e.to_string()))?;

        tracing::debug!("UDP egress connected to {}", remote);
        Ok(socket.into())
    }
}

impl Default for UdpEgressContext {
    fn default() -> Self {
        Self::new()
    }
}

impl EgressContext for UdpEgressContext {
    fn set_stats_callback(&mut self, interval: Duration, callback: StatsCallback) -> Result<(), EgressError> {
        if interval.is_zero() {
            return Err(EgressError::PeerInit("stats interval must be non-zero".into()));
        }
        self.interval = interval;
        self.callback = Some(callback);
        self.window_start = Instant::now();
        Ok(())
    }

    fn create_peer(&mut self, url: &str) -> Result<(), EgressError> {
        self.socket = Some(Self::connect(url)?);
        Ok(())
    }

    fn housekeeping(&mut self) -> Result<(), EgressError> {
        let elapsed = self.window_start.elapsed();
        if elapsed < self.interval {
            return Ok(());
        }

        if let Some(callback) = &self.callback {
            let millis = elapsed.as_millis().max(1);
            // bytes * 8 / ms == kbit/s
            let kbps = (u128::from(self.window_bytes) * 8 / millis).min(u128::from(u32::MAX)) as u32;
            callback(&TransportStats::SenderPeer(SenderPeerStats {
                bitrate_avg: kbps,
                quality: 0.0,
                rtt: 0,
            }));
        }

        self.window_start = Instant::now();
        self.window_bytes = 0;
        Ok(())
    }

    fn write(&mut self, data: &[u8], _stream_id: u16) -> Result<usize, EgressError> {
        let socket = self.socket.as_ref().ok_or(EgressError::NotInitialized)?;
        let sent = socket.send(data).map_err(|e| EgressError::Send(e.to_string()))?;
        self.window_bytes += sent as u64;
        Ok(sent)
    }

    fn destroy_peer(&mut self) {
        self.socket = None;
    }
}
