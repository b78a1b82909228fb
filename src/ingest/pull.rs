//! Pull-protocol ingest
//!
//! Opens a remote media source, forwards video packets to every output and
//! drops everything else. An I/O or timeout error triggers exactly one
//! stop/start cycle per occurrence.

use bytes::Bytes;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use super::IngestSource;
use crate::constants::{MAX_DATAGRAM_SIZE, POLL_TIMEOUT, PULL_TIMEOUT};
use crate::egress::EgressPeer;
use crate::error::IngestError;
use crate::net::parse_host_port;

/// Kind of elementary stream a packet belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Data,
}

/// One demuxed packet
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub kind: StreamKind,
    pub data: Bytes,
}

/// Read failure classes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PullError {
    #[error("end of stream")]
    EndOfStream,

    /// Transient; try again on the next iteration
    #[error("try again")]
    Again,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("timed out")]
    TimedOut,

    #[error("{0}")]
    Other(String),
}

/// An opened media source
pub trait PullStream: Send {
    /// Elementary streams the source carries
    fn streams(&self) -> Vec<StreamKind>;

    fn read_packet(&mut self) -> Result<MediaPacket, PullError>;
}

/// Opens media sources by URL
pub trait PullBackend: Send {
    fn open(&mut self, url: &str) -> Result<Box<dyn PullStream>, PullError>;
}

/// Pull statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct PullStats {
    pub packets_forwarded: u64,
    pub packets_dropped: u64,
    pub reconnects: u64,
    pub forward_errors: u64,
}

/// Pull-protocol ingest source
pub struct PullSource {
    url: String,
    backend: Box<dyn PullBackend>,
    stream: Option<Box<dyn PullStream>>,
    outputs: Vec<Arc<EgressPeer>>,
    running: bool,
    stats: PullStats,
}

impl PullSource {
    pub fn new(url: impl Into<String>, backend: Box<dyn PullBackend>) -> Self {
        Self {
            url: url.into(),
            backend,
            stream: None,
            outputs: Vec::new(),
            running: false,
            stats: PullStats::default(),
        }
    }

    pub fn add_output(&mut self, output: Arc<EgressPeer>) {
        self.outputs.push(output);
    }

    pub fn outputs(&self) -> &[Arc<EgressPeer>] {
        &self.outputs
    }

    /// Get statistics
    pub fn stats(&self) -> PullStats {
        self.stats
    }

    fn forward(&mut self, packet: &MediaPacket) {
        for output in &self.outputs {
            match output.send_data(&packet.data) {
                Ok(()) => self.stats.packets_forwarded += 1,
                Err(e) => {
                    self.stats.forward_errors += 1;
                    tracing::warn!("Failed to forward to {}: {}", output.url(), e);
                }
            }
        }
    }

    fn reconnect(&mut self) {
        tracing::warn!("Attempting to reconnect to {}", self.url);
        self.stats.reconnects += 1;
        self.stop();
        if let Err(e) = self.start() {
            tracing::error!("Reconnect failed: {}", e);
        }
    }
}

impl IngestSource for PullSource {
    fn start(&mut self) -> Result<(), IngestError> {
        if self.running {
            return Ok(());
        }

        let stream = self
            .backend
            .open(&self.url)
            .map_err(|e| IngestError::TransportSetup(format!("Failed to open {}: {}", self.url, e)))?;

        if !stream.streams().contains(&StreamKind::Video) {
            return Err(IngestError::TransportSetup(format!("No video stream found in {}", self.url)));
        }

        self.stream = Some(stream);
        self.running = true;
        tracing::info!("Pull source opened: {}", self.url);
        Ok(())
    }

    fn process(&mut self) {
        if !self.running {
            return;
        }
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        match stream.read_packet() {
            Ok(packet) if packet.kind == StreamKind::Video => self.forward(&packet),
            Ok(_) => self.stats.packets_dropped += 1,
            Err(PullError::Again) => {}
            Err(PullError::EndOfStream) => {
                tracing::info!("End of stream reached");
                self.running = false;
            }
            Err(e @ (PullError::Io(_) | PullError::TimedOut)) => {
                tracing::error!("Error reading packet: {}", e);
                self.reconnect();
            }
            Err(e) => tracing::error!("Error reading packet: {}", e),
        }
    }

    fn stop(&mut self) {
        self.running = false;
        self.stream = None;
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for PullSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Raw TCP pull: `tcp://host:port`, every chunk tagged as video
///
/// For sources that already emit a bare elementary or transport stream.
/// Other schemes are refused rather than read as raw bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpPullBackend;

impl PullBackend for TcpPullBackend {
    fn open(&mut self, url: &str) -> Result<Box<dyn PullStream>, PullError> {
        if let Some((scheme, _)) = url.split_once("://") {
            if !scheme.eq_ignore_ascii_case("tcp") {
                return Err(PullError::Other(format!(
                    "unsupported scheme '{}' for raw TCP pull",
                    scheme
                )));
            }
        }

        let (host, port) = parse_host_port(url, 0).map_err(PullError::Other)?;
        if port == 0 {
            return Err(PullError::Other(format!("missing port in '{}'", url)));
        }

        let addrs: Vec<SocketAddr> = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| PullError::Io(e.to_string()))?
            .collect();

        let mut last_error = PullError::Other(format!("no addresses for {}", host));
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, PULL_TIMEOUT) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(POLL_TIMEOUT))
                        .map_err(|e| PullError::Io(e.to_string()))?;
                    let _ = stream.set_nodelay(true);
                    return Ok(Box::new(TcpPullStream {
                        stream,
                        buffer: vec![0u8; MAX_DATAGRAM_SIZE],
                        last_data: Instant::now(),
                    }));
                }
                Err(e) => last_error = classify_io_error(&e),
            }
        }
        Err(last_error)
    }
}

struct TcpPullStream {
    stream: TcpStream,
    buffer: Vec<u8>,
    last_data: Instant,
}

impl PullStream for TcpPullStream {
    fn streams(&self) -> Vec<StreamKind> {
        vec![StreamKind::Video]
    }

    fn read_packet(&mut self) -> Result<MediaPacket, PullError> {
        match self.stream.read(&mut self.buffer) {
            Ok(0) => Err(PullError::EndOfStream),
            Ok(len) => {
                self.last_data = Instant::now();
                Ok(MediaPacket {
                    kind: StreamKind::Video,
                    data: Bytes::copy_from_slice(&self.buffer[..len]),
                })
            }
            // Short read timeouts keep the loop responsive; silence past
            // the pull timeout is a real timeout
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                if self.last_data.elapsed() >= PULL_TIMEOUT {
                    Err(PullError::TimedOut)
                } else {
                    Err(PullError::Again)
                }
            }
            Err(e) => Err(classify_io_error(&e)),
        }
    }
}

fn classify_io_error(e: &io::Error) -> PullError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => PullError::Again,
        io::ErrorKind::TimedOut => PullError::TimedOut,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionRefused => PullError::Io(e.to_string()),
        _ => PullError::Other(e.to_string()),
    }
}
