//! Session transport seam
//!
//! The ingest manager drives a [`SessionTransport`] through opaque
//! [`SessionHandle`]s: listeners, accepted sessions and caller sessions all
//! share the same handle space and the same readiness wait.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::constants::{DEFAULT_LATENCY_MS, DEFAULT_PEER_IDLE_TIMEOUT_MS, LISTEN_BACKLOG};

/// Opaque transport handle; unique among currently open handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(pub u32);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Options applied to every socket the manager opens
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub latency: Duration,
    pub reuse_addr: bool,
    pub backlog: u32,
    /// Silence after which a session reports connection loss
    pub peer_idle_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(DEFAULT_LATENCY_MS),
            reuse_addr: true,
            backlog: LISTEN_BACKLOG,
            peer_idle_timeout: Duration::from_millis(DEFAULT_PEER_IDLE_TIMEOUT_MS),
        }
    }
}

/// Outcome of a failed session read
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecvError {
    /// Nothing to read right now
    #[error("would block")]
    WouldBlock,

    /// The remote side is gone; the handle must be closed
    #[error("connection lost")]
    ConnectionLost,

    #[error("{0}")]
    Other(String),
}

/// Reliable-datagram session transport with readiness multiplexing
pub trait SessionTransport: Send {
    /// Bind and listen on `bind`
    fn open_listener(&mut self, bind: SocketAddr, options: &SessionOptions) -> io::Result<SessionHandle>;

    /// Connect to `remote`; the handle is released on failure
    fn open_caller(&mut self, remote: SocketAddr, options: &SessionOptions) -> io::Result<SessionHandle>;

    /// Accept one pending session; `WouldBlock` when none is queued
    fn accept(&mut self, listener: SessionHandle) -> io::Result<(SessionHandle, SocketAddr)>;

    /// Read one message into `buf`
    fn recv(&mut self, session: SessionHandle, buf: &mut [u8]) -> Result<usize, RecvError>;

    fn close(&mut self, handle: SessionHandle);

    /// Add `handle` to the readiness set
    fn register(&mut self, handle: SessionHandle) -> io::Result<()>;

    fn deregister(&mut self, handle: SessionHandle);

    /// Wait up to `timeout` and fill `ready` with readable registered handles
    fn wait(&mut self, timeout: Duration, ready: &mut Vec<SessionHandle>) -> io::Result<()>;

    fn local_addr(&self, handle: SessionHandle) -> io::Result<SocketAddr>;

    /// Release the multiplexing facility and anything still open
    fn release(&mut self);
}
