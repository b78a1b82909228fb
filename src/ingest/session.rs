//! Session ingest manager
//!
//! Accepts or initiates inbound sessions, multiplexes them with a bounded
//! readiness wait, and forwards every received message to the egress peer
//! routed for that session.
//!
//! Routing precedence for a new session: the active output (failover
//! override), then an exact interface binding on the caller's address, then
//! the first registered output. A session with no candidate is rejected.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use super::transport::{RecvError, SessionHandle, SessionOptions, SessionTransport};
use super::IngestSource;
use crate::constants::{AUTO_INTERFACE, DEFAULT_CALLER_PORT, INGEST_BUFFER_SIZE, POLL_TIMEOUT};
use crate::egress::EgressPeer;
use crate::error::IngestError;
use crate::failover::ActiveOutput;
use crate::net::parse_host_port;

/// Ingest role
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestMode {
    /// Dial out to `url`
    Caller { url: String },
    /// Accept sessions on `port`, all served by one output
    Listener { port: u16 },
    /// Accept sessions on `port`, routed per caller address
    Multi { port: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerState {
    Unstarted,
    Running,
    Stopped,
}

/// Ingest statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestStats {
    pub sessions_accepted: u64,
    pub sessions_rejected: u64,
    pub sessions_closed: u64,
    pub messages_forwarded: u64,
    pub bytes_forwarded: u64,
    pub forward_errors: u64,
    pub receive_errors: u64,
}

#[derive(Default)]
struct Routing {
    active: Option<Arc<EgressPeer>>,
    sessions: HashMap<SessionHandle, Arc<EgressPeer>>,
    bindings: HashMap<String, Arc<EgressPeer>>,
}

/// Session-oriented ingest manager
pub struct IngestManager {
    mode: IngestMode,
    transport: Box<dyn SessionTransport>,
    options: SessionOptions,
    state: ManagerState,
    listener: Option<SessionHandle>,
    caller: Option<SessionHandle>,
    open: Vec<SessionHandle>,
    outputs: Vec<Arc<EgressPeer>>,
    routing: Mutex<Routing>,
    buffer: Vec<u8>,
    ready: Vec<SessionHandle>,
    stats: IngestStats,
}

impl IngestManager {
    fn with_mode(mode: IngestMode, transport: Box<dyn SessionTransport>) -> Self {
        Self {
            mode,
            transport,
            options: SessionOptions::default(),
            state: ManagerState::Unstarted,
            listener: None,
            caller: None,
            open: Vec::new(),
            outputs: Vec::new(),
            routing: Mutex::new(Routing::default()),
            buffer: vec![0u8; INGEST_BUFFER_SIZE],
            ready: Vec::new(),
            stats: IngestStats::default(),
        }
    }

    /// Dial `url` (`scheme://host[:port]`) and forward to `output`
    pub fn caller(url: impl Into<String>, output: Arc<EgressPeer>, transport: Box<dyn SessionTransport>) -> Self {
        let mut manager = Self::with_mode(IngestMode::Caller { url: url.into() }, transport);
        manager.outputs.push(output);
        manager
    }

    /// Listen on `port` and forward every session to `output`
    pub fn listener(port: u16, output: Arc<EgressPeer>, transport: Box<dyn SessionTransport>) -> Self {
        let mut manager = Self::with_mode(IngestMode::Listener { port }, transport);
        manager.outputs.push(output);
        manager
    }

    /// Listen on `port`; outputs are added with [`add_binding`](Self::add_binding)
    pub fn multi(port: u16, transport: Box<dyn SessionTransport>) -> Self {
        Self::with_mode(IngestMode::Multi { port }, transport)
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Bind a concrete interface address to an egress peer (multi mode, before start)
    pub fn add_binding(&mut self, identity: &str, peer: Arc<EgressPeer>) -> Result<(), IngestError> {
        if !matches!(self.mode, IngestMode::Multi { .. }) {
            return Err(IngestError::InvalidState("bindings require multi mode".into()));
        }
        if self.state != ManagerState::Unstarted {
            return Err(IngestError::InvalidState("bindings must be added before start".into()));
        }
        if identity == AUTO_INTERFACE {
            return Err(IngestError::UnresolvedBinding);
        }

        let mut routing = self.routing.lock();
        if routing.bindings.contains_key(identity) {
            return Err(IngestError::DuplicateBinding(identity.to_string()));
        }
        routing.bindings.insert(identity.to_string(), Arc::clone(&peer));
        drop(routing);

        tracing::info!("Added route {} -> {}", identity, peer.url());
        self.outputs.push(peer);
        Ok(())
    }

    pub fn mode(&self) -> &IngestMode {
        &self.mode
    }

    pub fn outputs(&self) -> &[Arc<EgressPeer>] {
        &self.outputs
    }

    /// Get statistics
    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Number of sessions currently routed
    pub fn session_count(&self) -> usize {
        self.routing.lock().sessions.len()
    }

    /// Peer currently serving `session`
    pub fn route_for(&self, session: SessionHandle) -> Option<Arc<EgressPeer>> {
        self.routing.lock().sessions.get(&session).cloned()
    }

    /// Local address of the listening socket, or of the caller session
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let handle = self.listener.or(self.caller)?;
        self.transport.local_addr(handle).ok()
    }

    fn setup(&mut self) -> Result<(), IngestError> {
        match self.mode.clone() {
            IngestMode::Caller { url } => {
                let (host, port) = parse_host_port(&url, DEFAULT_CALLER_PORT).map_err(IngestError::TransportSetup)?;
                let addrs: Vec<SocketAddr> = (host.as_str(), port)
                    .to_socket_addrs()
                    .map_err(|e| IngestError::TransportSetup(format!("Failed to resolve {}: {}", host, e)))?
                    .collect();

                let mut last_error = format!("no addresses for {}", host);
                for addr in addrs {
                    match self.transport.open_caller(addr, &self.options) {
                        Ok(handle) => {
                            tracing::info!("Connected to {}", addr);
                            self.caller = Some(handle);
                            self.open.push(handle);
                            break;
                        }
                        Err(e) => {
                            tracing::debug!("Connect to {} failed: {}", addr, e);
                            last_error = e.to_string();
                        }
                    }
                }

                let handle = self.caller.ok_or_else(|| {
                    IngestError::TransportSetup(format!("Failed to connect to {}: {}", url, last_error))
                })?;
                if let Some(output) = self.outputs.first() {
                    self.routing.lock().sessions.insert(handle, Arc::clone(output));
                }
            }
            IngestMode::Listener { port } | IngestMode::Multi { port } => {
                if matches!(self.mode, IngestMode::Multi { .. }) && self.routing.lock().bindings.is_empty() {
                    return Err(IngestError::TransportSetup(
                        "No interface bindings specified for multi-interface mode".into(),
                    ));
                }

                let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
                let handle = self
                    .transport
                    .open_listener(bind, &self.options)
                    .map_err(|e| IngestError::TransportSetup(format!("Failed to listen on {}: {}", bind, e)))?;
                self.listener = Some(handle);
                self.open.push(handle);
                tracing::info!("Listening on port {}", port);
            }
        }

        for handle in self.open.clone() {
            self.transport
                .register(handle)
                .map_err(|e| IngestError::TransportSetup(format!("Failed to register {}: {}", handle, e)))?;
        }

        Ok(())
    }

    fn teardown(&mut self) {
        for handle in std::mem::take(&mut self.open) {
            self.transport.deregister(handle);
            self.transport.close(handle);
        }
        self.transport.release();

        let mut routing = self.routing.lock();
        routing.sessions.clear();
        routing.active = None;
        routing.bindings.clear();
        drop(routing);

        self.listener = None;
        self.caller = None;
        self.state = ManagerState::Stopped;
    }

    fn handle_accept(&mut self, listener: SessionHandle) {
        let (handle, addr) = match self.transport.accept(listener) {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                return;
            }
        };

        tracing::info!("New connection from {}", addr);

        let route = {
            let routing = self.routing.lock();
            routing
                .active
                .clone()
                .or_else(|| routing.bindings.get(&addr.ip().to_string()).cloned())
                .or_else(|| self.outputs.first().cloned())
        };

        let Some(peer) = route else {
            tracing::error!("{}", IngestError::NoRoute(addr.to_string()));
            self.stats.sessions_rejected += 1;
            self.transport.close(handle);
            return;
        };

        if let Err(e) = self.transport.register(handle) {
            tracing::warn!("Failed to register session {}: {}", handle, e);
            self.stats.sessions_rejected += 1;
            self.transport.close(handle);
            return;
        }

        tracing::info!("Routing {} to {}", addr, peer.url());
        self.routing.lock().sessions.insert(handle, peer);
        self.open.push(handle);
        self.stats.sessions_accepted += 1;
    }

    fn handle_session(&mut self, handle: SessionHandle) {
        match self.transport.recv(handle, &mut self.buffer) {
            Ok(0) | Err(RecvError::WouldBlock) => {}
            Ok(len) => {
                let route = self.routing.lock().sessions.get(&handle).cloned();
                let Some(peer) = route else {
                    return;
                };
                match peer.send_data(&self.buffer[..len]) {
                    Ok(()) => {
                        self.stats.messages_forwarded += 1;
                        self.stats.bytes_forwarded += len as u64;
                    }
                    Err(e) => {
                        self.stats.forward_errors += 1;
                        tracing::warn!("Failed to forward to {}: {}", peer.url(), e);
                    }
                }
            }
            Err(RecvError::ConnectionLost) => {
                tracing::info!("Connection lost on session {}", handle);
                self.close_session(handle);
            }
            Err(RecvError::Other(e)) => {
                self.stats.receive_errors += 1;
                tracing::warn!("{}", IngestError::Receive(e));
            }
        }
    }

    fn close_session(&mut self, handle: SessionHandle) {
        self.transport.deregister(handle);
        self.routing.lock().sessions.remove(&handle);
        self.open.retain(|h| *h != handle);
        self.transport.close(handle);
        if self.caller == Some(handle) {
            self.caller = None;
        }
        self.stats.sessions_closed += 1;
    }
}

impl IngestSource for IngestManager {
    fn start(&mut self) -> Result<(), IngestError> {
        if self.state != ManagerState::Unstarted {
            return Err(IngestError::InvalidState("manager already started".into()));
        }

        match self.setup() {
            Ok(()) => {
                self.state = ManagerState::Running;
                Ok(())
            }
            Err(e) => {
                tracing::error!("{}", e);
                self.teardown();
                Err(e)
            }
        }
    }

    fn process(&mut self) {
        if self.state != ManagerState::Running {
            return;
        }

        let mut ready = std::mem::take(&mut self.ready);
        if let Err(e) = self.transport.wait(POLL_TIMEOUT, &mut ready) {
            tracing::warn!("Readiness wait failed: {}", e);
            self.ready = ready;
            return;
        }

        for handle in ready.iter().copied() {
            if Some(handle) == self.listener {
                self.handle_accept(handle);
            } else {
                self.handle_session(handle);
            }
        }

        self.ready = ready;
    }

    fn stop(&mut self) {
        if self.state != ManagerState::Running {
            return;
        }
        self.teardown();
        tracing::info!("Ingest stopped");
    }

    fn is_running(&self) -> bool {
        self.state == ManagerState::Running
    }
}

impl ActiveOutput for IngestManager {
    /// Route every current and future session to `peer`
    fn set_active_output(&self, peer: Arc<EgressPeer>) -> Result<(), IngestError> {
        if !matches!(self.mode, IngestMode::Multi { .. }) {
            return Err(IngestError::InvalidState("active output requires multi mode".into()));
        }

        let mut routing = self.routing.lock();
        for route in routing.sessions.values_mut() {
            *route = Arc::clone(&peer);
        }
        tracing::info!("Active output set to {}", peer.url());
        routing.active = Some(peer);
        Ok(())
    }
}

impl Drop for IngestManager {
    fn drop(&mut self) {
        self.stop();
    }
}
