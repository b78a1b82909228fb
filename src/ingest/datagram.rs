//! UDP session transport
//!
//! Emulates connection-oriented sessions over plain UDP, for loopback
//! testing and trusted links. A listener demuxes datagrams by source
//! address: the first datagram from an unknown address queues a pending
//! session for `accept`. A caller announces itself with an empty datagram.
//! A session that stays silent past its idle timeout, or whose peer answers
//! with a port-unreachable, reports connection loss.
//!
//! Sockets are read by tasks on an [`IoRuntime`]; the dispatch thread only
//! touches the shared queues.

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use super::runtime::{IoRuntime, Wakeup};
use super::transport::{RecvError, SessionHandle, SessionOptions, SessionTransport};
use crate::constants::{INGEST_BUFFER_SIZE, MAX_DATAGRAM_SIZE, SESSION_QUEUE_DEPTH};

struct Listener {
    local: SocketAddr,
    pending: VecDeque<SessionHandle>,
    peers: HashMap<SocketAddr, SessionHandle>,
    backlog: usize,
    idle_timeout: Duration,
}

enum SessionKind {
    Accepted { listener: SessionHandle, peer: SocketAddr },
    Caller { local: SocketAddr },
}

struct Session {
    kind: SessionKind,
    queue: VecDeque<Bytes>,
    last_seen: Instant,
    idle_timeout: Duration,
    lost: bool,
    dropped: u64,
}

impl Session {
    fn new(kind: SessionKind, idle_timeout: Duration) -> Self {
        Self {
            kind,
            queue: VecDeque::new(),
            last_seen: Instant::now(),
            idle_timeout,
            lost: false,
            dropped: 0,
        }
    }

    /// Queue one datagram; the oldest is dropped once the queue is full
    fn push(&mut self, data: &[u8]) {
        self.last_seen = Instant::now();
        if data.is_empty() {
            return;
        }
        if self.queue.len() >= SESSION_QUEUE_DEPTH {
            self.queue.pop_front();
            self.dropped += 1;
            tracing::trace!("Session queue full, dropped oldest datagram ({} so far)", self.dropped);
        }
        self.queue.push_back(Bytes::copy_from_slice(data));
    }

    fn is_dead(&self) -> bool {
        self.lost || self.last_seen.elapsed() >= self.idle_timeout
    }
}

#[derive(Default)]
struct Shared {
    next_id: u32,
    listeners: HashMap<SessionHandle, Listener>,
    sessions: HashMap<SessionHandle, Session>,
}

fn allocate(next_id: &mut u32) -> SessionHandle {
    *next_id = next_id.wrapping_add(1).max(1);
    SessionHandle(*next_id)
}

impl Shared {
    /// Route a datagram that arrived on `listener`; true if anything became readable
    fn deliver(&mut self, listener: SessionHandle, from: SocketAddr, data: &[u8]) -> bool {
        let Self {
            next_id,
            listeners,
            sessions,
        } = self;
        let Some(state) = listeners.get_mut(&listener) else {
            return false;
        };

        if let Some(handle) = state.peers.get(&from) {
            if let Some(session) = sessions.get_mut(handle) {
                session.push(data);
            }
            return !data.is_empty();
        }

        if state.pending.len() >= state.backlog {
            tracing::debug!("Backlog full, dropping datagram from {}", from);
            return false;
        }

        let handle = allocate(next_id);
        let mut session = Session::new(SessionKind::Accepted { listener, peer: from }, state.idle_timeout);
        session.push(data);
        sessions.insert(handle, session);
        state.peers.insert(from, handle);
        state.pending.push_back(handle);
        true
    }

    fn push(&mut self, session: SessionHandle, data: &[u8]) -> bool {
        match self.sessions.get_mut(&session) {
            Some(state) => {
                state.push(data);
                !data.is_empty()
            }
            None => false,
        }
    }

    fn mark_lost(&mut self, session: SessionHandle) {
        if let Some(state) = self.sessions.get_mut(&session) {
            state.lost = true;
        }
    }
}

async fn listen(socket: UdpSocket, handle: SessionHandle, shared: Arc<Mutex<Shared>>, wakeup: Arc<Wakeup>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if shared.lock().deliver(handle, from, &buf[..len]) {
                    wakeup.notify();
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                tracing::debug!("Listener {} receive error: {}", handle, e);
                return;
            }
        }
    }
}

async fn call(socket: UdpSocket, handle: SessionHandle, shared: Arc<Mutex<Shared>>, wakeup: Arc<Wakeup>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv(&mut buf).await {
            Ok(len) => {
                if shared.lock().push(handle, &buf[..len]) {
                    wakeup.notify();
                }
            }
            Err(e) => {
                if e.kind() == io::ErrorKind::ConnectionRefused {
                    tracing::debug!("Caller {} peer unreachable", handle);
                } else {
                    tracing::debug!("Caller {} receive error: {}", handle, e);
                }
                shared.lock().mark_lost(handle);
                wakeup.notify();
                return;
            }
        }
    }
}

/// Session transport over UDP sockets
pub struct DatagramTransport {
    runtime: IoRuntime,
    shared: Arc<Mutex<Shared>>,
    wakeup: Arc<Wakeup>,
    tasks: HashMap<SessionHandle, JoinHandle<()>>,
    registered: HashSet<SessionHandle>,
}

impl DatagramTransport {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            runtime: IoRuntime::current_or_owned()?,
            shared: Arc::new(Mutex::new(Shared::default())),
            wakeup: Arc::new(Wakeup::default()),
            tasks: HashMap::new(),
            registered: HashSet::new(),
        })
    }

    fn udp_socket(domain_of: SocketAddr, reuse_addr: bool) -> io::Result<Socket> {
        let socket = Socket::new(Domain::for_address(domain_of), Type::DGRAM, Some(Protocol::UDP))?;
        if reuse_addr {
            socket.set_reuse_address(true)?;
        }
        // Best effort; the kernel may cap it
        let _ = socket.set_recv_buffer_size(INGEST_BUFFER_SIZE);
        Ok(socket)
    }

    fn attach_socket(&self, socket: Socket) -> io::Result<UdpSocket> {
        socket.set_nonblocking(true)?;
        let _guard = self.runtime.handle().enter();
        UdpSocket::from_std(socket.into())
    }

    fn collect_ready(&self, ready: &mut Vec<SessionHandle>) {
        let shared = self.shared.lock();
        for handle in &self.registered {
            let is_ready = if let Some(listener) = shared.listeners.get(handle) {
                !listener.pending.is_empty()
            } else if let Some(session) = shared.sessions.get(handle) {
                !session.queue.is_empty() || session.is_dead()
            } else {
                false
            };
            if is_ready {
                ready.push(*handle);
            }
        }
        ready.sort_unstable();
    }
}

impl SessionTransport for DatagramTransport {
    fn open_listener(&mut self, bind: SocketAddr, options: &SessionOptions) -> io::Result<SessionHandle> {
        let socket = Self::udp_socket(bind, options.reuse_addr)?;
        socket.bind(&bind.into())?;
        let socket = self.attach_socket(socket)?;
        let local = socket.local_addr()?;

        let handle = {
            let mut shared = self.shared.lock();
            let handle = allocate(&mut shared.next_id);
            shared.listeners.insert(
                handle,
                Listener {
                    local,
                    pending: VecDeque::new(),
                    peers: HashMap::new(),
                    backlog: options.backlog.max(1) as usize,
                    idle_timeout: options.peer_idle_timeout,
                },
            );
            handle
        };

        let task = self.runtime.handle().spawn(listen(
            socket,
            handle,
            Arc::clone(&self.shared),
            Arc::clone(&self.wakeup),
        ));
        self.tasks.insert(handle, task);
        tracing::debug!("Listener {} bound to {} (latency {:?})", handle, local, options.latency);
        Ok(handle)
    }

    fn open_caller(&mut self, remote: SocketAddr, options: &SessionOptions) -> io::Result<SessionHandle> {
        let socket = Self::udp_socket(remote, options.reuse_addr)?;
        let any: SocketAddr = match remote {
            SocketAddr::V4(_) => (IpAddr::from([0u8; 4]), 0).into(),
            SocketAddr::V6(_) => (IpAddr::from([0u16; 8]), 0).into(),
        };
        socket.bind(&any.into())?;
        socket.connect(&remote.into())?;
        socket.send(&[])?;
        let socket = self.attach_socket(socket)?;
        let local = socket.local_addr()?;

        let handle = {
            let mut shared = self.shared.lock();
            let handle = allocate(&mut shared.next_id);
            shared
                .sessions
                .insert(handle, Session::new(SessionKind::Caller { local }, options.peer_idle_timeout));
            handle
        };

        let task = self.runtime.handle().spawn(call(
            socket,
            handle,
            Arc::clone(&self.shared),
            Arc::clone(&self.wakeup),
        ));
        self.tasks.insert(handle, task);
        Ok(handle)
    }

    fn accept(&mut self, listener: SessionHandle) -> io::Result<(SessionHandle, SocketAddr)> {
        let mut shared = self.shared.lock();
        let handle = shared
            .listeners
            .get_mut(&listener)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not a listener"))?
            .pending
            .pop_front()
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;

        match shared.sessions.get(&handle).map(|s| &s.kind) {
            Some(SessionKind::Accepted { peer, .. }) => Ok((handle, *peer)),
            _ => Err(io::Error::new(io::ErrorKind::NotFound, "pending session vanished")),
        }
    }

    fn recv(&mut self, session: SessionHandle, buf: &mut [u8]) -> Result<usize, RecvError> {
        let mut shared = self.shared.lock();
        let state = shared
            .sessions
            .get_mut(&session)
            .ok_or_else(|| RecvError::Other(format!("unknown session {}", session)))?;

        match state.queue.pop_front() {
            Some(data) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            None if state.is_dead() => Err(RecvError::ConnectionLost),
            None => Err(RecvError::WouldBlock),
        }
    }

    fn close(&mut self, handle: SessionHandle) {
        self.registered.remove(&handle);
        if let Some(task) = self.tasks.remove(&handle) {
            task.abort();
        }

        let mut shared = self.shared.lock();
        if shared.listeners.remove(&handle).is_some() {
            shared
                .sessions
                .retain(|_, s| !matches!(s.kind, SessionKind::Accepted { listener, .. } if listener == handle));
            self.registered
                .retain(|h| shared.sessions.contains_key(h) || shared.listeners.contains_key(h));
            return;
        }

        if let Some(session) = shared.sessions.remove(&handle) {
            if let SessionKind::Accepted { listener, peer } = session.kind {
                if let Some(listener) = shared.listeners.get_mut(&listener) {
                    if listener.peers.get(&peer) == Some(&handle) {
                        listener.peers.remove(&peer);
                    }
                    listener.pending.retain(|h| *h != handle);
                }
            }
        }
    }

    fn register(&mut self, handle: SessionHandle) -> io::Result<()> {
        let shared = self.shared.lock();
        if !shared.listeners.contains_key(&handle) && !shared.sessions.contains_key(&handle) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "unknown handle"));
        }
        drop(shared);
        self.registered.insert(handle);
        Ok(())
    }

    fn deregister(&mut self, handle: SessionHandle) {
        self.registered.remove(&handle);
    }

    fn wait(&mut self, timeout: Duration, ready: &mut Vec<SessionHandle>) -> io::Result<()> {
        ready.clear();

        let seen = self.wakeup.generation();
        self.collect_ready(ready);
        if ready.is_empty() {
            self.wakeup.wait_past(seen, timeout);
            self.collect_ready(ready);
        }
        Ok(())
    }

    fn local_addr(&self, handle: SessionHandle) -> io::Result<SocketAddr> {
        let shared = self.shared.lock();
        if let Some(listener) = shared.listeners.get(&handle) {
            return Ok(listener.local);
        }
        match shared.sessions.get(&handle).map(|s| &s.kind) {
            Some(SessionKind::Caller { local }) => Ok(*local),
            Some(SessionKind::Accepted { listener, .. }) => shared
                .listeners
                .get(listener)
                .map(|l| l.local)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "listener closed")),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "unknown handle")),
        }
    }

    fn release(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
        self.registered.clear();
        let mut shared = self.shared.lock();
        shared.sessions.clear();
        shared.listeners.clear();
    }
}

impl Drop for DatagramTransport {
    fn drop(&mut self) {
        self.release();
    }
}
