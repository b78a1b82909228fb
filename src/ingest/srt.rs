//! SRT session transport
//!
//! Listeners and callers are `srt-tokio` sockets running as tasks on an
//! [`IoRuntime`]. Handshakes, retransmission and latency buffering happen
//! there; the dispatch thread sees only accepted connections and whole
//! messages, through bounded channels.

use bytes::Bytes;
use futures::StreamExt;
use srt_tokio::{SrtListener, SrtSocket};
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;

use super::runtime::{IoRuntime, Wakeup};
use super::transport::{RecvError, SessionHandle, SessionOptions, SessionTransport};
use crate::constants::{CONNECT_TIMEOUT, SESSION_QUEUE_DEPTH};

enum Inbound {
    Message(Bytes),
    Closed,
}

struct ListenerSlot {
    bind: SocketAddr,
    accepted: mpsc::Receiver<(SrtSocket, SocketAddr)>,
    queued: Option<(SrtSocket, SocketAddr)>,
    task: JoinHandle<()>,
}

impl ListenerSlot {
    fn poll_accepted(&mut self) -> bool {
        if self.queued.is_none() {
            self.queued = self.accepted.try_recv().ok();
        }
        self.queued.is_some()
    }
}

struct SessionSlot {
    local: Option<SocketAddr>,
    inbound: mpsc::Receiver<Inbound>,
    peeked: Option<Inbound>,
    task: JoinHandle<()>,
}

impl SessionSlot {
    fn poll_inbound(&mut self) -> bool {
        if self.peeked.is_none() {
            self.peeked = match self.inbound.try_recv() {
                Ok(inbound) => Some(inbound),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => Some(Inbound::Closed),
            };
        }
        self.peeked.is_some()
    }
}

fn transport_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// srt-tokio does not report an ephemeral bound port, so pick one up front
fn resolve_bind(bind: SocketAddr) -> io::Result<SocketAddr> {
    if bind.port() != 0 {
        return Ok(bind);
    }
    std::net::UdpSocket::bind(bind)?.local_addr()
}

async fn read_session(mut socket: SrtSocket, inbound: mpsc::Sender<Inbound>, wakeup: Arc<Wakeup>) {
    while let Some(item) = socket.next().await {
        match item {
            Ok((_, data)) => {
                // Waits for room, so a slow dispatch loop backpressures the sender
                if inbound.send(Inbound::Message(data)).await.is_err() {
                    return;
                }
                wakeup.notify();
            }
            Err(e) => {
                tracing::debug!("SRT receive error: {}", e);
                break;
            }
        }
    }
    let _ = inbound.send(Inbound::Closed).await;
    wakeup.notify();
}

/// Session transport over SRT
pub struct SrtTransport {
    runtime: IoRuntime,
    wakeup: Arc<Wakeup>,
    next_id: u32,
    listeners: HashMap<SessionHandle, ListenerSlot>,
    sessions: HashMap<SessionHandle, SessionSlot>,
    registered: HashSet<SessionHandle>,
}

impl SrtTransport {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            runtime: IoRuntime::current_or_owned()?,
            wakeup: Arc::new(Wakeup::default()),
            next_id: 0,
            listeners: HashMap::new(),
            sessions: HashMap::new(),
            registered: HashSet::new(),
        })
    }

    fn allocate(&mut self) -> SessionHandle {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        SessionHandle(self.next_id)
    }

    fn spawn_session(&mut self, socket: SrtSocket, local: Option<SocketAddr>) -> SessionHandle {
        let handle = self.allocate();
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let task = self
            .runtime
            .handle()
            .spawn(read_session(socket, tx, Arc::clone(&self.wakeup)));
        self.sessions.insert(
            handle,
            SessionSlot {
                local,
                inbound: rx,
                peeked: None,
                task,
            },
        );
        handle
    }

    fn collect_ready(&mut self, ready: &mut Vec<SessionHandle>) {
        let Self {
            registered,
            listeners,
            sessions,
            ..
        } = self;

        for handle in registered.iter() {
            let is_ready = if let Some(listener) = listeners.get_mut(handle) {
                listener.poll_accepted()
            } else if let Some(session) = sessions.get_mut(handle) {
                session.poll_inbound()
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

impl SessionTransport for SrtTransport {
    fn open_listener(&mut self, bind: SocketAddr, options: &SessionOptions) -> io::Result<SessionHandle> {
        let bind = resolve_bind(bind)?;
        let latency = options.latency;

        let (listener, mut requests) = self
            .runtime
            .handle()
            .block_on(async move { SrtListener::builder().latency(latency).bind(bind).await })
            .map_err(transport_error)?;

        let (tx, rx) = mpsc::channel(options.backlog.max(1) as usize);
        let wakeup = Arc::clone(&self.wakeup);
        let task = self.runtime.handle().spawn(async move {
            let _listener = listener;
            let requests = requests.incoming();
            while let Some(request) = requests.next().await {
                let stream_id = request.stream_id().map(|s| s.to_string());
                // Requests past the backlog are left unanswered
                let Ok(permit) = tx.try_reserve() else {
                    tracing::debug!("Backlog full, ignoring connection request (streamid: {:?})", stream_id);
                    continue;
                };
                match request.accept(None).await {
                    Ok(socket) => {
                        let remote = socket.settings().remote;
                        tracing::debug!("SRT handshake with {} complete (streamid: {:?})", remote, stream_id);
                        permit.send((socket, remote));
                        wakeup.notify();
                    }
                    Err(e) => tracing::warn!("SRT handshake failed: {}", e),
                }
            }
        });

        let handle = self.allocate();
        self.listeners.insert(
            handle,
            ListenerSlot {
                bind,
                accepted: rx,
                queued: None,
                task,
            },
        );
        tracing::debug!("SRT listener {} bound to {} (latency {:?})", handle, bind, latency);
        Ok(handle)
    }

    fn open_caller(&mut self, remote: SocketAddr, options: &SessionOptions) -> io::Result<SessionHandle> {
        let latency = options.latency;
        let socket = self
            .runtime
            .handle()
            .block_on(async move {
                tokio::time::timeout(CONNECT_TIMEOUT, SrtSocket::builder().latency(latency).call(remote, None)).await
            })
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {} timed out", remote)))?
            .map_err(transport_error)?;

        Ok(self.spawn_session(socket, None))
    }

    fn accept(&mut self, listener: SessionHandle) -> io::Result<(SessionHandle, SocketAddr)> {
        let slot = self
            .listeners
            .get_mut(&listener)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not a listener"))?;
        slot.poll_accepted();
        let (socket, remote) = slot
            .queued
            .take()
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
        let local = slot.bind;

        Ok((self.spawn_session(socket, Some(local)), remote))
    }

    fn recv(&mut self, session: SessionHandle, buf: &mut [u8]) -> Result<usize, RecvError> {
        let slot = self
            .sessions
            .get_mut(&session)
            .ok_or_else(|| RecvError::Other(format!("unknown session {}", session)))?;
        slot.poll_inbound();

        match slot.peeked.take() {
            Some(Inbound::Message(data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            Some(Inbound::Closed) => {
                slot.peeked = Some(Inbound::Closed);
                Err(RecvError::ConnectionLost)
            }
            None => Err(RecvError::WouldBlock),
        }
    }

    fn close(&mut self, handle: SessionHandle) {
        self.registered.remove(&handle);
        if let Some(listener) = self.listeners.remove(&handle) {
            listener.task.abort();
        } else if let Some(session) = self.sessions.remove(&handle) {
            session.task.abort();
        }
    }

    fn register(&mut self, handle: SessionHandle) -> io::Result<()> {
        if !self.listeners.contains_key(&handle) && !self.sessions.contains_key(&handle) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "unknown handle"));
        }
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
        if let Some(listener) = self.listeners.get(&handle) {
            return Ok(listener.bind);
        }
        match self.sessions.get(&handle) {
            Some(SessionSlot { local: Some(local), .. }) => Ok(*local),
            Some(_) => Err(io::Error::new(io::ErrorKind::Other, "caller sessions do not expose a local address")),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "unknown handle")),
        }
    }

    fn release(&mut self) {
        for (_, listener) in self.listeners.drain() {
            listener.task.abort();
        }
        for (_, session) in self.sessions.drain() {
            session.task.abort();
        }
        self.registered.clear();
    }
}

impl Drop for SrtTransport {
    fn drop(&mut self) {
        self.release();
    }
}
