//! Async I/O bridge for the synchronous dispatch loop
//!
//! Transports run their sockets as tasks on a tokio runtime and hand
//! inbound traffic to the dispatch thread through channels. [`Wakeup`] lets
//! that thread sleep until a task reports new traffic or the wait elapses.

use parking_lot::{Condvar, Mutex};
use std::io;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};

/// Runtime that drives transport tasks
pub enum IoRuntime {
    /// Runtime created for this transport, used outside any tokio context
    Owned(Runtime),
    /// The ambient runtime
    Shared(Handle),
}

impl IoRuntime {
    /// Use the ambient runtime if there is one, else start a small private one
    pub fn current_or_owned() -> io::Result<Self> {
        match Handle::try_current() {
            Ok(handle) => Ok(IoRuntime::Shared(handle)),
            Err(_) => Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("ingest-io")
                .enable_all()
                .build()
                .map(IoRuntime::Owned),
        }
    }

    pub fn handle(&self) -> &Handle {
        match self {
            IoRuntime::Owned(runtime) => runtime.handle(),
            IoRuntime::Shared(handle) => handle,
        }
    }
}

/// Generation counter the dispatch thread can sleep on
#[derive(Default)]
pub struct Wakeup {
    generation: Mutex<u64>,
    signal: Condvar,
}

impl Wakeup {
    pub fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        drop(generation);
        self.signal.notify_all();
    }

    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Sleep until the generation moves past `seen` or `timeout` elapses
    pub fn wait_past(&self, seen: u64, timeout: Duration) {
        let mut generation = self.generation.lock();
        if *generation == seen {
            let _ = self.signal.wait_for(&mut generation, timeout);
        }
    }
}
