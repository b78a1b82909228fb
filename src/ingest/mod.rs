//! Ingest subsystem: inbound media sources

pub mod datagram;
pub mod pull;
#[cfg(feature = "ffmpeg")]
pub mod rtsp;
pub mod runtime;
pub mod session;
pub mod srt;
pub mod transport;

pub use datagram::DatagramTransport;
pub use pull::{PullBackend, PullSource, TcpPullBackend};
#[cfg(feature = "ffmpeg")]
pub use rtsp::FfmpegPullBackend;
pub use srt::SrtTransport;
pub use session::{IngestManager, IngestMode, IngestStats};
pub use transport::{RecvError, SessionHandle, SessionOptions, SessionTransport};

use crate::error::IngestError;

/// Common lifecycle of every ingest source
///
/// `process` performs one bounded iteration and is a no-op unless the
/// source is running.
pub trait IngestSource: Send {
    fn start(&mut self) -> Result<(), IngestError>;
    fn process(&mut self);
    fn stop(&mut self);
    fn is_running(&self) -> bool;
}

/// The configured ingest variant
pub enum Ingest {
    Session(IngestManager),
    Pull(PullSource),
}

impl Ingest {
    fn source(&mut self) -> &mut dyn IngestSource {
        match self {
            Ingest::Session(manager) => manager,
            Ingest::Pull(pull) => pull,
        }
    }

    pub fn as_session(&self) -> Option<&IngestManager> {
        match self {
            Ingest::Session(manager) => Some(manager),
            Ingest::Pull(_) => None,
        }
    }
}

impl IngestSource for Ingest {
    fn start(&mut self) -> Result<(), IngestError> {
        self.source().start()
    }

    fn process(&mut self) {
        self.source().process();
    }

    fn stop(&mut self) {
        self.source().stop();
    }

    fn is_running(&self) -> bool {
        match self {
            Ingest::Session(manager) => manager.is_running(),
            Ingest::Pull(pull) => pull.is_running(),
        }
    }
}
