//! Error types for the relay

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Egress error: {0}")]
    Egress(#[from] EgressError),

    #[error("Feedback error: {0}")]
    Feedback(#[from] FeedbackError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ingest side errors (session manager and pull source)
#[derive(Error, Debug)]
pub enum IngestError {
    /// Socket creation, resolution, bind, listen or connect failed.
    /// Fatal to the manager instance.
    #[error("Transport setup failed: {0}")]
    TransportSetup(String),

    /// No egress peer could serve an accepted session.
    #[error("No route for session from {0}")]
    NoRoute(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Duplicate binding for {0}")]
    DuplicateBinding(String),

    #[error("Binding still set to \"auto\"")]
    UnresolvedBinding,
}

/// Egress peer errors
#[derive(Error, Debug)]
pub enum EgressError {
    /// Context, connection or callback registration failed during init.
    #[error("Peer init failed: {0}")]
    PeerInit(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Peer is not initialized")]
    NotInitialized,
}

/// Feedback sideband errors
#[derive(Error, Debug)]
pub enum FeedbackError {
    #[error("Feedback send failed: {0}")]
    Send(String),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
