//! Replication errors

use thiserror::Error;

/// Errors raised by a transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Service not available: {0}")]
    ServiceUnavailable(String),

    #[error("No handler for {0}")]
    NoHandler(String),

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("Connection closed")]
    Closed,

    #[error("Outbound queue full")]
    QueueFull,

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Serialization error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Errors surfaced by the replicated store
#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("Replica not ready: bootstrap from host failed")]
    NotReady,

    #[error("Bootstrap timed out after {0}ms")]
    BootstrapTimeout(u64),

    #[error("Snapshot state does not match the application state: {0}")]
    InvalidSnapshot(serde_json::Error),

    #[error("Replication session ended")]
    SessionEnded,

    #[error("Store dropped")]
    StoreDropped,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Codec(#[from] serde_json::Error),
}
