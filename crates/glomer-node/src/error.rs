//! Node error types

use glomer_broadcast::BroadcastError;
use thiserror::Error;

/// Node error type
#[derive(Debug, Error)]
pub enum NodeError {
    /// Invalid or unreadable configuration
    #[error("config error: {0}")]
    Config(String),

    /// Engine or wire error
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),

    /// IO error on the stdio channel
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Node result type
pub type NodeResult<T> = Result<T, NodeError>;
