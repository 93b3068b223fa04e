//! Error types for ferry-core.

use thiserror::Error;

/// Result type for ferry-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in ferry-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Supervisor has not been initialized; forking is not possible yet.
    #[error("supervisor not ready")]
    NotReady,

    /// Worker process could not be spawned or located.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// IPC transport failure.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Frame encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Dynamic load of a handler module failed.
    #[error("failed to load module: {0}")]
    ModuleLoad(String),

    /// A handler raised an error or panicked during dispatch.
    #[error("handler dispatch failed: {0}")]
    Dispatch(String),

    /// A module's port hook raised an error or panicked.
    #[error("port bootstrap failed: {0}")]
    PortBootstrap(String),

    /// The pre-ready queue is full and the overflow policy rejected the send.
    #[error("outgoing queue full")]
    QueueFull,

    /// The peer endpoint or its process is gone.
    #[error("channel closed")]
    ChannelClosed,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
