//! Error taxonomy for the relay stack.
//!
//! Every fallible operation on the stack reports one of these variants; no
//! error here is fatal to the process, the worst case is a refused
//! operation.

use thiserror::Error;

/// Relay stack error type.
#[derive(Error, Debug)]
pub enum RelayError {
    /// A data-path call was made while the stack is not running.
    #[error("stack not initialized")]
    NotInitialized,

    /// `init` was called while the stack is already running.
    #[error("stack already initialized")]
    AlreadyInitialized,

    /// The input bytes are not a well-formed IP datagram.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// The flow table is at its configured capacity.
    #[error("flow table full")]
    FlowTableFull,

    /// The outbound queue is at its configured capacity.
    #[error("outbound queue full")]
    QueueFull,

    /// The caller-supplied buffer cannot hold the head packet.
    ///
    /// Retryable: the packet stays queued and the required size is
    /// reported.
    #[error("buffer too small: need {needed} bytes, got {provided}")]
    BufferTooSmall {
        /// Length of the head packet.
        needed: usize,
        /// Length of the buffer the caller provided.
        provided: usize,
    },

    /// The forwarding collaborator refused or failed to take the packet.
    #[error("forwarding failure: {0}")]
    ForwardingFailure(String),

    /// IO error (configuration loading).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),
}

/// Result alias for relay stack operations.
pub type RelayResult<T> = Result<T, RelayError>;
