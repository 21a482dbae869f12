use thiserror::Error;

/// Result alias for packet-domain operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for packet-domain operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// An argument is outside the domain accepted by the operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The object is in a state that does not permit the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A fixed-size pool or buffer is exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Malformed packet or an unrecoverable FEC block.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// A stream filter rejected the packet.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// An operation did not complete in time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Error reported by the I/O layer.
    #[error("io error: {0}")]
    IoError(String),
}
