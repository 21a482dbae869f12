use thiserror::Error;

/// Result alias for audio-domain operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for audio-domain operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// An argument is outside the domain accepted by the operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The object is in a state that does not permit the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
}
