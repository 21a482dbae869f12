use thiserror::Error;

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for pipeline operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// An argument is outside the domain accepted by the operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The object is in a state that does not permit the operation (e.g. a
    /// broken slot).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The referenced slot or endpoint does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A pipeline component could not be constructed.
    #[error("construction failed: {0}")]
    ConstructionFailed(String),
}

impl From<rstream_media_core::Error> for Error {
    fn from(err: rstream_media_core::Error) -> Self {
        Error::ConstructionFailed(err.to_string())
    }
}

impl From<rstream_rtp_core::Error> for Error {
    fn from(err: rstream_rtp_core::Error) -> Self {
        Error::ConstructionFailed(err.to_string())
    }
}
