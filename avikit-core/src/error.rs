//! # Codec Errors
//!
//! One taxonomy shared by the chunk reader, the AVI container model, the
//! stream adapter and the decoder objects.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    /// Structural violation of the chunk/container layout.
    #[error("Bad format: {0}")]
    BadFormat(String),
    /// Operation not allowed in the object's current state.
    #[error("Wrong state: {0}")]
    WrongState(&'static str),
    #[error("Not found: {0}")]
    NotFound(String),
    /// External codec library could not be loaded. Cached per process.
    #[error("Codec library unavailable: {0}")]
    Unavailable(String),
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("Interface not supported")]
    NoInterface,
    #[error("Codec has no thumbnail")]
    NoThumbnail,
    #[error("Stream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    pub(crate) fn bad_format(msg: impl Into<String>) -> Self {
        CodecError::BadFormat(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
