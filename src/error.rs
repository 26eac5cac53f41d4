use std::io;

use thiserror::Error;

pub type Result<T, E = NcmError> = std::result::Result<T, E>;

/// Everything that can go wrong while recovering one container.
#[derive(Error, Debug)]
pub enum NcmError {
    /// Bad signature words or an unusable outer layout. Nothing was written.
    #[error("not an ncm container: {0}")]
    Format(String),

    #[error("crypto failure: {0}")]
    Crypto(String),

    /// The audio can still be recovered, only tagging is lost.
    #[error("metadata block could not be parsed: {0}")]
    MetadataParse(String),

    #[error("{block} block declares {declared} bytes but only {available} are available")]
    TruncatedInput {
        block: &'static str,
        declared: u64,
        available: u64,
    },

    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("write failed: {0}")]
    Write(#[source] io::Error),
}

impl NcmError {
    /// Whether this error stops processing of the current file.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, NcmError::MetadataParse(_))
    }
}
