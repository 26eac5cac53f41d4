//! Recovers the original audio from ncm containers and tags the result.

pub mod batch;
pub mod cover;
pub mod error;
pub mod ncm;
pub mod tag;

pub use error::{NcmError, Result};
pub use ncm::{Engine, TrackMetadata, Unboxed, Unboxer};
