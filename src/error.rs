use std::io;
use thiserror::Error;

use crate::tree::Address;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Errors surfaced by the tree and its storage collaborators.
#[derive(Debug, Error)]
pub enum StrataError {
    /// Underlying file system failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A page or journal could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Stored data failed a checksum or violates a tree invariant.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// Storage holds no page at the requested address.
    #[error("page {0} not found")]
    NotFound(Address),
    /// Caller supplied an unusable option or argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A balance pass is already running on this tree.
    #[error("a balance pass is already in progress")]
    Balancing,
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for StrataError {
    fn from(err: toml::de::Error) -> Self {
        StrataError::Serialization(err.to_string())
    }
}
