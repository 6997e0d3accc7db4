//! Error types for the storage engine.

use thiserror::Error;
use crate::types::BlockId;

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Boxed error produced by key/value serializers
pub type SerializerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error from the underlying container
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A header, chain or node invariant was violated
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Unique-key insert collided with an existing key
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// A key or value serializer failed while encoding or decoding a node
    #[error("Failed to serialize/deserialize tree node ({context})")]
    Serialization {
        context: String,
        #[source]
        source: SerializerError,
    },

    /// The record id does not name a live record
    #[error("Record {0} not found")]
    RecordNotFound(BlockId),

    /// Invalid operation for the current state or configuration
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The container is not a block store of this format
    #[error("Invalid container: {0}")]
    InvalidContainer(String),

    /// The container is held exclusively by another handle
    #[error("Container is locked: {0}")]
    Locked(String),
}

impl StorageError {
    /// Create a corruption error with a message
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create an invalid operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Create an invalid container error
    pub fn invalid_container(msg: impl Into<String>) -> Self {
        Self::InvalidContainer(msg.into())
    }

    /// Wrap a serializer failure
    pub fn serialization(context: impl Into<String>, source: SerializerError) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    /// Whether this error indicates on-disk corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }
}
