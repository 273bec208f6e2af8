//! Storage Module - Blob persistence scoped by application and workspace
//!
//! Blobs are written under a random identifier with the original filename
//! kept in a sidecar, so lookups never need a separate index.

mod address;
mod object_store;

pub use address::{Address, WorkspaceId};
pub use object_store::{ObjectId, ObjectStore, PendingObject, StoredObject};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid object identifier: {0}")]
    InvalidIdentifier(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
