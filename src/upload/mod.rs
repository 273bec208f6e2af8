//! Upload Module - turns a sequence of form parts into stored objects
//!
//! This is the glue between a request boundary and the storage engine:
//! it authorizes the user, gates content types, and streams each part
//! through a [`QuotaWriter`](crate::quota::QuotaWriter) into the
//! [`ObjectStore`](crate::storage::ObjectStore).

mod gate;
mod orchestrator;

pub use gate::{AllowList, ContentGate, DEFAULT_ALLOWED_CONTENT_TYPES};
pub use orchestrator::{UploadItem, UploadOrchestrator, UploadPart, UploadReceipt, FILE_FIELD_NAME};

use crate::quota::QuotaError;
use crate::storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Not authorized")]
    Unauthorized,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("File type not allowed: {0}")]
    ContentTypeNotAllowed(String),

    #[error("Upload exceeds {limit} bytes")]
    TooLarge { limit: i64 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Quota(#[from] QuotaError),
}

impl UploadError {
    /// HTTP status a request boundary should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            UploadError::Unauthorized => 403,
            UploadError::BadRequest(_) | UploadError::ContentTypeNotAllowed(_) => 400,
            UploadError::TooLarge { .. } => 413,
            UploadError::Storage(StorageError::NotFound(_)) => 404,
            UploadError::Storage(StorageError::InvalidAddress(_))
            | UploadError::Storage(StorageError::InvalidIdentifier(_)) => 400,
            UploadError::Quota(QuotaError::OutOfQuota) => 507,
            UploadError::Storage(_) | UploadError::Quota(_) => 500,
        }
    }
}
