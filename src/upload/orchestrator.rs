//! Upload orchestration
//!
//! For every part: sniff a prefix, gate the content type, open a pending
//! object, stream through a quota writer, always close the writer, then
//! commit. A part cut short by quota keeps the bytes already written; a
//! part that fails any other way is discarded. Charged bytes stay charged.

use super::{ContentGate, UploadError};
use crate::identity::{UserId, UserIdentity};
use crate::quota::{QuotaError, QuotaManager, QuotaWriter};
use crate::storage::{Address, ObjectId, ObjectStore, PendingObject, StorageError};

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Form field every uploaded file must use
pub const FILE_FIELD_NAME: &str = "file";

/// One named part of an upload form
pub struct UploadPart {
    pub field_name: String,
    pub file_name: String,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl UploadPart {
    pub fn new(
        field_name: impl Into<String>,
        file_name: impl Into<String>,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            file_name: file_name.into(),
            reader: Box::new(reader),
        }
    }

    /// A part under the standard file field
    pub fn file(
        file_name: impl Into<String>,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self::new(FILE_FIELD_NAME, file_name, reader)
    }
}

/// One accepted part
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadItem {
    pub guid: ObjectId,
    pub file_name: String,
}

/// Result of a whole upload request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    /// Remaining quota of the uploading user
    pub disk_quota: i64,
    pub result: Vec<UploadItem>,
}

/// Drives uploads through the gate, the quota writer and the store
#[derive(Clone)]
pub struct UploadOrchestrator {
    store: ObjectStore,
    quota: QuotaManager,
    gate: Arc<dyn ContentGate>,
    sniff_len: usize,
}

impl UploadOrchestrator {
    pub fn new(
        store: ObjectStore,
        quota: QuotaManager,
        gate: Arc<dyn ContentGate>,
        sniff_len: usize,
    ) -> Self {
        Self {
            store,
            quota,
            gate,
            sniff_len,
        }
    }

    /// Store every part of an upload in order.
    ///
    /// Stops at the first failing part; parts stored before it stay stored.
    pub async fn upload<S>(
        &self,
        address: &Address,
        identity: &UserIdentity,
        parts: S,
    ) -> Result<UploadReceipt, UploadError>
    where
        S: Stream<Item = UploadPart> + Unpin,
    {
        if !identity.is_authorized() {
            tracing::info!("Rejected upload to {} from user {}", address, identity.id());
            return Err(UploadError::Unauthorized);
        }

        let user = identity.id();
        let limit = self.quota.max_upload_size(address);
        let mut remaining = limit;
        let mut receipt = UploadReceipt {
            disk_quota: 0,
            result: Vec::new(),
        };

        let mut parts = parts;
        while let Some(part) = parts.next().await {
            if part.field_name != FILE_FIELD_NAME {
                return Err(UploadError::BadRequest(format!(
                    "\"{}\" field is expected",
                    FILE_FIELD_NAME
                )));
            }

            let item = self.store_part(address, user, part, &mut remaining, limit).await?;
            receipt.result.push(item);
            receipt.disk_quota = self.quota.get_user_quota(user, address).await?;
        }

        if receipt.result.is_empty() {
            return Err(UploadError::BadRequest(format!(
                "form field \"{}\" is expected",
                FILE_FIELD_NAME
            )));
        }

        Ok(receipt)
    }

    async fn store_part(
        &self,
        address: &Address,
        user: UserId,
        part: UploadPart,
        remaining: &mut i64,
        limit: i64,
    ) -> Result<UploadItem, UploadError> {
        let started = Instant::now();
        let UploadPart {
            file_name,
            mut reader,
            ..
        } = part;

        let mut prefix = Vec::with_capacity(self.sniff_len);
        (&mut reader)
            .take(self.sniff_len as u64)
            .read_to_end(&mut prefix)
            .await
            .map_err(StorageError::Io)?;

        let content_type = self.gate.detect(&file_name, &prefix);
        tracing::info!("File: {}; Content type: {}", file_name, content_type);
        if !self.gate.is_allowed(&content_type) {
            return Err(UploadError::ContentTypeNotAllowed(content_type));
        }

        let allowance = u64::try_from(*remaining).unwrap_or(0);
        let mut body = Cursor::new(prefix).chain(reader);

        let pending = self.store.create(address, &file_name).await?;
        let mut writer = QuotaWriter::new(pending, self.quota.clone(), user, address.clone());
        let copied = writer.copy_and_close(&mut (&mut body).take(allowance)).await;
        let pending = writer.into_inner();

        let outcome = match copied {
            Ok(n) if n == allowance => ensure_drained(&mut body, limit).await.map(|()| n),
            Ok(n) => Ok(n),
            Err(e) => Err(UploadError::from(e)),
        };

        let written = match outcome {
            Ok(n) => n,
            Err(e) => {
                settle_failed(pending, &e).await;
                return Err(e);
            }
        };

        let stored = pending.commit().await?;
        *remaining -= written as i64;

        let secs = started.elapsed().as_secs_f64();
        let mbs = written as f64 / 1_000_000.0;
        tracing::info!(
            "Written: {:.2} Mb ({} bytes) in {:.2} seconds. Speed: {:.2} Mb/s",
            mbs,
            written,
            secs,
            if secs > 0.0 { mbs / secs } else { 0.0 }
        );

        Ok(UploadItem {
            guid: stored.id,
            file_name: stored.original_name,
        })
    }
}

/// Fails with `TooLarge` when `body` has bytes left past the allowance.
/// The extra byte is only inspected, never stored or charged.
async fn ensure_drained<R>(body: &mut R, limit: i64) -> Result<(), UploadError>
where
    R: AsyncRead + Unpin,
{
    let mut next = [0u8; 1];
    match body.read(&mut next).await.map_err(StorageError::Io)? {
        0 => Ok(()),
        _ => Err(UploadError::TooLarge { limit }),
    }
}

/// Keep a part cut short by quota, drop it on any other failure.
/// Charged bytes are never refunded either way.
async fn settle_failed(pending: PendingObject, cause: &UploadError) {
    let id = pending.id();
    let out_of_quota = matches!(cause, UploadError::Quota(QuotaError::OutOfQuota));

    if !out_of_quota || pending.written() == 0 {
        let written = pending.written();
        match pending.abandon().await {
            Ok(()) => tracing::warn!("Discarded object {} ({} bytes): {}", id, written, cause),
            Err(e) => tracing::warn!("Unable to discard object {}: {}", id, e),
        }
        return;
    }

    match pending.commit().await {
        Ok(stored) => tracing::warn!(
            "Kept partial object {} ({} bytes): {}",
            stored.id,
            stored.byte_length,
            cause
        ),
        Err(e) => tracing::warn!("Unable to keep partial object {}: {}", id, e),
    }
}
