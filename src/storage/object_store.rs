//! Object Store - blob files on the local filesystem
//!
//! Layout under the root directory:
//!
//! ```text
//! {application}/{workspace}/{id}        blob content
//! {application}/{workspace}/{id}.name   original filename
//! {application}/{workspace}/{id}.part   blob still being streamed
//! ```
//!
//! Content is streamed into the `.part` file and renamed into place on
//! commit, so a reader never observes a blob that is still being written.

use super::{Address, StorageError};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

const NAME_SUFFIX: &str = "name";
const PART_SUFFIX: &str = "part";

/// Random, never reused handle of a stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Generate a fresh identifier from the OS random source
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for ObjectId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| StorageError::InvalidIdentifier(s.to_string()))
    }
}

/// A committed blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredObject {
    pub id: ObjectId,

    /// Filename supplied by the uploader
    pub original_name: String,

    pub address: Address,

    /// Size of the blob on disk
    pub byte_length: u64,
}

/// Filesystem-backed blob store
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every object of an address
    pub fn address_dir(&self, address: &Address) -> PathBuf {
        self.root
            .join(address.application())
            .join(address.workspace().to_string())
    }

    /// Deterministic location of a committed blob
    pub fn object_path(&self, address: &Address, id: &ObjectId) -> PathBuf {
        self.address_dir(address).join(id.to_string())
    }

    fn sidecar_path(&self, address: &Address, id: &ObjectId, suffix: &str) -> PathBuf {
        self.address_dir(address).join(format!("{}.{}", id, suffix))
    }

    /// Open a streaming sink for a new object.
    ///
    /// The name sidecar is written immediately; failing to write it is
    /// logged and otherwise ignored.
    pub async fn create(
        &self,
        address: &Address,
        name: &str,
    ) -> Result<PendingObject, StorageError> {
        let id = ObjectId::generate();
        let dir = self.address_dir(address);
        fs::create_dir_all(&dir).await?;

        let name_path = self.sidecar_path(address, &id, NAME_SUFFIX);
        if let Err(e) = fs::write(&name_path, name.as_bytes()).await {
            tracing::warn!("Unable to persist name of {} in {}: {}", id, address, e);
        }

        let part_path = self.sidecar_path(address, &id, PART_SUFFIX);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part_path)
            .await?;

        tracing::debug!("Created object {} in {}", id, address);

        Ok(PendingObject {
            id,
            address: address.clone(),
            original_name: name.to_string(),
            final_path: self.object_path(address, &id),
            part_path,
            file,
            written: 0,
        })
    }

    /// Copy a whole stream into a new object
    pub async fn write<R>(
        &self,
        address: &Address,
        name: &str,
        source: &mut R,
    ) -> Result<StoredObject, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut pending = self.create(address, name).await?;
        tokio::io::copy(source, &mut pending).await?;
        pending.commit().await
    }

    /// Read a committed blob
    pub async fn read(&self, address: &Address, id: &ObjectId) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(address, id);
        fs::read(&path).await.map_err(|e| not_found_or_io(e, address, id))
    }

    /// Original filename recorded for an object
    pub async fn read_name(
        &self,
        address: &Address,
        id: &ObjectId,
    ) -> Result<String, StorageError> {
        let path = self.sidecar_path(address, id, NAME_SUFFIX);
        fs::read_to_string(&path)
            .await
            .map_err(|e| not_found_or_io(e, address, id))
    }
}

fn not_found_or_io(e: io::Error, address: &Address, id: &ObjectId) -> StorageError {
    if e.kind() == io::ErrorKind::NotFound {
        StorageError::NotFound(format!("{}/{}", address, id))
    } else {
        StorageError::Io(e)
    }
}

/// Object whose content is still being streamed
#[derive(Debug)]
pub struct PendingObject {
    id: ObjectId,
    address: Address,
    original_name: String,
    part_path: PathBuf,
    final_path: PathBuf,
    file: File,
    written: u64,
}

impl PendingObject {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and move the content into its final place
    pub async fn commit(mut self) -> Result<StoredObject, StorageError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);
        fs::rename(&self.part_path, &self.final_path).await?;

        tracing::info!(
            "Stored object {} ({} bytes) in {}",
            self.id,
            self.written,
            self.address
        );

        Ok(StoredObject {
            id: self.id,
            original_name: self.original_name,
            address: self.address,
            byte_length: self.written,
        })
    }

    /// Discard the partial content; the name sidecar goes with it
    pub async fn abandon(self) -> Result<(), StorageError> {
        drop(self.file);
        fs::remove_file(&self.part_path).await?;

        let name_path = self.part_path.with_extension(NAME_SUFFIX);
        if let Err(e) = fs::remove_file(&name_path).await {
            tracing::warn!("Unable to remove name of abandoned object {}: {}", self.id, e);
        }

        tracing::info!("Abandoned object {} in {}", self.id, self.address);
        Ok(())
    }
}

impl AsyncWrite for PendingObject {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let poll = Pin::new(&mut this.file).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            this.written += *n as u64;
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}
