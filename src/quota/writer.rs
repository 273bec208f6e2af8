//! Quota-enforcing writer
//!
//! Wraps a sink and spends a locally cached window of allowance. When the
//! window is used up the writer synchronously registers what it spent and
//! asks the manager for a fresh window, so the backend sees one round-trip
//! per `cache_window_size` bytes instead of one per write.
//!
//! Enforcement is only as fresh as the last resync: concurrent writers on
//! the same account may each overspend by up to one window.

use super::{QuotaError, QuotaManager};
use crate::identity::UserId;
use crate::storage::Address;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Sink wrapper that stops accepting bytes once quota runs out.
///
/// [`close`](Self::close) must run on every exit path, otherwise bytes
/// already on disk are never charged. [`copy_and_close`](Self::copy_and_close)
/// does that for whole streams.
pub struct QuotaWriter<W> {
    sink: W,
    manager: QuotaManager,
    user: UserId,
    address: Address,

    /// Bytes allowed before the next backend check
    spendable: i64,

    /// Bytes written and not yet registered
    spent_since_sync: Unregistered,

    total_written: u64,
}

/// Pending charge of a writer; warns if it is dropped before `close`
#[derive(Debug, Default)]
struct Unregistered(i64);

impl Drop for Unregistered {
    fn drop(&mut self) {
        if self.0 > 0 {
            tracing::warn!(
                "Quota writer dropped without close: {} bytes were never registered",
                self.0
            );
        }
    }
}

impl<W> QuotaWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Wrap `sink`; the first write fetches the initial window
    pub fn new(sink: W, manager: QuotaManager, user: UserId, address: Address) -> Self {
        Self {
            sink,
            manager,
            user,
            address,
            spendable: 0,
            spent_since_sync: Unregistered::default(),
            total_written: 0,
        }
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn spendable(&self) -> i64 {
        self.spendable
    }

    pub fn spent_since_sync(&self) -> i64 {
        self.spent_since_sync.0
    }

    pub fn get_ref(&self) -> &W {
        &self.sink
    }

    /// Give back the sink. Call [`close`](Self::close) first; bytes still
    /// unregistered are logged and dropped.
    pub fn into_inner(self) -> W {
        self.sink
    }

    /// Register pending bytes, then recompute the window
    async fn resync(&mut self) -> Result<(), QuotaError> {
        self.flush_spent().await?;
        self.spendable = self.manager.spendable(self.user, &self.address).await?;
        Ok(())
    }

    async fn flush_spent(&mut self) -> Result<(), QuotaError> {
        if self.spent_since_sync.0 > 0 {
            self.manager
                .register_space(self.user, &self.address, self.spent_since_sync.0)
                .await?;
            self.spent_since_sync.0 = 0;
        }
        Ok(())
    }

    /// Write at most what the current window allows.
    ///
    /// A short count is normal backpressure: the caller resubmits the
    /// rest. Fails with [`QuotaError::OutOfQuota`] without writing anything
    /// once the refreshed window is not positive.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, QuotaError> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.spent_since_sync.0 >= self.spendable {
            self.resync().await?;
        }

        if self.spendable <= 0 {
            tracing::info!(
                "User {} is out of quota in {} after {} bytes",
                self.user,
                self.address,
                self.total_written
            );
            return Err(QuotaError::OutOfQuota);
        }

        let allowed = (self.spendable - self.spent_since_sync.0) as u64;
        let len = buf.len().min(usize::try_from(allowed).unwrap_or(usize::MAX));
        let n = self.sink.write(&buf[..len]).await?;

        self.spent_since_sync.0 += n as i64;
        self.total_written += n as u64;

        tracing::trace!(
            "Part written {}/{} bytes (quota: {}/{}), total: {} bytes",
            n,
            buf.len(),
            self.spent_since_sync.0,
            self.spendable,
            self.total_written
        );
        Ok(n)
    }

    /// Write the whole buffer, resyncing as many times as needed
    pub async fn write_all(&mut self, mut buf: &[u8]) -> Result<(), QuotaError> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(QuotaError::Io(std::io::ErrorKind::WriteZero.into()));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Stream `reader` through the writer until it ends or quota runs out
    pub async fn copy_from<R>(&mut self, reader: &mut R) -> Result<u64, QuotaError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut copied = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(copied);
            }
            self.write_all(&buf[..n]).await?;
            copied += n as u64;
        }
    }

    /// Register whatever was spent since the last sync and flush the sink.
    /// Safe to call more than once.
    pub async fn close(&mut self) -> Result<(), QuotaError> {
        if self.spent_since_sync.0 > 0 {
            tracing::debug!(
                "Closing writer for user {} in {}: flushing {} bytes",
                self.user,
                self.address,
                self.spent_since_sync.0
            );
        }
        self.flush_spent().await?;
        self.sink.flush().await?;
        Ok(())
    }

    /// [`copy_from`](Self::copy_from) followed by [`close`](Self::close),
    /// which runs whatever the copy returned. A copy error wins over a
    /// close error.
    pub async fn copy_and_close<R>(&mut self, reader: &mut R) -> Result<u64, QuotaError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let copied = self.copy_from(reader).await;
        let closed = self.close().await;
        let copied = copied?;
        closed?;
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::testing::CountingBackend;
    use crate::quota::{MemoryBackend, QuotaBackend, QuotaSettings};
    use crate::storage::WorkspaceId;
    use std::sync::Arc;

    const UNLIMITED: i64 = 1 << 40;

    fn test_address() -> Address {
        Address::new("notes", WorkspaceId::new(1)).unwrap()
    }

    fn create_test_writer(
        app: i64,
        user: i64,
        window: i64,
    ) -> (QuotaWriter<Vec<u8>>, Arc<CountingBackend>) {
        let memory = Arc::new(MemoryBackend::new());
        memory.set_app_quota("notes", app);
        memory.set_user_quota(UserId::new(1), "notes", user);
        let backend = Arc::new(CountingBackend::new(memory));

        let manager = QuotaManager::new(
            backend.clone(),
            QuotaSettings {
                max_upload_size: UNLIMITED,
                cache_window_size: window,
            },
        );
        let writer = QuotaWriter::new(Vec::new(), manager, UserId::new(1), test_address());
        (writer, backend)
    }

    #[tokio::test]
    async fn test_window_resync_within_one_call() {
        let (mut writer, backend) = create_test_writer(1000, 1000, 512);
        let data = vec![7u8; 700];

        // A single write is truncated at the window edge
        assert_eq!(writer.write(&data).await.unwrap(), 512);
        assert_eq!(backend.registrations(), 0);

        writer.write_all(&data[512..]).await.unwrap();
        assert_eq!(backend.registered_bytes(), vec![512]);

        writer.close().await.unwrap();
        assert_eq!(writer.total_written(), 700);
        assert_eq!(backend.registered_bytes(), vec![512, 188]);
        assert_eq!(backend.inner.get_app_quota("notes").await.unwrap(), 300);
        assert_eq!(
            backend.inner.get_user_quota(UserId::new(1), "notes").await.unwrap(),
            300
        );
        assert_eq!(writer.into_inner(), data);
    }

    #[tokio::test]
    async fn test_hard_stop() {
        let (mut writer, backend) = create_test_writer(1000, 100, 512);

        let result = writer.write_all(&[1u8; 150]).await;
        assert!(matches!(result, Err(QuotaError::OutOfQuota)));
        assert_eq!(writer.total_written(), 100);
        assert_eq!(backend.registered_bytes(), vec![100]);

        // Further writes stay rejected and register nothing new
        let again = writer.write(&[1u8; 10]).await;
        assert!(matches!(again, Err(QuotaError::OutOfQuota)));
        writer.close().await.unwrap();
        assert_eq!(backend.registrations(), 1);
        assert_eq!(writer.into_inner().len(), 100);
    }

    #[tokio::test]
    async fn test_no_allowance_writes_nothing() {
        let (mut writer, backend) = create_test_writer(0, 1000, 512);

        assert!(matches!(writer.write(b"abc").await, Err(QuotaError::OutOfQuota)));
        writer.close().await.unwrap();
        assert_eq!(backend.registrations(), 0);
        assert!(writer.into_inner().is_empty());
    }

    #[tokio::test]
    async fn test_window_amortization() {
        for total in [1000usize, 1050, 99, 1] {
            let (mut writer, backend) = create_test_writer(UNLIMITED, UNLIMITED, 100);
            let data = vec![3u8; total];

            for chunk in data.chunks(7) {
                writer.write_all(chunk).await.unwrap();
            }
            writer.close().await.unwrap();

            assert_eq!(backend.registrations(), total.div_ceil(100), "total {}", total);
            assert_eq!(backend.registered_bytes().iter().sum::<i64>(), total as i64);
        }
    }

    #[tokio::test]
    async fn test_flush_on_close() {
        let (mut writer, backend) = create_test_writer(UNLIMITED, UNLIMITED, 100);

        writer.write_all(&[0u8; 30]).await.unwrap();
        assert_eq!(writer.spent_since_sync(), 30);

        writer.close().await.unwrap();
        assert_eq!(backend.registered_bytes(), vec![30]);

        // Idempotent
        writer.close().await.unwrap();
        assert_eq!(backend.registrations(), 1);
    }

    #[tokio::test]
    async fn test_copy_and_close_flushes_after_source_error() {
        let (mut writer, backend) = create_test_writer(UNLIMITED, UNLIMITED, 100);
        let mut source = tokio_test::io::Builder::new()
            .read(b"first bytes")
            .read_error(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "client went away",
            ))
            .build();

        let result = writer.copy_and_close(&mut source).await;

        assert!(matches!(result, Err(QuotaError::Io(_))));
        assert_eq!(backend.registered_bytes(), vec![11]);
    }

    #[tokio::test]
    async fn test_copy_and_close_stops_on_quota() {
        let (mut writer, backend) = create_test_writer(UNLIMITED, 250, 100);
        let data = vec![9u8; 1000];

        let result = writer.copy_and_close(&mut data.as_slice()).await;

        assert!(matches!(result, Err(QuotaError::OutOfQuota)));
        assert_eq!(writer.total_written(), 250);
        assert_eq!(backend.registered_bytes().iter().sum::<i64>(), 250);
        assert_eq!(
            backend.inner.get_user_quota(UserId::new(1), "notes").await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_drop_without_close_registers_nothing() {
        let (mut writer, backend) = create_test_writer(UNLIMITED, UNLIMITED, 100);

        writer.write_all(&[0u8; 30]).await.unwrap();
        let sink = writer.into_inner();

        assert_eq!(sink.len(), 30);
        assert_eq!(backend.registrations(), 0);
    }
}
