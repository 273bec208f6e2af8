//! Read-side quota limiter
//!
//! Caps how much of a source may be consumed by what the backend currently
//! grants. It asks for more allowance whenever the granted amount is used
//! up and reports end of stream once nothing more is granted. It never
//! registers consumption; pair it with a [`QuotaWriter`](super::QuotaWriter)
//! for that.

use super::{QuotaError, QuotaManager};
use crate::identity::UserId;
use crate::storage::Address;

use tokio::io::{AsyncRead, AsyncReadExt};

pub struct QuotaLimitedReader<R> {
    reader: R,
    manager: QuotaManager,
    user: UserId,
    address: Address,

    /// Total bytes granted so far
    quota: i64,

    read: i64,
}

impl<R> QuotaLimitedReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, manager: QuotaManager, user: UserId, address: Address) -> Self {
        Self {
            reader,
            manager,
            user,
            address,
            quota: 0,
            read: 0,
        }
    }

    pub fn bytes_read(&self) -> i64 {
        self.read
    }

    /// Read into `buf`; `Ok(0)` means the source ended or quota ran out
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, QuotaError> {
        if self.read >= self.quota {
            let granted = self.manager.spendable(self.user, &self.address).await?;
            if granted > 0 {
                self.quota += granted;
            }
        }

        if self.read >= self.quota {
            return Ok(0);
        }

        let allowed = (self.quota - self.read) as u64;
        let len = buf.len().min(usize::try_from(allowed).unwrap_or(usize::MAX));
        let n = self.reader.read(&mut buf[..len]).await?;
        self.read += n as i64;
        Ok(n)
    }

    /// Read until the source ends or quota runs out
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize, QuotaError> {
        let mut buf = [0u8; 8 * 1024];
        let mut total = 0;
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&buf[..n]);
            total += n;
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{MemoryBackend, QuotaSettings};
    use crate::storage::WorkspaceId;
    use std::sync::Arc;

    fn create_test_manager(user_quota: i64, window: i64) -> QuotaManager {
        let backend = MemoryBackend::new();
        backend.set_app_quota("notes", 1 << 30);
        backend.set_user_quota(UserId::new(1), "notes", user_quota);
        QuotaManager::new(
            Arc::new(backend),
            QuotaSettings {
                max_upload_size: 1 << 30,
                cache_window_size: window,
            },
        )
    }

    #[tokio::test]
    async fn test_reads_in_granted_windows() {
        let manager = create_test_manager(10_000, 64);
        let address = Address::new("notes", WorkspaceId::new(1)).unwrap();
        let data = vec![5u8; 1000];

        let mut reader = QuotaLimitedReader::new(data.as_slice(), manager, UserId::new(1), address);
        let mut out = Vec::new();
        let n = reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(n, 1000);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_stops_at_exhausted_quota() {
        let manager = create_test_manager(0, 64);
        let address = Address::new("notes", WorkspaceId::new(1)).unwrap();

        let mut reader =
            QuotaLimitedReader::new(&b"never read"[..], manager, UserId::new(1), address);
        let mut buf = [0u8; 16];

        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        assert_eq!(reader.bytes_read(), 0);
    }
}
