//! Quota Manager - one backend plus the static upload limits

use super::{QuotaBackend, QuotaError};
use crate::identity::UserId;
use crate::storage::Address;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Static quota settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaSettings {
    /// Largest request body accepted for one upload (bytes)
    pub max_upload_size: i64,

    /// Bytes a writer may spend between two backend checks
    pub cache_window_size: i64,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            max_upload_size: 100 << 20, // 100 MB
            cache_window_size: 1 << 20, // 1 MB
        }
    }
}

/// Uniform quota capability over any [`QuotaBackend`]
#[derive(Clone)]
pub struct QuotaManager {
    backend: Arc<dyn QuotaBackend>,
    settings: QuotaSettings,
}

impl QuotaManager {
    pub fn new(backend: Arc<dyn QuotaBackend>, settings: QuotaSettings) -> Self {
        Self { backend, settings }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Upper bound on one upload into `address`
    pub fn max_upload_size(&self, _address: &Address) -> i64 {
        self.settings.max_upload_size
    }

    pub fn cache_window_size(&self) -> i64 {
        self.settings.cache_window_size
    }

    pub async fn get_app_quota(&self, address: &Address) -> Result<i64, QuotaError> {
        self.backend.get_app_quota(address.application()).await
    }

    pub async fn get_user_quota(&self, user: UserId, address: &Address) -> Result<i64, QuotaError> {
        self.backend.get_user_quota(user, address.application()).await
    }

    /// Charge `used` bytes to the application and then to the user
    pub async fn register_space(
        &self,
        user: UserId,
        address: &Address,
        used: i64,
    ) -> Result<(), QuotaError> {
        tracing::debug!(
            "Registering used space: {} bytes for user {} in {} via {}",
            used,
            user,
            address,
            self.backend.name()
        );
        self.backend
            .register_space(user, address.application(), used)
            .await
    }

    /// Bytes that may be spent before the next check:
    /// `min(app quota, user quota, cache window)`
    pub async fn spendable(&self, user: UserId, address: &Address) -> Result<i64, QuotaError> {
        let app_quota = self.get_app_quota(address).await?;
        let user_quota = self.get_user_quota(user, address).await?;
        let spendable = app_quota.min(user_quota).min(self.settings.cache_window_size);

        tracing::debug!(
            "Quota updated: {} (uq: {}, aq: {})",
            spendable,
            user_quota,
            app_quota
        );
        Ok(spendable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::MemoryBackend;
    use crate::storage::WorkspaceId;

    fn create_test_manager(app: i64, user: i64, window: i64) -> QuotaManager {
        let backend = MemoryBackend::new();
        backend.set_app_quota("notes", app);
        backend.set_user_quota(UserId::new(1), "notes", user);
        QuotaManager::new(
            Arc::new(backend),
            QuotaSettings {
                max_upload_size: 1 << 20,
                cache_window_size: window,
            },
        )
    }

    #[tokio::test]
    async fn test_register_space_decrements_by_exactly_k() {
        let manager = create_test_manager(5000, 3000, 512);
        let address = Address::new("notes", WorkspaceId::new(1)).unwrap();
        let user = UserId::new(1);

        manager.register_space(user, &address, 1234).await.unwrap();

        assert_eq!(manager.get_app_quota(&address).await.unwrap(), 5000 - 1234);
        assert_eq!(manager.get_user_quota(user, &address).await.unwrap(), 3000 - 1234);
    }

    #[tokio::test]
    async fn test_spendable_is_smallest_limit() {
        let address = Address::new("notes", WorkspaceId::new(1)).unwrap();
        let user = UserId::new(1);

        let manager = create_test_manager(5000, 3000, 512);
        assert_eq!(manager.spendable(user, &address).await.unwrap(), 512);

        let manager = create_test_manager(5000, 100, 512);
        assert_eq!(manager.spendable(user, &address).await.unwrap(), 100);

        let manager = create_test_manager(-5, 100, 512);
        assert_eq!(manager.spendable(user, &address).await.unwrap(), -5);
    }

    #[tokio::test]
    async fn test_app_charge_kept_when_user_charge_fails() {
        struct FailingUser(MemoryBackend);

        #[async_trait::async_trait]
        impl QuotaBackend for FailingUser {
            fn name(&self) -> &str {
                "failing-user"
            }
            async fn register_app_space(&self, app: &str, delta: i64) -> Result<(), QuotaError> {
                self.0.register_app_space(app, delta).await
            }
            async fn register_user_space(
                &self,
                _user: UserId,
                _app: &str,
                _delta: i64,
            ) -> Result<(), QuotaError> {
                Err(QuotaError::Transport("gone".into()))
            }
            async fn get_app_quota(&self, app: &str) -> Result<i64, QuotaError> {
                self.0.get_app_quota(app).await
            }
            async fn get_user_quota(&self, user: UserId, app: &str) -> Result<i64, QuotaError> {
                self.0.get_user_quota(user, app).await
            }
        }

        let inner = MemoryBackend::new();
        inner.set_app_quota("notes", 1000);
        let manager = QuotaManager::new(Arc::new(FailingUser(inner)), QuotaSettings::default());
        let address = Address::new("notes", WorkspaceId::new(1)).unwrap();

        let result = manager.register_space(UserId::new(1), &address, 300).await;

        assert!(matches!(result, Err(QuotaError::Transport(_))));
        assert_eq!(manager.get_app_quota(&address).await.unwrap(), 700);
    }
}
