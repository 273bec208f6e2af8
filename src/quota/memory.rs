//! In-process quota backend

use super::{AccountKey, QuotaBackend, QuotaError};
use crate::identity::UserId;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Accounts kept in memory behind a single lock
#[derive(Debug, Default)]
pub struct MemoryBackend {
    accounts: Mutex<HashMap<(String, AccountKey), i64>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_app_quota(&self, app: &str, bytes: i64) {
        self.accounts
            .lock()
            .insert((app.to_string(), AccountKey::App), bytes);
    }

    pub fn set_user_quota(&self, user: UserId, app: &str, bytes: i64) {
        self.accounts
            .lock()
            .insert((app.to_string(), AccountKey::User(user)), bytes);
    }

    fn get(&self, app: &str, key: AccountKey) -> i64 {
        self.accounts
            .lock()
            .get(&(app.to_string(), key))
            .copied()
            .unwrap_or(0)
    }

    fn charge(
        accounts: &mut HashMap<(String, AccountKey), i64>,
        app: &str,
        key: AccountKey,
        delta: i64,
    ) {
        *accounts.entry((app.to_string(), key)).or_insert(0) -= delta;
    }
}

#[async_trait]
impl QuotaBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn register_app_space(&self, app: &str, delta: i64) -> Result<(), QuotaError> {
        Self::charge(&mut self.accounts.lock(), app, AccountKey::App, delta);
        Ok(())
    }

    async fn register_user_space(
        &self,
        user: UserId,
        app: &str,
        delta: i64,
    ) -> Result<(), QuotaError> {
        Self::charge(&mut self.accounts.lock(), app, AccountKey::User(user), delta);
        Ok(())
    }

    async fn get_app_quota(&self, app: &str) -> Result<i64, QuotaError> {
        Ok(self.get(app, AccountKey::App))
    }

    async fn get_user_quota(&self, user: UserId, app: &str) -> Result<i64, QuotaError> {
        Ok(self.get(app, AccountKey::User(user)))
    }

    async fn register_space(&self, user: UserId, app: &str, delta: i64) -> Result<(), QuotaError> {
        let mut accounts = self.accounts.lock();
        Self::charge(&mut accounts, app, AccountKey::App, delta);
        Self::charge(&mut accounts, app, AccountKey::User(user), delta);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_account_is_zero() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get_app_quota("notes").await.unwrap(), 0);
        assert_eq!(backend.get_user_quota(UserId::new(1), "notes").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_accounts_scoped_by_application() {
        let backend = MemoryBackend::new();
        backend.set_user_quota(UserId::new(1), "notes", 500);
        backend.set_user_quota(UserId::new(1), "photos", 900);

        backend.register_space(UserId::new(1), "notes", 200).await.unwrap();

        assert_eq!(backend.get_user_quota(UserId::new(1), "notes").await.unwrap(), 300);
        assert_eq!(backend.get_user_quota(UserId::new(1), "photos").await.unwrap(), 900);
        // Overdraft is representable
        assert_eq!(backend.get_app_quota("notes").await.unwrap(), -200);
    }
}
