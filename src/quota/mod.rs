//! Quota Module - byte allowances per application and per user
//!
//! A [`QuotaBackend`] is the durable source of truth for remaining
//! allowance. The [`QuotaManager`] composes one backend with static limits,
//! and the [`QuotaWriter`] spends that allowance while bytes stream to disk,
//! going back to the backend once per cache window.

mod ledger;
mod manager;
mod memory;
pub mod protocol;
mod reader;
mod remote;
mod writer;

pub use ledger::LocalLedgerBackend;
pub use manager::{QuotaManager, QuotaSettings};
pub use memory::MemoryBackend;
pub use reader::QuotaLimitedReader;
pub use remote::RemoteAuthorityBackend;
pub use writer::QuotaWriter;

use crate::identity::UserId;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuotaError {
    #[error("Quota service unreachable: {0}")]
    Transport(String),

    #[error("Quota protocol error: {0}")]
    Protocol(String),

    #[error("Out of quota")]
    OutOfQuota,

    #[error("Quota ledger error: {0}")]
    Ledger(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Name of one counter inside an application's ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountKey {
    App,
    User(UserId),
}

impl AccountKey {
    /// Key under which the account is persisted
    pub fn ledger_key(&self) -> String {
        match self {
            AccountKey::App => "app".to_string(),
            AccountKey::User(user) => user.to_string(),
        }
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.ledger_key())
    }
}

/// Durable store of remaining byte allowances.
///
/// Values are remaining bytes and may go negative: a writer can overdraw
/// an account by at most one in-flight chunk. Unknown accounts read as zero.
#[async_trait]
pub trait QuotaBackend: Send + Sync {
    /// Human-readable name of this backend, used in logs
    fn name(&self) -> &str;

    /// Subtract `delta` bytes from the application account
    async fn register_app_space(&self, app: &str, delta: i64) -> Result<(), QuotaError>;

    /// Subtract `delta` bytes from a user account of the application
    async fn register_user_space(
        &self,
        user: UserId,
        app: &str,
        delta: i64,
    ) -> Result<(), QuotaError>;

    async fn get_app_quota(&self, app: &str) -> Result<i64, QuotaError>;

    async fn get_user_quota(&self, user: UserId, app: &str) -> Result<i64, QuotaError>;

    /// Charge both accounts.
    ///
    /// The application account is charged first; if the user charge then
    /// fails, the application charge stays in place. Backends able to apply
    /// both in one step override this.
    async fn register_space(&self, user: UserId, app: &str, delta: i64) -> Result<(), QuotaError> {
        self.register_app_space(app, delta).await?;
        self.register_user_space(user, app, delta).await
    }
}
