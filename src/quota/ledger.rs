//! Local Ledger Backend - one JSON file of counters per application
//!
//! ```text
//! {root}/{application}/{ledger_file}      {"app": 1048576, "1": 524288}
//! ```
//!
//! A ledger missing on first access is copied from the template. Every
//! read-modify-write of an application's ledger runs under that
//! application's lock, and the file is replaced atomically via rename.

use super::{AccountKey, QuotaBackend, QuotaError};
use crate::identity::UserId;

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;

type Ledger = BTreeMap<String, i64>;

/// Quota accounts persisted in per-application JSON files
pub struct LocalLedgerBackend {
    /// Directory holding one subdirectory per application
    root: PathBuf,

    /// File name of the ledger inside the application directory
    ledger_file: String,

    /// Template copied when an application has no ledger yet
    template: PathBuf,

    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LocalLedgerBackend {
    pub fn new(
        root: impl Into<PathBuf>,
        ledger_file: impl Into<String>,
        template: impl Into<PathBuf>,
    ) -> Self {
        Self {
            root: root.into(),
            ledger_file: ledger_file.into(),
            template: template.into(),
            locks: DashMap::new(),
        }
    }

    /// Location of an application's ledger
    pub fn ledger_path(&self, app: &str) -> PathBuf {
        self.root.join(app).join(&self.ledger_file)
    }

    fn lock_for(&self, app: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(app.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Ensure the ledger exists, seeding it from the template
    async fn prepare(&self, app: &str) -> Result<PathBuf, QuotaError> {
        let path = self.ledger_path(app);
        if fs::try_exists(&path).await? {
            return Ok(path);
        }

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }

        match fs::copy(&self.template, &path).await {
            Ok(_) => {
                tracing::info!("Created quota ledger for {} from {}", app, self.template.display());
                Ok(path)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(QuotaError::Ledger(format!(
                "ledger template {} not found",
                self.template.display()
            ))),
            Err(e) => Err(QuotaError::Io(e)),
        }
    }

    async fn load(&self, app: &str) -> Result<Ledger, QuotaError> {
        let path = self.prepare(app).await?;
        let bytes = fs::read(&path).await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Ledger::new());
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| QuotaError::Ledger(format!("{}: {}", path.display(), e)))
    }

    async fn save(&self, app: &str, ledger: &Ledger) -> Result<(), QuotaError> {
        let path = self.ledger_path(app);
        let json =
            serde_json::to_vec_pretty(ledger).map_err(|e| QuotaError::Ledger(e.to_string()))?;
        let tmp = tmp_path(&path);
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Read-modify-write of one application's ledger under its lock
    async fn charge(&self, app: &str, keys: &[AccountKey], delta: i64) -> Result<(), QuotaError> {
        let lock = self.lock_for(app);
        let _guard = lock.lock().await;

        let mut ledger = self.load(app).await?;
        for key in keys {
            *ledger.entry(key.ledger_key()).or_insert(0) -= delta;
        }
        self.save(app, &ledger).await?;

        tracing::debug!("Charged {} bytes to {:?} of {}", delta, keys, app);
        Ok(())
    }

    async fn remaining(&self, app: &str, key: AccountKey) -> Result<i64, QuotaError> {
        let lock = self.lock_for(app);
        let _guard = lock.lock().await;

        let ledger = self.load(app).await?;
        Ok(ledger.get(&key.ledger_key()).copied().unwrap_or(0))
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[async_trait]
impl QuotaBackend for LocalLedgerBackend {
    fn name(&self) -> &str {
        "local-ledger"
    }

    async fn register_app_space(&self, app: &str, delta: i64) -> Result<(), QuotaError> {
        self.charge(app, &[AccountKey::App], delta).await
    }

    async fn register_user_space(
        &self,
        user: UserId,
        app: &str,
        delta: i64,
    ) -> Result<(), QuotaError> {
        self.charge(app, &[AccountKey::User(user)], delta).await
    }

    async fn get_app_quota(&self, app: &str) -> Result<i64, QuotaError> {
        self.remaining(app, AccountKey::App).await
    }

    async fn get_user_quota(&self, user: UserId, app: &str) -> Result<i64, QuotaError> {
        self.remaining(app, AccountKey::User(user)).await
    }

    async fn register_space(&self, user: UserId, app: &str, delta: i64) -> Result<(), QuotaError> {
        self.charge(app, &[AccountKey::App, AccountKey::User(user)], delta).await
    }
}
