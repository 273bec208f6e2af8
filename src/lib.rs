//! Quotabin Core - Quota-enforced streaming object storage
//!
//! This crate stores uploaded binaries per application and workspace while
//! enforcing per-application and per-user disk quotas as the bytes stream
//! in. Quota lives in a pluggable backend: a local JSON ledger per
//! application or a remote quota authority spoken to over a small line
//! protocol.

pub mod identity;
pub mod quota;
pub mod storage;
pub mod upload;

use identity::{AllowListAuthorizer, Authorizer, UserId, UserIdentity};
use quota::{
    LocalLedgerBackend, QuotaBackend, QuotaManager, QuotaSettings, RemoteAuthorityBackend,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use storage::{Address, ObjectId, ObjectStore};
use thiserror::Error;
use upload::{AllowList, UploadOrchestrator, UploadPart, UploadReceipt};

/// Main error type for Quotabin operations
#[derive(Error, Debug)]
pub enum QuotabinError {
    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Quota error: {0}")]
    Quota(#[from] quota::QuotaError),

    #[error("Upload error: {0}")]
    Upload(#[from] upload::UploadError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuotabinError {
    /// HTTP status a request boundary should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            QuotabinError::Upload(e) => e.status_code(),
            QuotabinError::Storage(storage::StorageError::NotFound(_)) => 404,
            QuotabinError::Storage(storage::StorageError::InvalidAddress(_))
            | QuotabinError::Storage(storage::StorageError::InvalidIdentifier(_)) => 400,
            QuotabinError::Quota(quota::QuotaError::OutOfQuota) => 507,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, QuotabinError>;

/// Quota authority address used when none is configured
pub const DEFAULT_REMOTE_ADDR: &str = "127.0.0.1:9000";

/// Where quota accounts live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Per-application JSON ledger under the objects directory
    Local,

    /// External quota authority
    Remote {
        #[serde(default = "default_remote_addr")]
        addr: String,
        #[serde(default = "default_connect_timeout_ms")]
        connect_timeout_ms: u64,
        #[serde(default = "default_io_timeout_ms")]
        io_timeout_ms: u64,
    },
}

fn default_remote_addr() -> String {
    DEFAULT_REMOTE_ADDR.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_io_timeout_ms() -> u64 {
    10_000
}

impl BackendConfig {
    pub fn remote(addr: impl Into<String>) -> Self {
        BackendConfig::Remote {
            addr: addr.into(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
        }
    }
}

/// Core configuration for a Quotabin engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotabinConfig {
    /// Base directory everything else is resolved against
    pub home_dir: PathBuf,

    /// Directory (under home) holding objects and local ledgers
    pub objects_dir: String,

    /// Ledger file name, both per application and as template
    pub ledger_file: String,

    /// Directory (under home) holding the ledger template
    pub template_dir: String,

    /// Maximum bytes accepted in one upload request
    pub max_upload_size: i64,

    /// Bytes spent between two quota backend checks
    pub cache_window_size: i64,

    /// Prefix length inspected to detect content types
    pub sniff_len: usize,

    pub backend: BackendConfig,

    /// Users allowed to upload
    pub allowed_users: Vec<i64>,

    pub allowed_content_types: Vec<String>,
}

impl Default for QuotabinConfig {
    fn default() -> Self {
        Self {
            home_dir: PathBuf::from("."),
            objects_dir: ".db".to_string(),
            ledger_file: "quotas.json".to_string(),
            template_dir: "resources/templates".to_string(),
            max_upload_size: 100 << 20, // 100 MB
            cache_window_size: 1 << 20, // 1 MB
            sniff_len: 512,
            backend: BackendConfig::Local,
            allowed_users: vec![1, 2],
            allowed_content_types: upload::DEFAULT_ALLOWED_CONTENT_TYPES
                .iter()
                .map(|ct| ct.to_string())
                .collect(),
        }
    }
}

impl QuotabinConfig {
    /// Load a JSON configuration file; missing fields take defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| QuotabinError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Defaults overlaid with process environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().with_env(|name| std::env::var(name).ok())
    }

    /// Overlay values found through `lookup`:
    /// `QUOTABIN_HOME`, `QUOTA_SERVICE_ADDR`, `QUOTABIN_CACHE_WINDOW`,
    /// `QUOTABIN_MAX_UPLOAD`
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(home) = lookup("QUOTABIN_HOME") {
            self.home_dir = PathBuf::from(home);
        }
        if let Some(addr) = lookup("QUOTA_SERVICE_ADDR").filter(|a| !a.is_empty()) {
            self.backend = BackendConfig::remote(addr);
        }
        if let Some(window) = lookup("QUOTABIN_CACHE_WINDOW") {
            self.cache_window_size = parse_env("QUOTABIN_CACHE_WINDOW", &window)?;
        }
        if let Some(max) = lookup("QUOTABIN_MAX_UPLOAD") {
            self.max_upload_size = parse_env("QUOTABIN_MAX_UPLOAD", &max)?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_window_size <= 0 {
            return Err(QuotabinError::Config("cache window size must be positive".into()));
        }
        if self.max_upload_size < 0 {
            return Err(QuotabinError::Config("max upload size must not be negative".into()));
        }
        Ok(())
    }

    pub fn objects_root(&self) -> PathBuf {
        self.home_dir.join(&self.objects_dir)
    }

    pub fn ledger_template(&self) -> PathBuf {
        self.home_dir.join(&self.template_dir).join(&self.ledger_file)
    }

    pub fn quota_settings(&self) -> QuotaSettings {
        QuotaSettings {
            max_upload_size: self.max_upload_size,
            cache_window_size: self.cache_window_size,
        }
    }
}

fn parse_env(name: &str, value: &str) -> Result<i64> {
    value
        .trim()
        .parse()
        .map_err(|_| QuotabinError::Config(format!("incorrect {} value: {}", name, value)))
}

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
/// Does nothing if one is already installed.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Storage engine wired from a configuration
pub struct Quotabin {
    config: QuotabinConfig,
    store: ObjectStore,
    quota: QuotaManager,
    orchestrator: UploadOrchestrator,
    authorizer: Arc<dyn Authorizer>,
}

impl Quotabin {
    pub fn new(config: QuotabinConfig) -> Result<Self> {
        config.validate()?;

        let backend: Arc<dyn QuotaBackend> = match &config.backend {
            BackendConfig::Local => Arc::new(LocalLedgerBackend::new(
                config.objects_root(),
                config.ledger_file.clone(),
                config.ledger_template(),
            )),
            BackendConfig::Remote {
                addr,
                connect_timeout_ms,
                io_timeout_ms,
            } => Arc::new(RemoteAuthorityBackend::new(addr.clone()).with_timeouts(
                Duration::from_millis(*connect_timeout_ms),
                Duration::from_millis(*io_timeout_ms),
            )),
        };

        let store = ObjectStore::new(config.objects_root());
        let quota = QuotaManager::new(backend, config.quota_settings());
        let gate = Arc::new(AllowList::new(config.allowed_content_types.iter().cloned()));
        let orchestrator =
            UploadOrchestrator::new(store.clone(), quota.clone(), gate, config.sniff_len);
        let authorizer = Arc::new(AllowListAuthorizer::new(
            config.allowed_users.iter().copied().map(UserId::new),
        ));

        tracing::info!(
            "Quotabin engine ready: objects in {}, quota via {}",
            config.objects_root().display(),
            quota.backend_name()
        );

        Ok(Self {
            config,
            store,
            quota,
            orchestrator,
            authorizer,
        })
    }

    pub fn config(&self) -> &QuotabinConfig {
        &self.config
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn quota(&self) -> &QuotaManager {
        &self.quota
    }

    /// Attach the configured authorization policy to a user id
    pub fn identity(&self, user: UserId) -> UserIdentity {
        UserIdentity::new(user, self.authorizer.clone())
    }

    /// Store every part of an upload form
    pub async fn upload<S>(
        &self,
        address: &Address,
        user: UserId,
        parts: S,
    ) -> Result<UploadReceipt>
    where
        S: futures::Stream<Item = UploadPart> + Unpin,
    {
        let identity = self.identity(user);
        Ok(self.orchestrator.upload(address, &identity, parts).await?)
    }

    /// Raw bytes of a stored object
    pub async fn read(&self, address: &Address, id: &ObjectId) -> Result<Vec<u8>> {
        Ok(self.store.read(address, id).await?)
    }

    pub async fn user_quota(&self, user: UserId, address: &Address) -> Result<i64> {
        Ok(self.quota.get_user_quota(user, address).await?)
    }
}
