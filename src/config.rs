//! Configuration for the replication engine.
//!
//! Sources, highest priority last:
//! 1. Built-in defaults
//! 2. `participation-sync.toml` in the working directory, if present
//! 3. `PARTICIPATION_SYNC_*` environment variables (`__` separates nested
//!    keys, so `PARTICIPATION_SYNC_REMOTE__HOST` sets `remote.host`)
//!
//! # Example
//!
//! ```
//! use participation_sync::SyncConfig;
//!
//! let config = SyncConfig::default();
//! assert!(config.auto_sync_enabled);
//! assert_eq!(config.sync_interval_secs, 300);
//! assert_eq!(
//!     config.remote.connection_url(),
//!     "mysql://root:@localhost:3306/participation"
//! );
//! ```
//!
//! The orchestrator reads its configuration from a `tokio::sync::watch`
//! receiver, so the interval and the auto-sync switch can be changed while
//! the background loop is running.

use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONFIG_FILE: &str = "participation-sync.toml";
const ENV_PREFIX: &str = "PARTICIPATION_SYNC_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Figment(#[from] figment::Error),
    #[error("sync interval must be at least one second")]
    InvalidInterval,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Run the background upload loop
    #[serde(default = "default_auto_sync")]
    pub auto_sync_enabled: bool,

    /// Pause between background cycles, in seconds
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// SQLite file holding the local store and the sync journal
    #[serde(default = "default_local_store_path")]
    pub local_store_path: PathBuf,

    #[serde(default)]
    pub remote: RemoteStoreConfig,

    /// How long `stop()` waits for the loop to exit before abandoning it
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,

    /// Allow only one replication at a time across background and manual runs
    #[serde(default = "default_serialize_cycles")]
    pub serialize_cycles: bool,
}

fn default_auto_sync() -> bool { true }
fn default_sync_interval_secs() -> u64 { 300 }
fn default_local_store_path() -> PathBuf { PathBuf::from("data/local.db") }
fn default_stop_timeout_secs() -> u64 { 5 }
fn default_serialize_cycles() -> bool { true }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync_enabled: default_auto_sync(),
            sync_interval_secs: default_sync_interval_secs(),
            local_store_path: default_local_store_path(),
            remote: RemoteStoreConfig::default(),
            stop_timeout_secs: default_stop_timeout_secs(),
            serialize_cycles: default_serialize_cycles(),
        }
    }
}

impl SyncConfig {
    /// Load from defaults, the optional TOML file and the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a source is malformed or the result fails
    /// [`validate`](Self::validate).
    pub fn load() -> Result<Self, ConfigError> {
        let config: Self = Self::figment().extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`load`](Self::load), but reads a `.env` file first.
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub fn load_with_dotenv() -> Result<Self, ConfigError> {
        // A missing .env is fine
        let _ = dotenvy::dotenv();
        Self::load()
    }

    /// Provider chain, exposed so callers can layer extra sources on top.
    #[must_use]
    pub fn figment() -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        let file = PathBuf::from(CONFIG_FILE);
        if file.exists() {
            figment = figment.merge(Toml::file(file));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// # Errors
    ///
    /// [`ConfigError::InvalidInterval`] for a zero interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_interval_secs == 0 {
            return Err(ConfigError::InvalidInterval);
        }
        Ok(())
    }

    #[must_use]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// sqlx URL for the local store. Creates the file if missing.
    #[must_use]
    pub fn local_store_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.local_store_path.display())
    }
}

/// Connection settings for the shared MySQL server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemoteStoreConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_host() -> String { "localhost".into() }
fn default_port() -> u16 { 3306 }
fn default_database() -> String { "participation".into() }
fn default_user() -> String { "root".into() }
fn default_connect_timeout_secs() -> u64 { 5 }

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: default_database(),
            user: default_user(),
            password: String::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl RemoteStoreConfig {
    #[must_use]
    pub fn connection_url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.user),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.database)
        )
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
