//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: backend
//! URL, timeouts, token renewal margins, where the session is kept, and the
//! last email used to log in.
//!
//! Configuration is stored at `~/.config/careport/config.json`. The
//! `CAREPORT_API_URL` and `CAREPORT_STORAGE` environment variables override
//! the file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::RenewalPolicy;
use crate::auth::session::{DEFAULT_RENEWAL_WINDOW_SECS, DEFAULT_VALIDITY_MARGIN_SECS};
use crate::auth::{
    CredentialStorage, ExpiryPolicy, FileStorage, KeyringStorage, MemoryStorage, SessionStore,
    SystemClock,
};

/// Application name used for config/cache directory paths and the keychain service
const APP_NAME: &str = "careport";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_URL: &str = "http://localhost:5000";

/// HTTP request timeout in seconds.
/// 30s leaves room for slow payment operations and also bounds token renewal.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

pub const API_URL_ENV: &str = "CAREPORT_API_URL";
pub const STORAGE_ENV: &str = "CAREPORT_STORAGE";

/// Where the credential record is kept between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Keyring,
    Memory,
}

impl std::str::FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "file" => Ok(StorageKind::File),
            "keyring" => Ok(StorageKind::Keyring),
            "memory" => Ok(StorageKind::Memory),
            other => Err(anyhow::anyhow!("Unknown storage kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_url: String,
    pub request_timeout_secs: u64,
    pub validity_margin_secs: i64,
    pub renewal_window_secs: i64,
    pub renewal_transport_retries: u32,
    pub renewal_backoff_ms: u64,
    pub extra_public_paths: Vec<String>,
    pub storage: StorageKind,
    /// Directory for a rolling log file; stderr only when unset
    pub log_dir: Option<PathBuf>,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let renewal = RenewalPolicy::default();
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            validity_margin_secs: DEFAULT_VALIDITY_MARGIN_SECS,
            renewal_window_secs: DEFAULT_RENEWAL_WINDOW_SECS,
            renewal_transport_retries: renewal.transport_retries,
            renewal_backoff_ms: renewal.initial_backoff.as_millis() as u64,
            extra_public_paths: Vec::new(),
            storage: StorageKind::default(),
            log_dir: None,
            last_email: None,
        }
    }
}

impl Config {
    /// Load from the default location with environment overrides applied
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    /// Record the last login email in the config file. Only the file is
    /// rewritten, so environment overrides are never persisted.
    pub fn remember_email(email: &str) -> Result<()> {
        let path = Self::config_path()?;
        let mut config = Self::load_from(&path)?;
        config.last_email = Some(email.to_string());
        config.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply overrides from a variable lookup (the process environment in `load`)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(API_URL_ENV).filter(|u| !u.trim().is_empty()) {
            self.api_url = url.trim().to_string();
        }
        if let Some(kind) = lookup(STORAGE_ENV) {
            self.storage = kind
                .parse()
                .with_context(|| format!("Invalid {}", STORAGE_ENV))?;
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy {
            validity_margin_secs: self.validity_margin_secs,
            renewal_window_secs: self.renewal_window_secs,
        }
    }

    pub fn renewal_policy(&self) -> RenewalPolicy {
        RenewalPolicy {
            transport_retries: self.renewal_transport_retries,
            initial_backoff: Duration::from_millis(self.renewal_backoff_ms),
        }
    }

    /// Storage backend for the configured `storage` kind
    pub fn credential_storage(&self) -> Result<Box<dyn CredentialStorage>> {
        Ok(match self.storage {
            StorageKind::File => Box::new(FileStorage::new(&self.cache_dir()?)),
            StorageKind::Keyring => Box::new(KeyringStorage::new(APP_NAME)),
            StorageKind::Memory => Box::new(MemoryStorage::new()),
        })
    }

    /// The session store for this configuration, on the system clock
    pub fn session_store(&self) -> Result<SessionStore> {
        Ok(SessionStore::new(
            self.credential_storage()?,
            Arc::new(SystemClock),
            self.expiry_policy(),
        ))
    }
}
