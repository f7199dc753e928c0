//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: the API
//! base URL, request and renewal timeouts, where the session is persisted,
//! and the last used username.
//!
//! Configuration is stored at `~/.config/fitkit/config.json`. The
//! `FITKIT_BASE_URL` environment variable overrides the stored base URL.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::auth::{CredentialPersistence, CredentialStore, FilePersistence, KeyringPersistence};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "fitkit";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Server used when nothing is configured.
const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Upper bound on a token renewal call, in seconds.
const DEFAULT_RENEWAL_TIMEOUT_SECS: u64 = 30;

pub const BASE_URL_ENV: &str = "FITKIT_BASE_URL";

/// Passphrase that turns on encryption of the session file.
pub const SESSION_PASSPHRASE_ENV: &str = "FITKIT_SESSION_PASSPHRASE";

/// Where the session survives between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceKind {
    #[default]
    File,
    Keyring,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub renewal_timeout_secs: u64,
    pub persistence: PersistenceKind,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            renewal_timeout_secs: DEFAULT_RENEWAL_TIMEOUT_SECS,
            persistence: PersistenceKind::default(),
            last_username: None,
        }
    }
}

impl Config {
    /// Load the config file (defaults if absent) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
            if !base_url.trim().is_empty() {
                config.base_url = base_url;
            }
        }
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
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

    /// Parsed base URL, always ending in `/` so endpoint paths join under it.
    pub fn base_url(&self) -> Result<Url> {
        let mut raw = self.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let url = Url::parse(&raw).with_context(|| format!("Invalid base URL: {}", self.base_url))?;
        if url.cannot_be_a_base() {
            anyhow::bail!("Base URL cannot hold paths: {}", self.base_url);
        }
        Ok(url)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn renewal_timeout(&self) -> Duration {
        Duration::from_secs(self.renewal_timeout_secs)
    }

    /// Build an empty credential store backed by the configured medium.
    pub fn credential_store(&self) -> Result<CredentialStore> {
        let persistence: Box<dyn CredentialPersistence> = match self.persistence {
            PersistenceKind::Memory => return Ok(CredentialStore::new()),
            PersistenceKind::Keyring => Box::new(KeyringPersistence::new()),
            PersistenceKind::File => {
                let dir = self.cache_dir()?;
                match std::env::var(SESSION_PASSPHRASE_ENV) {
                    Ok(passphrase) if !passphrase.is_empty() => Box::new(FilePersistence::encrypted(
                        dir.join(crate::auth::persistence::SESSION_FILE),
                        passphrase,
                    )),
                    _ => Box::new(FilePersistence::in_dir(&dir)),
                }
            }
        };
        Ok(CredentialStore::with_persistence(persistence))
    }
}
