//! Application configuration
//!
//! Stored as TOML under `<config dir>/gramolink/config.toml`. Every section
//! falls back to its defaults, so a partial or missing file is fine and a
//! corrupt one only costs a warning.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::session::SessionDescriptor;

const APP_DIR: &str = "gramolink";
const CONFIG_FILE: &str = "config.toml";
const BROWSER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";
const WEB_REFERER: &str = "https://www.bilibili.com";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub download: DownloadConfig,
    pub resolver: ResolverConfig,
    pub realtime: RealtimeConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub component: String,
    pub token: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            component: "gramolink.playback".to_string(),
            token: "local".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            component: self.component.clone(),
            token: self.token.clone(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    /// How often a [`ProgressTracker`](crate::download::ProgressTracker) polls
    pub poll_interval_ms: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

impl DownloadConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ResolverConfig {
    pub api_base: String,
    pub user_agent: String,
    pub referer: String,
    pub timeout_secs: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.bilibili.com".to_string(),
            user_agent: BROWSER_AGENT.to_string(),
            referer: WEB_REFERER.to_string(),
            timeout_secs: 15,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RealtimeConfig {
    /// `host[:port]` of the realtime server, without scheme
    pub endpoint: String,
    pub secure: bool,
    pub connect_timeout_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            secure: true,
            connect_timeout_secs: 10,
        }
    }
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join(CONFIG_FILE)
}

impl AppConfig {
    /// Loads the configuration from [`config_path`]
    pub async fn load() -> Self {
        Self::load_from(&config_path()).await
    }

    /// Never fails: unreadable or unparsable files yield the defaults
    pub async fn load_from(path: &Path) -> Self {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Cannot read config {}: {}, using default", path.display(), e);
                return Self::default();
            }
        };

        match toml::from_str(&content) {
            Ok(config) => {
                debug!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                warn!("Cannot parse config {}: {}, using default", path.display(), e);
                Self::default()
            }
        }
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))?;
        Ok(())
    }
}

/// Writes a default config file unless one already exists
pub async fn ensure_default_config() -> Result<PathBuf> {
    let path = config_path();
    ensure_default_config_at(&path).await?;
    Ok(path)
}

async fn ensure_default_config_at(path: &Path) -> Result<()> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?;
    if !exists {
        info!("Creating default configuration at {}", path.display());
        AppConfig::default().save_to(path).await?;
    }
    Ok(())
}
