//! Command-line defaults read from `~/.config/webrelay/config.json`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

const DEFAULT_LISTEN_PREFIX: &str = "http://*:80/";
const DEFAULT_MAX_CONNECTIONS: usize = 8;

/// On-disk config format. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    listen_prefix: String,
    #[serde(default)]
    remote_host: String,
    #[serde(default)]
    max_connections: Option<usize>,
    #[serde(default)]
    pin_downloader_host: bool,
}

/// Relay settings before command-line overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Substituted for wildcard listen hosts in printed links.
    pub hostname: String,
    pub listen_prefix: String,
    pub remote_host: Option<String>,
    pub max_connections: usize,
    pub pin_downloader_host: bool,
}

fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".into())
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            listen_prefix: DEFAULT_LISTEN_PREFIX.into(),
            remote_host: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            pin_downloader_host: false,
        }
    }
}

impl RelayConfig {
    /// Loads the user's config file, falling back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_file_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let mut config = Self::default();
        if !path.exists() {
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        let Ok(file) = serde_json::from_str::<ConfigFile>(&content) else {
            tracing::warn!(path = %path.display(), "failed to parse config, using defaults");
            return Ok(config);
        };

        if !file.hostname.is_empty() {
            config.hostname = file.hostname;
        }
        if !file.listen_prefix.is_empty() {
            config.listen_prefix = file.listen_prefix;
        }
        if !file.remote_host.is_empty() {
            config.remote_host = Some(file.remote_host);
        }
        if let Some(max) = file.max_connections.filter(|m| *m > 0) {
            config.max_connections = max;
        }
        config.pin_downloader_host = file.pin_downloader_host;

        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}

fn config_file_path() -> anyhow::Result<PathBuf> {
    Ok(config_base_dir()?.join("webrelay").join("config.json"))
}

fn config_base_dir() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata))
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home).join(".config"))
    }
}
