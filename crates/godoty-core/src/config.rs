//! Application configuration management.
//!
//! This module handles loading and saving the configuration: the backend
//! project URL and anon key, endpoint overrides, the auth callback URL, and
//! where the virtual key is persisted.
//!
//! Configuration is stored at `~/.config/godoty/config.json`. Environment
//! variables override the file (see `apply_env`).

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "godoty";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_PROJECT_URL: &str = "https://kbnaymejrngxhpigwphh.supabase.co";
const DEFAULT_REDIRECT_URL: &str = "godoty://auth/callback";

/// Where the virtual key is persisted between runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackend {
    #[default]
    File,
    Keyring,
    Memory,
}

impl FromStr for CredentialBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "keyring" => Ok(Self::Keyring),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow::anyhow!("Unknown credential backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub project_url: String,
    pub anon_key: String,
    /// Edge functions base; defaults to `<project_url>/functions/v1`
    pub functions_url: Option<String>,
    /// Realtime base; defaults to the project's websocket endpoint
    pub realtime_url: Option<String>,
    /// Where OAuth and magic-link flows return to
    pub redirect_url: String,
    pub credential_backend: CredentialBackend,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_url: DEFAULT_PROJECT_URL.to_string(),
            anon_key: String::new(),
            functions_url: None,
            realtime_url: None,
            redirect_url: DEFAULT_REDIRECT_URL.to_string(),
            credential_backend: CredentialBackend::default(),
            last_email: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply `GODOTY_*` overrides from the given lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("GODOTY_PROJECT_URL") {
            self.project_url = url;
        }
        if let Some(key) = lookup("GODOTY_ANON_KEY") {
            self.anon_key = key;
        }
        if let Some(url) = lookup("GODOTY_FUNCTIONS_URL") {
            self.functions_url = Some(url);
        }
        if let Some(url) = lookup("GODOTY_REALTIME_URL") {
            self.realtime_url = Some(url);
        }
        if let Some(url) = lookup("GODOTY_REDIRECT_URL") {
            self.redirect_url = url;
        }
        if let Some(backend) = lookup("GODOTY_CREDENTIAL_BACKEND") {
            match backend.parse() {
                Ok(backend) => self.credential_backend = backend,
                Err(e) => warn!(error = %e, "Ignoring GODOTY_CREDENTIAL_BACKEND"),
            }
        }
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

    fn project_base(&self) -> &str {
        self.project_url.trim_end_matches('/')
    }

    pub fn rest_url(&self) -> String {
        format!("{}/rest/v1", self.project_base())
    }

    pub fn functions_url(&self) -> String {
        match self.functions_url {
            Some(ref url) => url.trim_end_matches('/').to_string(),
            None => format!("{}/functions/v1", self.project_base()),
        }
    }

    pub fn realtime_url(&self) -> String {
        if let Some(ref url) = self.realtime_url {
            return url.trim_end_matches('/').to_string();
        }
        let base = self.project_base();
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/realtime/v1", ws_base)
    }
}
