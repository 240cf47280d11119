use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// Refresh the access token when it has less than this long to live.
const TOKEN_REFRESH_BUFFER_SECS: i64 = 60;

/// An authenticated identity as seen by the rest of the crate.
///
/// Exists only while signed in.
#[derive(Clone, PartialEq)]
pub struct Session {
    pub user_id: String,
    pub access_token: String,
    pub email: Option<String>,
    /// User object exactly as the identity provider returned it
    pub raw_identity: Value,
}

impl Session {
    pub fn bearer(&self) -> &str {
        &self.access_token
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("email", &self.email)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Provider tokens as persisted between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub user: Value,
}

impl SessionData {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Check if the access token will expire soon and should be refreshed
    pub fn needs_refresh(&self) -> bool {
        Utc::now() >= self.expires_at - Duration::seconds(TOKEN_REFRESH_BUFFER_SECS)
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        (self.expires_at - Utc::now()).num_minutes().max(0)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user.get("id").and_then(Value::as_str)
    }

    /// The in-memory session, if the user object carries an id.
    pub fn to_session(&self) -> Option<Session> {
        let user_id = self.user_id()?.to_string();
        Some(Session {
            user_id,
            access_token: self.access_token.clone(),
            email: self
                .user
                .get("email")
                .and_then(Value::as_str)
                .map(str::to_string),
            raw_identity: self.user.clone(),
        })
    }
}

/// Disk persistence for `SessionData`.
pub struct SessionFile {
    cache_dir: PathBuf,
    pub data: Option<SessionData>,
}

impl SessionFile {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            data: None,
        }
    }

    /// Load session from disk. Returns whether one was found.
    ///
    /// Expired sessions are still loaded; they may carry a usable refresh token.
    pub fn load(&mut self) -> Result<bool> {
        let path = self.session_path();
        if path.exists() {
            let contents =
                std::fs::read_to_string(&path).context("Failed to read session file")?;
            let data: SessionData =
                serde_json::from_str(&contents).context("Failed to parse session file")?;
            self.data = Some(data);
            return Ok(true);
        }
        self.data = None;
        Ok(false)
    }

    /// Save session to disk
    pub fn save(&self) -> Result<()> {
        if let Some(ref data) = self.data {
            let path = self.session_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let contents = serde_json::to_string_pretty(data)?;
            std::fs::write(&path, contents)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
            }
        }
        Ok(())
    }

    /// Clear session data
    pub fn clear(&mut self) -> Result<()> {
        self.data = None;
        let path = self.session_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Update session with new data
    pub fn update(&mut self, data: SessionData) {
        self.data = Some(data);
    }

    fn session_path(&self) -> PathBuf {
        self.cache_dir.join(SESSION_FILE)
    }
}
