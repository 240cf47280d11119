use std::path::PathBuf;

use anyhow::{Context, Result};
use keyring::Entry;
use parking_lot::Mutex;

/// Cache file name in the cache directory
const CREDENTIAL_FILE: &str = "virtual_key.json";

/// Keychain service and account for the keyring backend
const SERVICE_NAME: &str = "godoty";
const KEYRING_ACCOUNT: &str = "godoty_virtual_key";

/// Backing store for the single persisted credential entry.
///
/// Implementations hold at most one raw JSON string under one fixed key.
/// `remove` on an empty store succeeds.
pub trait CredentialStorage: Send + Sync {
    fn load(&self) -> Result<Option<String>>;

    fn store(&self, raw: &str) -> Result<()>;

    fn remove(&self) -> Result<()>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// JSON file in the cache directory.
pub struct FileStorage {
    cache_dir: PathBuf,
}

impl FileStorage {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    pub fn path(&self) -> PathBuf {
        self.cache_dir.join(CREDENTIAL_FILE)
    }
}

impl CredentialStorage for FileStorage {
    fn load(&self) -> Result<Option<String>> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            std::fs::read_to_string(&path).context("Failed to read credential cache file")?;
        Ok(Some(contents))
    }

    fn store(&self, raw: &str) -> Result<()> {
        let path = self.path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, raw).context("Failed to write credential cache file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        let path = self.path();
        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove credential cache file")?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// OS keychain entry.
pub struct KeyringStorage;

impl KeyringStorage {
    fn entry() -> Result<Entry> {
        Entry::new(SERVICE_NAME, KEYRING_ACCOUNT).context("Failed to create keyring entry")
    }
}

impl CredentialStorage for KeyringStorage {
    fn load(&self) -> Result<Option<String>> {
        match Self::entry()?.get_password() {
            Ok(raw) => Ok(Some(raw)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve credential from keychain"),
        }
    }

    fn store(&self, raw: &str) -> Result<()> {
        Self::entry()?
            .set_password(raw)
            .context("Failed to store credential in keychain")
    }

    fn remove(&self) -> Result<()> {
        match Self::entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential from keychain"),
        }
    }

    fn name(&self) -> &'static str {
        "keyring"
    }
}

/// Process-local storage. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStorage {
    raw: Mutex<Option<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-seeded with a raw entry.
    pub fn with_raw(raw: impl Into<String>) -> Self {
        Self {
            raw: Mutex::new(Some(raw.into())),
        }
    }

    /// Current raw contents.
    pub fn raw(&self) -> Option<String> {
        self.raw.lock().clone()
    }
}

impl CredentialStorage for MemoryStorage {
    fn load(&self) -> Result<Option<String>> {
        Ok(self.raw.lock().clone())
    }

    fn store(&self, raw: &str) -> Result<()> {
        *self.raw.lock() = Some(raw.to_string());
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        *self.raw.lock() = None;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
