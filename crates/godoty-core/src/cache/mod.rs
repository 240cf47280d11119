//! Local persistence for the delegated credential.
//!
//! This module provides:
//! - `CredentialCache`: validated read/write/clear of the cached virtual key
//! - `CredentialStorage`: where the serialized entry lives (file, OS keychain,
//!   or process memory)
//!
//! Entries are considered expired one hour before their real expiry and are
//! evicted the first time a read notices.

pub mod credential;
pub mod storage;

pub use credential::CredentialCache;
pub use storage::{CredentialStorage, FileStorage, KeyringStorage, MemoryStorage};
