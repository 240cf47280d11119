//! Client-side account core for godoty.
//!
//! Manages the signed-in session, keeps the credit balance current, caches
//! the per-account virtual key, and starts credit purchases.
//!
//! Build an [`Account`] once (from [`Config`] or from explicit
//! [`AccountParts`]), call `account.session().init()`, then follow
//! `account.store().watch()` for state changes.

pub mod account;
pub mod api;
pub mod auth;
pub mod cache;
pub mod checkout;
pub mod config;
pub mod credit;
pub mod error;
pub mod issuer;
pub mod models;
pub mod realtime;
pub mod redirect;
pub mod session;
pub mod store;

#[cfg(test)]
mod testing;

pub use account::{Account, AccountParts};
pub use checkout::CheckoutInitiator;
pub use config::{Config, CredentialBackend};
pub use credit::CreditSync;
pub use error::{AccountError, Result};
pub use issuer::KeyIssuer;
pub use models::CachedCredential;
pub use redirect::Redirect;
pub use session::{AuthPhase, SessionManager};
pub use store::{AccountSnapshot, SessionStore};
