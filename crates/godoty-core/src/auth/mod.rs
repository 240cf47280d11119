//! Authentication primitives.
//!
//! This module provides:
//! - `IdentityProvider`: the contract the session manager relies on
//! - `GoTrueClient`: the hosted auth service implementation, with the
//!   session persisted to disk between runs
//! - `Session`: the signed-in identity handed to the rest of the crate

pub mod gotrue;
pub mod provider;
pub mod session;

pub use gotrue::GoTrueClient;
pub use provider::{AuthChange, AuthChangeKind, IdentityProvider, ProviderError, SignUpOutcome};
pub use session::{Session, SessionData, SessionFile};
