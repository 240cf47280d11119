//! Contract for the external identity provider.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use super::Session;

/// Kind of auth-state change reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthChangeKind {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// One event on the provider's auth-state-change stream.
///
/// `session` is `None` whenever the provider no longer considers the user
/// signed in.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthChange {
    pub kind: AuthChangeKind,
    pub session: Option<Session>,
}

impl AuthChange {
    pub fn new(kind: AuthChangeKind, session: Option<Session>) -> Self {
        Self { kind, session }
    }

    pub fn signed_out() -> Self {
        Self::new(AuthChangeKind::SignedOut, None)
    }
}

/// A request rejected by the identity provider.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct ProviderError {
    pub message: String,
    pub status: Option<u16>,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(message: impl Into<String>, status: u16) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError {
            message: format!("Network error: {}", err),
            status: err.status().map(|s| s.as_u16()),
        }
    }
}

/// Result of a sign-up request.
#[derive(Debug, Clone, PartialEq)]
pub enum SignUpOutcome {
    /// The account was confirmed immediately and a session issued.
    SignedIn(Session),
    /// The provider sent a confirmation email; no session yet.
    ConfirmationSent,
}

/// Session and sign-in primitives of the identity provider.
///
/// Successful sign-ins also publish an `AuthChange` on the stream returned
/// by `subscribe`; callers must not treat the method result as the state
/// transition.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Current session, if any.
    async fn get_session(&self) -> Result<Option<Session>, ProviderError>;

    /// Receiver for auth-state-change events published after this call.
    fn subscribe(&self) -> broadcast::Receiver<AuthChange>;

    /// Begin an OAuth sign-in. Returns the URL the user must visit.
    async fn sign_in_with_oauth(
        &self,
        provider: &str,
        redirect_to: &str,
    ) -> Result<String, ProviderError>;

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, ProviderError>;

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        redirect_to: &str,
    ) -> Result<SignUpOutcome, ProviderError>;

    /// Send a magic link.
    async fn sign_in_with_otp(&self, email: &str, redirect_to: &str)
        -> Result<(), ProviderError>;

    /// Finish an OAuth or magic-link sign-in from the callback URL.
    async fn complete_redirect(&self, callback_url: &str) -> Result<Session, ProviderError>;

    async fn sign_out(&self) -> Result<(), ProviderError>;
}
