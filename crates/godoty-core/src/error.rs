//! Error taxonomy surfaced to callers of the account components.
//!
//! Errors that are recovered internally (a missing balance view, a corrupt
//! cache entry) never reach this type; they are logged where they happen.

use thiserror::Error;

use crate::api::ApiError;
use crate::auth::ProviderError;

/// Errors surfaced by `SessionManager`, `KeyIssuer`, `CreditSync` and
/// `CheckoutInitiator`.
///
/// `Clone` so a single in-flight issuance result can be handed to every
/// caller awaiting it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AccountError {
    #[error("Must be logged in to {0}")]
    AuthRequired(&'static str),

    #[error("{0}")]
    Provider(String),

    #[error("{0}")]
    Issuing(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Realtime channel error: {0}")]
    Realtime(String),

    #[error("Failed to open {0}")]
    Redirect(String),
}

impl AccountError {
    /// Message suitable for direct display.
    pub fn user_message(&self) -> String {
        self.to_string()
    }

    /// Map an endpoint failure, substituting `fallback` when the server
    /// gave no usable message.
    pub fn from_endpoint(err: ApiError, fallback: &str) -> Self {
        match err {
            ApiError::Endpoint(message) if !message.trim().is_empty() => {
                AccountError::Issuing(message)
            }
            ApiError::NetworkError(e) => AccountError::Network(e.to_string()),
            _ => AccountError::Issuing(fallback.to_string()),
        }
    }
}

impl From<ProviderError> for AccountError {
    fn from(err: ProviderError) -> Self {
        AccountError::Provider(err.message)
    }
}

pub type Result<T> = std::result::Result<T, AccountError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_message_preferred() {
        let err = AccountError::from_endpoint(
            ApiError::Endpoint("Budget exhausted".to_string()),
            "Failed to generate API key",
        );
        assert_eq!(err, AccountError::Issuing("Budget exhausted".to_string()));
    }

    #[test]
    fn test_endpoint_fallback_message() {
        let blank = AccountError::from_endpoint(
            ApiError::Endpoint("   ".to_string()),
            "Failed to generate API key",
        );
        assert_eq!(blank.to_string(), "Failed to generate API key");

        let status = AccountError::from_endpoint(
            ApiError::ServerError("<html>".to_string()),
            "Failed to create checkout session",
        );
        assert_eq!(status.to_string(), "Failed to create checkout session");
    }

    #[test]
    fn test_auth_required_message() {
        let err = AccountError::AuthRequired("generate API key");
        assert_eq!(err.user_message(), "Must be logged in to generate API key");
    }
}
