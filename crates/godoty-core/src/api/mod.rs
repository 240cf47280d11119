//! REST client for the account backend.
//!
//! This module provides the `ApiClient` for the two edge functions (virtual
//! key issuance, checkout creation) and for the balance queries against the
//! REST query layer.
//!
//! Every request carries the user's bearer token; the project's anon key is
//! sent alongside it as the `apikey` header.

pub mod client;
pub mod error;

pub use client::ApiClient;
pub use error::ApiError;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::CachedCredential;

/// Response of the checkout-creating endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub url: String,
}

/// The credential-issuing and checkout-creating endpoints.
#[async_trait]
pub trait AccountEndpoints: Send + Sync {
    /// Issue (or re-issue) the account's virtual key.
    async fn issue_credential(&self, bearer: &str) -> Result<CachedCredential, ApiError>;

    /// Create a payment session for a credit pack.
    async fn create_checkout(&self, bearer: &str, price_id: &str)
        -> Result<CheckoutSession, ApiError>;
}
