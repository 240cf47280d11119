//! API client for the account backend.
//!
//! This module provides the `ApiClient` struct for calling the account edge
//! functions and reading the caller's credit balance.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tracing::debug;
use url::Url;

use super::{AccountEndpoints, ApiError, CheckoutSession};
use crate::auth::Session;
use crate::config::Config;
use crate::credit::{BalanceSource, QueryError};
use crate::models::{BalanceRow, BudgetRow, CachedCredential};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Edge function that issues the per-account virtual key
const ISSUE_KEY_FUNCTION: &str = "generate-litellm-key";

/// Edge function that creates a payment checkout session
const CHECKOUT_FUNCTION: &str = "stripe-checkout";

/// Privileged view exposing the pre-computed balance
const BALANCE_VIEW: &str = "user_credit_balance";

/// Raw budget table; also the realtime source
pub(crate) const BUDGET_TABLE: &str = "LiteLLM_UserTable";

/// API client for the account backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    rest_url: String,
    functions_url: String,
    anon_key: String,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self::with_client(Self::build_http_client()?, config))
    }

    /// Create a client sharing an existing connection pool.
    pub fn with_client(client: Client, config: &Config) -> Self {
        Self {
            client,
            rest_url: config.rest_url(),
            functions_url: config.functions_url(),
            anon_key: config.anon_key.clone(),
        }
    }

    pub fn build_http_client() -> Result<Client> {
        Ok(Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?)
    }

    /// The underlying HTTP client, for collaborators that share the pool.
    pub fn http(&self) -> &Client {
        &self.client
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn post_function<T: DeserializeOwned, B: Serialize>(
        &self,
        function: &str,
        bearer: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let url = format!("{}/{}", self.functions_url, function);
        let response = self
            .client
            .post(&url)
            .bearer_auth(bearer)
            .header(header::CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("{} response: {}", function, e)))
    }

    /// Select at most one row from a table or view.
    async fn select_one<T: DeserializeOwned>(
        &self,
        relation: &str,
        params: &[(&str, &str)],
        bearer: &str,
    ) -> Result<Option<T>, ApiError> {
        let url = Url::parse_with_params(&format!("{}/{}", self.rest_url, relation), params)
            .map_err(|e| ApiError::InvalidResponse(format!("Invalid query URL: {}", e)))?;

        let response = self
            .client
            .get(url)
            .header("apikey", self.anon_key.as_str())
            .header(header::ACCEPT, "application/json")
            .bearer_auth(bearer)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let rows: Vec<T> = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("{} rows: {}", relation, e)))?;

        debug!(relation, rows = rows.len(), "Balance query returned");
        Ok(rows.into_iter().next())
    }
}

fn query_error(err: ApiError) -> QueryError {
    match err {
        ApiError::RelationNotFound(message) => QueryError::RelationNotFound(message),
        other => QueryError::Failed(other.to_string()),
    }
}

#[async_trait]
impl AccountEndpoints for ApiClient {
    async fn issue_credential(&self, bearer: &str) -> Result<CachedCredential, ApiError> {
        self.post_function(ISSUE_KEY_FUNCTION, bearer, &json!({})).await
    }

    async fn create_checkout(
        &self,
        bearer: &str,
        price_id: &str,
    ) -> Result<CheckoutSession, ApiError> {
        self.post_function(CHECKOUT_FUNCTION, bearer, &json!({ "price_id": price_id }))
            .await
    }
}

#[async_trait]
impl BalanceSource for ApiClient {
    async fn primary_balance(&self, session: &Session) -> Result<Option<BalanceRow>, QueryError> {
        // Row-level security limits the view to the caller's own row
        self.select_one(
            BALANCE_VIEW,
            &[("select", "max_budget,spend,remaining_balance"), ("limit", "1")],
            session.bearer(),
        )
        .await
        .map_err(query_error)
    }

    async fn fallback_balance(&self, session: &Session) -> Result<Option<BudgetRow>, QueryError> {
        let user_filter = format!("eq.{}", session.user_id);
        self.select_one(
            BUDGET_TABLE,
            &[
                ("select", "max_budget,spend"),
                ("user_id", user_filter.as_str()),
                ("limit", "1"),
            ],
            session.bearer(),
        )
        .await
        .map_err(query_error)
    }
}
