//! Identity provider client for the hosted auth service (GoTrue REST API).
//!
//! Tokens are persisted in the cache directory so a restart resumes the
//! session. Every change of session is published on a broadcast channel.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

use super::provider::{AuthChange, AuthChangeKind, IdentityProvider, ProviderError, SignUpOutcome};
use super::session::{Session, SessionData, SessionFile};

/// Buffered auth events per listener before it is reported as lagging
const AUTH_EVENT_CAPACITY: usize = 16;

/// Token lifetime assumed when the provider omits both expiry fields
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    expires_at: Option<i64>,
    user: Value,
}

impl TokenResponse {
    fn into_session_data(self) -> SessionData {
        SessionData {
            expires_at: expiry_from(self.expires_at, self.expires_in),
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            user: self.user,
        }
    }
}

/// Tokens carried by an OAuth or magic-link callback URL.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CallbackTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

fn expiry_from(expires_at: Option<i64>, expires_in: Option<i64>) -> DateTime<Utc> {
    expires_at
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .unwrap_or_else(|| {
            Utc::now() + Duration::seconds(expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS))
        })
}

/// Pull the human-readable message out of an auth error body.
fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["msg", "error_description", "message", "error"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

/// Parse the tokens out of a callback URL's fragment (or query).
pub(crate) fn parse_callback(callback_url: &str) -> Result<CallbackTokens, ProviderError> {
    let url = Url::parse(callback_url)
        .map_err(|e| ProviderError::new(format!("Invalid callback URL: {}", e)))?;

    let mut params: HashMap<String, String> = url.query_pairs().into_owned().collect();
    if let Some(fragment) = url.fragment() {
        params.extend(url::form_urlencoded::parse(fragment.as_bytes()).into_owned());
    }

    if let Some(message) = params
        .get("error_description")
        .or_else(|| params.get("error"))
    {
        return Err(ProviderError::new(message.clone()));
    }

    let access_token = params
        .get("access_token")
        .filter(|t| !t.is_empty())
        .cloned()
        .ok_or_else(|| ProviderError::new("Callback URL does not contain a session"))?;

    let parse_i64 = |key: &str| params.get(key).and_then(|v| v.parse::<i64>().ok());

    Ok(CallbackTokens {
        access_token,
        refresh_token: params.get("refresh_token").cloned(),
        expires_at: expiry_from(parse_i64("expires_at"), parse_i64("expires_in")),
    })
}

pub struct GoTrueClient {
    client: Client,
    auth_url: String,
    anon_key: String,
    session: Mutex<SessionFile>,
    events: broadcast::Sender<AuthChange>,
}

impl GoTrueClient {
    /// `project_url` is the backend root; the auth API lives under `/auth/v1`.
    pub fn new(client: Client, project_url: &str, anon_key: &str, cache_dir: PathBuf) -> Self {
        let mut file = SessionFile::new(cache_dir);
        if let Err(e) = file.load() {
            warn!(error = %e, "Saved session unreadable, discarding");
            if let Err(e) = file.clear() {
                warn!(error = %e, "Failed to remove unreadable session file");
            }
        }

        let (events, _) = broadcast::channel(AUTH_EVENT_CAPACITY);

        Self {
            client,
            auth_url: format!("{}/auth/v1", project_url.trim_end_matches('/')),
            anon_key: anon_key.to_string(),
            session: Mutex::new(file),
            events,
        }
    }

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, ProviderError> {
        Url::parse_with_params(&format!("{}/{}", self.auth_url, path), params)
            .map_err(|e| ProviderError::new(format!("Invalid auth URL: {}", e)))
    }

    /// Check if response is successful, returning the provider's message if not.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = error_message(&body)
            .unwrap_or_else(|| format!("Authentication request failed ({})", status));
        Err(ProviderError::with_status(message, status.as_u16()))
    }

    async fn post_json(
        &self,
        url: Url,
        body: &Value,
        bearer: Option<&str>,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut request = self
            .client
            .post(url)
            .header("apikey", self.anon_key.as_str())
            .json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        Self::check(request.send().await?).await
    }

    async fn token_grant(&self, grant_type: &str, body: Value) -> Result<SessionData, ProviderError> {
        let url = self.endpoint("token", &[("grant_type", grant_type)])?;
        let response = self.post_json(url, &body, None).await?;
        let token: TokenResponse = response.json().await?;
        Ok(token.into_session_data())
    }

    async fn fetch_user(&self, access_token: &str) -> Result<Value, ProviderError> {
        let response = self
            .client
            .get(self.endpoint("user", &[])?)
            .header("apikey", self.anon_key.as_str())
            .header(header::ACCEPT, "application/json")
            .bearer_auth(access_token)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Persist a new session and announce it.
    fn establish(&self, data: SessionData, kind: AuthChangeKind) -> Result<Session, ProviderError> {
        let session = data
            .to_session()
            .ok_or_else(|| ProviderError::new("Identity provider returned a session without a user"))?;
        {
            let mut file = self.session.lock();
            file.update(data);
            if let Err(e) = file.save() {
                warn!(error = %e, "Failed to save session");
            }
        }
        self.emit(AuthChange::new(kind, Some(session.clone())));
        Ok(session)
    }

    /// Forget the local session and announce sign-out if there was one.
    fn drop_session(&self) {
        let had_session = {
            let mut file = self.session.lock();
            let had = file.data.is_some();
            if let Err(e) = file.clear() {
                warn!(error = %e, "Failed to remove session file");
            }
            had
        };
        if had_session {
            self.emit(AuthChange::signed_out());
        }
    }

    fn emit(&self, change: AuthChange) {
        debug!(kind = ?change.kind, "Auth state change");
        if self.events.send(change).is_err() {
            debug!("No auth listeners registered");
        }
    }
}

#[async_trait]
impl IdentityProvider for GoTrueClient {
    async fn get_session(&self) -> Result<Option<Session>, ProviderError> {
        let data = self.session.lock().data.clone();
        let Some(data) = data else {
            return Ok(None);
        };

        if !data.needs_refresh() {
            return Ok(data.to_session());
        }

        let Some(refresh_token) = data.refresh_token.clone() else {
            info!("Session expired without a refresh token");
            self.drop_session();
            return Ok(None);
        };

        debug!(minutes_left = data.minutes_until_expiry(), "Refreshing access token");
        match self
            .token_grant("refresh_token", json!({ "refresh_token": refresh_token }))
            .await
        {
            Ok(fresh) => self
                .establish(fresh, AuthChangeKind::TokenRefreshed)
                .map(Some),
            Err(e) if e.status.is_some_and(|s| (400..500).contains(&s)) => {
                warn!(error = %e, "Refresh token rejected, signing out");
                self.drop_session();
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthChange> {
        self.events.subscribe()
    }

    async fn sign_in_with_oauth(
        &self,
        provider: &str,
        redirect_to: &str,
    ) -> Result<String, ProviderError> {
        if provider.trim().is_empty() {
            return Err(ProviderError::new("OAuth provider required"));
        }
        let url = self.endpoint(
            "authorize",
            &[("provider", provider), ("redirect_to", redirect_to)],
        )?;
        Ok(url.to_string())
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, ProviderError> {
        let data = self
            .token_grant("password", json!({ "email": email, "password": password }))
            .await?;
        info!("Password sign-in succeeded");
        self.establish(data, AuthChangeKind::SignedIn)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        redirect_to: &str,
    ) -> Result<SignUpOutcome, ProviderError> {
        let url = self.endpoint("signup", &[("redirect_to", redirect_to)])?;
        let response = self
            .post_json(url, &json!({ "email": email, "password": password }), None)
            .await?;
        let body: Value = response.json().await?;

        // Auto-confirmed projects answer with a full session, others with the user only
        if body.get("access_token").is_some() {
            let token: TokenResponse = serde_json::from_value(body)
                .map_err(|e| ProviderError::new(format!("Unexpected sign-up response: {}", e)))?;
            let session = self.establish(token.into_session_data(), AuthChangeKind::SignedIn)?;
            Ok(SignUpOutcome::SignedIn(session))
        } else {
            info!("Sign-up confirmation email sent");
            Ok(SignUpOutcome::ConfirmationSent)
        }
    }

    async fn sign_in_with_otp(&self, email: &str, redirect_to: &str) -> Result<(), ProviderError> {
        let url = self.endpoint("otp", &[("redirect_to", redirect_to)])?;
        self.post_json(url, &json!({ "email": email, "create_user": true }), None)
            .await?;
        info!("Magic link sent");
        Ok(())
    }

    async fn complete_redirect(&self, callback_url: &str) -> Result<Session, ProviderError> {
        let tokens = parse_callback(callback_url)?;
        let user = self.fetch_user(&tokens.access_token).await?;
        let data = SessionData {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: tokens.expires_at,
            user,
        };
        self.establish(data, AuthChangeKind::SignedIn)
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        let token = self
            .session
            .lock()
            .data
            .as_ref()
            .map(|d| d.access_token.clone());

        if let Some(token) = token {
            let url = self.endpoint("logout", &[])?;
            match self.post_json(url, &json!({}), Some(&token)).await {
                Ok(_) => {}
                // The token is already dead server-side; finish locally
                Err(e)
                    if e.status == Some(StatusCode::UNAUTHORIZED.as_u16())
                        || e.status == Some(StatusCode::NOT_FOUND.as_u16()) =>
                {
                    debug!(error = %e, "Session already invalid on sign-out");
                }
                Err(e) => return Err(e),
            }
        }

        self.drop_session();
        info!("Signed out");
        Ok(())
    }
}
