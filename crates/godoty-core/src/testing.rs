//! In-crate fakes for every collaborator seam.
//!
//! Each fake records its calls so tests can assert on how many network
//! requests an operation made, and can be told to fail its next call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Map};
use tokio::sync::{broadcast, mpsc};

use crate::account::{Account, AccountParts};
use crate::api::{AccountEndpoints, ApiError, CheckoutSession};
use crate::auth::{AuthChange, AuthChangeKind, IdentityProvider, ProviderError, Session, SignUpOutcome};
use crate::cache::{CredentialCache, MemoryStorage};
use crate::credit::{BalanceSource, QueryError};
use crate::models::{BalanceRow, BudgetRow, CachedCredential};
use crate::realtime::{ChannelSpec, RealtimeChannel, RealtimeError, RowChange};
use crate::redirect::Redirect;
use crate::session::AuthEvent;
use crate::store::AccountSnapshot;

pub(crate) const TEST_REDIRECT_URL: &str = "godoty://auth/callback";

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn session(user_id: &str) -> Session {
    Session {
        user_id: user_id.to_string(),
        access_token: format!("jwt-{}", user_id),
        email: Some(format!("{}@example.com", user_id)),
        raw_identity: json!({ "id": user_id }),
    }
}

pub(crate) fn credential(valid_for: chrono::Duration, budget: Option<f64>) -> CachedCredential {
    CachedCredential {
        token: "sk-cached".to_string(),
        expires_at: Utc::now() + valid_for,
        remaining_budget: budget,
        issuer: Map::new(),
    }
}

// ============================================================================
// Identity provider
// ============================================================================

#[derive(Default)]
struct ProviderInner {
    session: Option<Session>,
    next_session: Option<Session>,
    fail_next: Option<ProviderError>,
    fail_get_session: Option<ProviderError>,
    refresh_next: Option<Session>,
    calls: Vec<&'static str>,
}

pub(crate) struct MockIdentityProvider {
    inner: Mutex<ProviderInner>,
    events: broadcast::Sender<AuthChange>,
}

impl MockIdentityProvider {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Mutex::new(ProviderInner::default()),
            events,
        }
    }

    pub fn with_session(session: Session) -> Self {
        let provider = Self::new();
        provider.inner.lock().session = Some(session);
        provider
    }

    /// Session handed out by the next successful sign-in.
    pub fn set_next_session(&self, session: Session) {
        self.inner.lock().next_session = Some(session);
    }

    pub fn fail_next(&self, message: &str) {
        self.inner.lock().fail_next = Some(ProviderError::with_status(message, 400));
    }

    pub fn fail_get_session(&self, message: &str) {
        self.inner.lock().fail_get_session = Some(ProviderError::new(message));
    }

    /// Make the next `get_session` refresh the token to `session` and
    /// announce it, the way the provider does close to expiry.
    pub fn refresh_on_next_check(&self, session: Session) {
        self.inner.lock().refresh_next = Some(session);
    }

    /// Publish an event as if the provider changed state on its own.
    pub fn emit(&self, change: AuthChange) {
        if let Some(ref session) = change.session {
            self.inner.lock().session = Some(session.clone());
        } else {
            self.inner.lock().session = None;
        }
        let _ = self.events.send(change);
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.inner.lock().calls.iter().filter(|c| **c == name).count()
    }

    fn begin(&self, name: &'static str) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock();
        inner.calls.push(name);
        match inner.fail_next.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn sign_in(&self, email: Option<&str>) -> Session {
        let mut session = {
            let inner = self.inner.lock();
            inner.next_session.clone().unwrap_or_else(|| session("user-1"))
        };
        if let Some(email) = email {
            session.email = Some(email.to_string());
        }
        self.emit(AuthChange::new(AuthChangeKind::SignedIn, Some(session.clone())));
        session
    }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    async fn get_session(&self) -> Result<Option<Session>, ProviderError> {
        let refreshed = {
            let mut inner = self.inner.lock();
            inner.calls.push("get_session");
            if let Some(err) = inner.fail_get_session.take() {
                return Err(err);
            }
            match inner.refresh_next.take() {
                Some(session) => session,
                None => return Ok(inner.session.clone()),
            }
        };
        self.emit(AuthChange::new(AuthChangeKind::TokenRefreshed, Some(refreshed.clone())));
        Ok(Some(refreshed))
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthChange> {
        self.events.subscribe()
    }

    async fn sign_in_with_oauth(
        &self,
        provider: &str,
        redirect_to: &str,
    ) -> Result<String, ProviderError> {
        self.begin("sign_in_with_oauth")?;
        Ok(format!(
            "https://auth.example/authorize?provider={}&redirect_to={}",
            provider, redirect_to
        ))
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        _password: &str,
    ) -> Result<Session, ProviderError> {
        self.begin("sign_in_with_password")?;
        Ok(self.sign_in(Some(email)))
    }

    async fn sign_up(
        &self,
        _email: &str,
        _password: &str,
        _redirect_to: &str,
    ) -> Result<SignUpOutcome, ProviderError> {
        self.begin("sign_up")?;
        Ok(SignUpOutcome::ConfirmationSent)
    }

    async fn sign_in_with_otp(&self, _email: &str, _redirect_to: &str) -> Result<(), ProviderError> {
        self.begin("sign_in_with_otp")
    }

    async fn complete_redirect(&self, _callback_url: &str) -> Result<Session, ProviderError> {
        self.begin("complete_redirect")?;
        Ok(self.sign_in(None))
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        self.begin("sign_out")?;
        self.emit(AuthChange::signed_out());
        Ok(())
    }
}

// ============================================================================
// Balance source
// ============================================================================

struct BalanceInner {
    primary: Result<Option<BalanceRow>, QueryError>,
    fallback: Result<Option<BudgetRow>, QueryError>,
    primary_calls: usize,
    fallback_calls: usize,
}

pub(crate) struct MockBalanceSource {
    inner: Mutex<BalanceInner>,
}

impl MockBalanceSource {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BalanceInner {
                primary: Ok(None),
                fallback: Ok(None),
                primary_calls: 0,
                fallback_calls: 0,
            }),
        }
    }

    pub fn set_primary(&self, result: Result<Option<BalanceRow>, QueryError>) {
        self.inner.lock().primary = result;
    }

    pub fn set_fallback(&self, result: Result<Option<BudgetRow>, QueryError>) {
        self.inner.lock().fallback = result;
    }

    /// Primary view answers with a pre-computed balance.
    pub fn set_primary_balance(&self, max_budget: f64, spend: f64) {
        self.set_primary(Ok(Some(BalanceRow {
            max_budget,
            spend,
            remaining_balance: Some(max_budget - spend),
        })));
    }

    pub fn primary_calls(&self) -> usize {
        self.inner.lock().primary_calls
    }

    pub fn fallback_calls(&self) -> usize {
        self.inner.lock().fallback_calls
    }

    pub fn network_calls(&self) -> usize {
        let inner = self.inner.lock();
        inner.primary_calls + inner.fallback_calls
    }
}

#[async_trait]
impl BalanceSource for MockBalanceSource {
    async fn primary_balance(&self, _session: &Session) -> Result<Option<BalanceRow>, QueryError> {
        let mut inner = self.inner.lock();
        inner.primary_calls += 1;
        inner.primary.clone()
    }

    async fn fallback_balance(&self, _session: &Session) -> Result<Option<BudgetRow>, QueryError> {
        let mut inner = self.inner.lock();
        inner.fallback_calls += 1;
        inner.fallback.clone()
    }
}

// ============================================================================
// Realtime channel
// ============================================================================

#[derive(Default)]
struct RealtimeInner {
    senders: Vec<mpsc::Sender<RowChange>>,
    specs: Vec<ChannelSpec>,
    fail_next: Option<RealtimeError>,
}

pub(crate) struct MockRealtime {
    inner: Mutex<RealtimeInner>,
}

impl MockRealtime {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RealtimeInner::default()),
        }
    }

    pub fn fail_next(&self, message: &str) {
        self.inner.lock().fail_next = Some(RealtimeError::ConnectionFailed(message.to_string()));
    }

    pub fn subscribe_calls(&self) -> usize {
        self.inner.lock().specs.len()
    }

    pub fn last_spec(&self) -> Option<ChannelSpec> {
        self.inner.lock().specs.last().cloned()
    }

    /// Deliver a change on the most recently opened channel.
    pub async fn push(&self, change: RowChange) -> bool {
        let sender = self.inner.lock().senders.last().cloned();
        match sender {
            Some(tx) => tx.send(change).await.is_ok(),
            None => false,
        }
    }

    /// End the most recently opened channel from the server side.
    pub fn close_latest(&self) {
        self.inner.lock().senders.pop();
    }

    /// Channels whose consumer is still listening.
    pub fn open_channels(&self) -> usize {
        self.inner
            .lock()
            .senders
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Whether the consumer still holds the latest channel open.
    pub fn is_open(&self) -> bool {
        self.inner
            .lock()
            .senders
            .last()
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl RealtimeChannel for MockRealtime {
    async fn subscribe(&self, spec: ChannelSpec) -> Result<mpsc::Receiver<RowChange>, RealtimeError> {
        let mut inner = self.inner.lock();
        inner.specs.push(spec);
        if let Some(err) = inner.fail_next.take() {
            return Err(err);
        }
        let (tx, rx) = mpsc::channel(16);
        inner.senders.push(tx);
        Ok(rx)
    }
}

// ============================================================================
// Account endpoints
// ============================================================================

#[derive(Default)]
struct EndpointsInner {
    issue_calls: usize,
    checkout_calls: usize,
    bearers: Vec<String>,
    price_ids: Vec<String>,
    fail_next_issue: Option<ApiError>,
    fail_next_checkout: Option<ApiError>,
    issued_budget: Option<f64>,
    delay: Option<Duration>,
}

pub(crate) struct MockEndpoints {
    inner: Mutex<EndpointsInner>,
}

impl MockEndpoints {
    pub fn new() -> Self {
        let inner = EndpointsInner {
            issued_budget: Some(25.0),
            ..EndpointsInner::default()
        };
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Hold every response for `delay`, so concurrent callers overlap.
    pub fn set_delay(&self, delay: Duration) {
        self.inner.lock().delay = Some(delay);
    }

    pub fn set_issued_budget(&self, budget: Option<f64>) {
        self.inner.lock().issued_budget = budget;
    }

    pub fn fail_next_issue(&self, err: ApiError) {
        self.inner.lock().fail_next_issue = Some(err);
    }

    pub fn fail_next_checkout(&self, err: ApiError) {
        self.inner.lock().fail_next_checkout = Some(err);
    }

    pub fn issue_calls(&self) -> usize {
        self.inner.lock().issue_calls
    }

    pub fn checkout_calls(&self) -> usize {
        self.inner.lock().checkout_calls
    }

    pub fn last_bearer(&self) -> Option<String> {
        self.inner.lock().bearers.last().cloned()
    }

    pub fn last_price_id(&self) -> Option<String> {
        self.inner.lock().price_ids.last().cloned()
    }

    async fn pause(&self) {
        let delay = self.inner.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl AccountEndpoints for MockEndpoints {
    async fn issue_credential(&self, bearer: &str) -> Result<CachedCredential, ApiError> {
        let (failure, call, budget) = {
            let mut inner = self.inner.lock();
            inner.issue_calls += 1;
            inner.bearers.push(bearer.to_string());
            (inner.fail_next_issue.take(), inner.issue_calls, inner.issued_budget)
        };
        self.pause().await;
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(CachedCredential {
            token: format!("sk-issued-{}", call),
            expires_at: Utc::now() + chrono::Duration::hours(24),
            remaining_budget: budget,
            issuer: Map::new(),
        })
    }

    async fn create_checkout(
        &self,
        bearer: &str,
        price_id: &str,
    ) -> Result<CheckoutSession, ApiError> {
        let failure = {
            let mut inner = self.inner.lock();
            inner.checkout_calls += 1;
            inner.bearers.push(bearer.to_string());
            inner.price_ids.push(price_id.to_string());
            inner.fail_next_checkout.take()
        };
        self.pause().await;
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(CheckoutSession {
            url: format!("https://checkout.example/pay/{}", price_id),
        })
    }
}

// ============================================================================
// Redirect
// ============================================================================

#[derive(Default)]
pub(crate) struct RecordingRedirect {
    opened: Mutex<Vec<String>>,
    fail: Mutex<bool>,
}

impl RecordingRedirect {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self) {
        *self.fail.lock() = true;
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }
}

impl Redirect for RecordingRedirect {
    fn open(&self, url: &str) -> anyhow::Result<()> {
        if *self.fail.lock() {
            anyhow::bail!("no browser available");
        }
        self.opened.lock().push(url.to_string());
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

/// An `Account` wired to fakes, with handles on every fake.
pub(crate) struct Harness {
    pub account: Account,
    pub provider: Arc<MockIdentityProvider>,
    pub balances: Arc<MockBalanceSource>,
    pub realtime: Arc<MockRealtime>,
    pub endpoints: Arc<MockEndpoints>,
    pub redirect: Arc<RecordingRedirect>,
    pub storage: Arc<MemoryStorage>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_provider(MockIdentityProvider::new())
    }

    pub fn with_provider(provider: MockIdentityProvider) -> Self {
        let provider = Arc::new(provider);
        let balances = Arc::new(MockBalanceSource::new());
        let realtime = Arc::new(MockRealtime::new());
        let endpoints = Arc::new(MockEndpoints::new());
        let redirect = Arc::new(RecordingRedirect::new());
        let storage = Arc::new(MemoryStorage::new());

        let account = Account::with_parts(AccountParts {
            provider: provider.clone(),
            endpoints: endpoints.clone(),
            balances: balances.clone(),
            realtime: realtime.clone(),
            storage: storage.clone(),
            redirect: redirect.clone(),
            redirect_url: TEST_REDIRECT_URL.to_string(),
        });

        Self {
            account,
            provider,
            balances,
            realtime,
            endpoints,
            redirect,
            storage,
        }
    }

    /// A second view on the persisted credential.
    pub fn cache(&self) -> CredentialCache {
        CredentialCache::new(self.storage.clone())
    }

    /// Put the store straight into Authenticated, bypassing the manager.
    /// Returns the new session epoch.
    pub fn authenticate(&self, user_id: &str) -> u64 {
        self.account
            .store()
            .transition(AuthEvent::SessionChanged(Some(session(user_id))))
            .epoch
    }

    pub fn snapshot(&self) -> AccountSnapshot {
        self.account.store().snapshot()
    }

    /// Wait until a published snapshot satisfies `condition`.
    pub async fn wait_for(&self, condition: impl FnMut(&AccountSnapshot) -> bool) -> AccountSnapshot {
        let mut rx = self.account.store().watch();
        let snapshot = tokio::time::timeout(WAIT_TIMEOUT, rx.wait_for(condition))
            .await
            .expect("timed out waiting for account snapshot")
            .expect("store dropped")
            .clone();
        snapshot
    }
}
