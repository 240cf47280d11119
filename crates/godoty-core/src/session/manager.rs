//! Session lifecycle.
//!
//! `SessionManager` resolves the initial session, then follows the identity
//! provider's auth-state-change stream. Every transition, whether from
//! startup, a provider event or a local sign-out, goes through
//! `AuthState::on_event` and the resulting actions are run here.
//!
//! While running, the manager also checks the session periodically. The
//! provider refreshes an access token close to expiry and announces it on
//! its event stream, which reopens the realtime channel with the new token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::state::{AuthAction, AuthEvent};
use crate::auth::{AuthChange, IdentityProvider, ProviderError, SignUpOutcome};
use crate::cache::CredentialCache;
use crate::credit::CreditSync;
use crate::error::{AccountError, Result};
use crate::redirect::Redirect;
use crate::store::{SessionStore, Transition};

/// How often the session is checked. Shorter than the provider's refresh
/// buffer so a token is renewed before it expires.
pub const SESSION_CHECK_INTERVAL: Duration = Duration::from_secs(30);

struct ManagerInner {
    store: SessionStore,
    cache: CredentialCache,
    credits: CreditSync,
    provider: Arc<dyn IdentityProvider>,
    redirect: Arc<dyn Redirect>,
    redirect_url: String,
    initialized: AtomicBool,
    /// Startup could not reach the provider; retried on each session check
    resolve_pending: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Clone is cheap; clones drive the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(
        store: SessionStore,
        cache: CredentialCache,
        credits: CreditSync,
        provider: Arc<dyn IdentityProvider>,
        redirect: Arc<dyn Redirect>,
        redirect_url: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                cache,
                credits,
                provider,
                redirect,
                redirect_url: redirect_url.into(),
                initialized: AtomicBool::new(false),
                resolve_pending: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    /// Resolve the current session once and start following provider
    /// events. Later calls do nothing.
    pub async fn init(&self) {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            debug!("Session manager already initialized");
            return;
        }

        // Subscribe before resolving so no event between the two is lost
        let events = self.inner.provider.subscribe();

        let store = &self.inner.store;
        store.set_loading(true);
        self.apply(AuthEvent::Resolving).await;

        let event = match self.inner.provider.get_session().await {
            Ok(session) => {
                match session {
                    Some(ref s) => info!(user_id = %s.user_id, "Restored session"),
                    None => info!("No existing session"),
                }
                AuthEvent::SessionChanged(session)
            }
            Err(e) => {
                warn!(error = %e, "Failed to resolve session, starting signed out");
                self.inner.resolve_pending.store(true, Ordering::SeqCst);
                AuthEvent::ResolveFailed
            }
        };
        self.apply(event).await;
        store.set_loading(false);

        let weak = Arc::downgrade(&self.inner);
        let listener = tokio::spawn(listen(weak.clone(), events));
        let checker = tokio::spawn(check_session(weak));
        self.inner.tasks.lock().extend([listener, checker]);
    }

    /// Run one event through the state machine and execute its actions.
    async fn apply(&self, event: AuthEvent) {
        let cache = &self.inner.cache;
        let Transition {
            actions,
            mut released,
            ..
        } = self.inner.store.transition_with(event, || {
            if let Err(e) = cache.clear() {
                warn!(error = %e, "Failed to clear cached virtual key");
            }
        });

        for action in actions {
            match action {
                AuthAction::ResetAccount => {
                    if let Some(handle) = released.take() {
                        debug!(channel = %handle.channel(), "Closing realtime channel");
                    }
                    self.inner.credits.unsubscribe();
                }
                AuthAction::FetchBalance => {
                    self.inner.credits.fetch_balance().await;
                }
                AuthAction::SubscribeRealtime => {
                    if let Err(e) = self.inner.credits.subscribe_realtime().await {
                        warn!(error = %e, "Realtime balance updates unavailable");
                    }
                }
            }
        }
    }

    /// Record a provider failure and convert it for the caller.
    fn provider_failure(&self, operation: &str, err: ProviderError) -> AccountError {
        warn!(operation, status = ?err.status, error = %err, "Identity provider request failed");
        self.inner.store.set_error(Some(err.message.clone()));
        AccountError::from(err)
    }

    /// Start an OAuth sign-in and hand the authorize URL to the user.
    /// The session arrives later through `complete_redirect`.
    pub async fn sign_in_with_oauth(&self, provider: &str) -> Result<String> {
        self.inner.store.set_error(None);
        let url = self
            .inner
            .provider
            .sign_in_with_oauth(provider, &self.inner.redirect_url)
            .await
            .map_err(|e| self.provider_failure("oauth", e))?;

        info!(provider, "Opening OAuth sign-in");
        self.inner.redirect.open(&url).map_err(|e| {
            warn!(error = %e, "Failed to open OAuth sign-in page");
            AccountError::Redirect(url.clone())
        })?;
        Ok(url)
    }

    /// Password sign-in. State changes arrive through the provider's event
    /// stream, not from this call.
    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<()> {
        self.inner.store.set_error(None);
        self.inner
            .provider
            .sign_in_with_password(email, password)
            .await
            .map_err(|e| self.provider_failure("password sign-in", e))?;
        debug!("Password sign-in accepted");
        Ok(())
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpOutcome> {
        self.inner.store.set_error(None);
        let outcome = self
            .inner
            .provider
            .sign_up(email, password, &self.inner.redirect_url)
            .await
            .map_err(|e| self.provider_failure("sign-up", e))?;
        if outcome == SignUpOutcome::ConfirmationSent {
            info!("Sign-up confirmation email sent");
        }
        Ok(outcome)
    }

    pub async fn sign_in_with_magic_link(&self, email: &str) -> Result<()> {
        self.inner.store.set_error(None);
        self.inner
            .provider
            .sign_in_with_otp(email, &self.inner.redirect_url)
            .await
            .map_err(|e| self.provider_failure("magic link", e))?;
        info!("Magic link sent");
        Ok(())
    }

    /// Finish an OAuth or magic-link sign-in from the callback URL.
    pub async fn complete_redirect(&self, callback_url: &str) -> Result<()> {
        self.inner.store.set_error(None);
        self.inner
            .provider
            .complete_redirect(callback_url)
            .await
            .map_err(|e| self.provider_failure("auth callback", e))?;
        Ok(())
    }

    /// Sign out. On success the account is reset before this returns; on
    /// failure nothing changes.
    pub async fn sign_out(&self) -> Result<()> {
        self.inner.store.set_error(None);
        self.inner
            .provider
            .sign_out()
            .await
            .map_err(|e| self.provider_failure("sign-out", e))?;
        info!("Signed out");
        self.apply(AuthEvent::SignedOut).await;
        Ok(())
    }

    /// Stop following provider events and close the realtime channel.
    pub fn shutdown(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.credits.unsubscribe();
        debug!("Session manager shut down");
    }
}

async fn listen(inner: Weak<ManagerInner>, mut events: broadcast::Receiver<AuthChange>) {
    loop {
        let event = match events.recv().await {
            Ok(change) => {
                debug!(kind = ?change.kind, "Auth state change");
                AuthEvent::SessionChanged(change.session)
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed auth events, re-resolving session");
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                match inner.provider.get_session().await {
                    Ok(session) => AuthEvent::SessionChanged(session),
                    Err(e) => {
                        warn!(error = %e, "Failed to re-resolve session");
                        continue;
                    }
                }
            }
            Err(RecvError::Closed) => {
                debug!("Auth event stream closed");
                break;
            }
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        SessionManager { inner }.apply(event).await;
    }
}

async fn check_session(inner: Weak<ManagerInner>) {
    let mut ticker =
        tokio::time::interval_at(Instant::now() + SESSION_CHECK_INTERVAL, SESSION_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };

        let signed_in = inner.store.session().is_some();
        if !signed_in && inner.resolve_pending.load(Ordering::SeqCst) {
            let resolved = inner.provider.get_session().await;
            match resolved {
                Ok(session) => {
                    inner.resolve_pending.store(false, Ordering::SeqCst);
                    info!(restored = session.is_some(), "Session resolved after startup failure");
                    SessionManager { inner }
                        .apply(AuthEvent::SessionChanged(session))
                        .await;
                }
                Err(e) => debug!(error = %e, "Session still unresolved"),
            }
            continue;
        }

        // Changes, including a refreshed token, arrive on the event stream
        if signed_in {
            if let Err(e) = inner.provider.get_session().await {
                warn!(error = %e, "Session check failed");
            }
        }
    }
}
