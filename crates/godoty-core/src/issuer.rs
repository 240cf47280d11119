//! Virtual key issuance.
//!
//! `generate_key` serves a valid cached key without touching the network.
//! Otherwise it requests a new one from the issuing endpoint. Concurrent
//! callers within one session share a single in-flight request: the first
//! caller spawns it, later callers await the same shared result.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::api::AccountEndpoints;
use crate::auth::Session;
use crate::cache::CredentialCache;
use crate::error::{AccountError, Result};
use crate::models::CachedCredential;
use crate::store::SessionStore;

const ISSUE_FALLBACK_MESSAGE: &str = "Failed to generate API key";

type IssueFuture = Shared<BoxFuture<'static, Result<CachedCredential>>>;

struct InFlight {
    id: u64,
    epoch: u64,
    future: IssueFuture,
}

struct IssuerInner {
    store: SessionStore,
    cache: CredentialCache,
    endpoints: Arc<dyn AccountEndpoints>,
    in_flight: Mutex<Option<InFlight>>,
    next_id: Mutex<u64>,
}

/// Clone is cheap; clones share the in-flight request.
#[derive(Clone)]
pub struct KeyIssuer {
    inner: Arc<IssuerInner>,
}

impl KeyIssuer {
    pub fn new(
        store: SessionStore,
        cache: CredentialCache,
        endpoints: Arc<dyn AccountEndpoints>,
    ) -> Self {
        Self {
            inner: Arc::new(IssuerInner {
                store,
                cache,
                endpoints,
                in_flight: Mutex::new(None),
                next_id: Mutex::new(0),
            }),
        }
    }

    /// Return the account's virtual key, issuing a new one when the cache
    /// has no valid entry or `force_refresh` is set.
    pub async fn generate_key(&self, force_refresh: bool) -> Result<CachedCredential> {
        let store = &self.inner.store;
        let Some((session, epoch)) = store.active_session() else {
            return Err(AccountError::AuthRequired("generate API key"));
        };
        store.set_error(None);

        if !force_refresh {
            if let Some(credential) = self.inner.cache.read() {
                debug!(
                    key = %credential.masked_token(),
                    minutes_left = credential.minutes_until_refresh(),
                    "Using cached virtual key"
                );
                store.set_credential(epoch, credential.clone());
                return Ok(credential);
            }
        }

        let pending = self.issue(session, epoch);
        let result = pending.await;
        if let Err(ref e) = result {
            if store.is_current(epoch) {
                store.set_error(Some(e.user_message()));
            }
        }
        result
    }

    /// Join the in-flight request for `epoch`, or start one.
    fn issue(&self, session: Session, epoch: u64) -> IssueFuture {
        // Held across spawn and insert, so the finishing task cannot clear
        // the slot before its entry is in it.
        let mut slot = self.inner.in_flight.lock();
        if let Some(ref in_flight) = *slot {
            if in_flight.epoch == epoch {
                debug!(request = in_flight.id, "Joining in-flight key request");
                return in_flight.future.clone();
            }
        }

        let id = {
            let mut next = self.inner.next_id.lock();
            *next += 1;
            *next
        };
        let guard = IssuingGuard::new(self.inner.clone(), id);
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            inner.request(session, epoch).await
        });

        let future = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "Key request task failed");
                    Err(AccountError::Issuing(ISSUE_FALLBACK_MESSAGE.to_string()))
                }
            }
        }
        .boxed()
        .shared();

        *slot = Some(InFlight {
            id,
            epoch,
            future: future.clone(),
        });
        future
    }
}

impl IssuerInner {
    async fn request(&self, session: Session, epoch: u64) -> Result<CachedCredential> {
        info!(user_id = %session.user_id, "Requesting virtual key");
        let credential = self
            .endpoints
            .issue_credential(session.bearer())
            .await
            .map_err(|e| {
                warn!(error = %e, "Virtual key request failed");
                AccountError::from_endpoint(e, ISSUE_FALLBACK_MESSAGE)
            })?;

        if !self.store.is_current(epoch) {
            warn!("Session ended during key request, discarding key");
            return Err(AccountError::AuthRequired("generate API key"));
        }

        if let Err(e) = self.cache.write(&credential) {
            warn!(error = %e, "Failed to persist virtual key");
        }

        // A sign-out between the check above and the write must not leave
        // the key on disk.
        if !self.store.set_credential(epoch, credential.clone()) {
            if let Err(e) = self.cache.clear() {
                warn!(error = %e, "Failed to clear virtual key after sign-out");
            }
            return Err(AccountError::AuthRequired("generate API key"));
        }

        info!(
            key = %credential.masked_token(),
            expires_at = %credential.expires_at,
            "Virtual key issued"
        );
        Ok(credential)
    }
}

/// Marks issuance in progress for its lifetime and frees the in-flight slot
/// when the request task ends, whatever the outcome.
struct IssuingGuard {
    inner: Arc<IssuerInner>,
    id: u64,
}

impl IssuingGuard {
    fn new(inner: Arc<IssuerInner>, id: u64) -> Self {
        inner.store.set_issuing(true);
        Self { inner, id }
    }
}

impl Drop for IssuingGuard {
    fn drop(&mut self) {
        let mut slot = self.inner.in_flight.lock();
        if slot.as_ref().is_some_and(|f| f.id == self.id) {
            *slot = None;
        }
        let idle = slot.is_none();
        drop(slot);
        if idle {
            self.inner.store.set_issuing(false);
        }
    }
}
