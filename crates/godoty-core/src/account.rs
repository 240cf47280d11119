//! Composition root.
//!
//! Builds the shared `SessionStore` and every component around it, so that
//! front ends only ever hold one `Account`.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::api::{AccountEndpoints, ApiClient};
use crate::auth::{GoTrueClient, IdentityProvider};
use crate::cache::{CredentialCache, CredentialStorage, FileStorage, KeyringStorage, MemoryStorage};
use crate::checkout::CheckoutInitiator;
use crate::config::{Config, CredentialBackend};
use crate::credit::{BalanceSource, CreditSync};
use crate::issuer::KeyIssuer;
use crate::realtime::{PhoenixChannel, RealtimeChannel};
use crate::redirect::Redirect;
use crate::session::SessionManager;
use crate::store::SessionStore;

/// The external collaborators an `Account` is built from.
pub struct AccountParts {
    pub provider: Arc<dyn IdentityProvider>,
    pub endpoints: Arc<dyn AccountEndpoints>,
    pub balances: Arc<dyn BalanceSource>,
    pub realtime: Arc<dyn RealtimeChannel>,
    pub storage: Arc<dyn CredentialStorage>,
    pub redirect: Arc<dyn Redirect>,
    /// Where OAuth and magic-link flows return to
    pub redirect_url: String,
}

/// Every account component, wired to one shared store.
#[derive(Clone)]
pub struct Account {
    store: SessionStore,
    session: SessionManager,
    credits: CreditSync,
    keys: KeyIssuer,
    checkout: CheckoutInitiator,
}

impl Account {
    /// Build against the hosted backend described by `config`.
    pub fn from_config(config: &Config, redirect: Arc<dyn Redirect>) -> Result<Self> {
        if config.anon_key.is_empty() {
            warn!("No anon key configured; backend requests will be rejected");
        }

        let cache_dir = config.cache_dir()?;
        let http = ApiClient::build_http_client()?;
        let api = Arc::new(ApiClient::with_client(http.clone(), config));
        let provider = Arc::new(GoTrueClient::new(
            http,
            &config.project_url,
            &config.anon_key,
            cache_dir.clone(),
        ));

        let storage: Arc<dyn CredentialStorage> = match config.credential_backend {
            CredentialBackend::File => Arc::new(FileStorage::new(cache_dir)),
            CredentialBackend::Keyring => Arc::new(KeyringStorage),
            CredentialBackend::Memory => Arc::new(MemoryStorage::new()),
        };
        debug!(backend = storage.name(), "Virtual key storage selected");

        Ok(Self::with_parts(AccountParts {
            provider,
            endpoints: api.clone(),
            balances: api,
            realtime: Arc::new(PhoenixChannel::new(&config.realtime_url(), &config.anon_key)),
            storage,
            redirect,
            redirect_url: config.redirect_url.clone(),
        }))
    }

    pub fn with_parts(parts: AccountParts) -> Self {
        let store = SessionStore::new();
        let cache = CredentialCache::new(parts.storage);

        let credits = CreditSync::new(
            store.clone(),
            cache.clone(),
            parts.balances,
            parts.realtime,
        );
        let keys = KeyIssuer::new(store.clone(), cache.clone(), parts.endpoints.clone());
        let checkout = CheckoutInitiator::new(
            store.clone(),
            parts.provider.clone(),
            parts.endpoints,
            parts.redirect.clone(),
        );
        let session = SessionManager::new(
            store.clone(),
            cache,
            credits.clone(),
            parts.provider,
            parts.redirect,
            parts.redirect_url,
        );

        Self {
            store,
            session,
            credits,
            keys,
            checkout,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn credits(&self) -> &CreditSync {
        &self.credits
    }

    pub fn keys(&self) -> &KeyIssuer {
        &self.keys
    }

    pub fn checkout(&self) -> &CheckoutInitiator {
        &self.checkout
    }
}
