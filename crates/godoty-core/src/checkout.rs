//! Credit purchase hand-off to the payment processor.

use std::sync::Arc;

use tracing::{info, warn};

use crate::api::AccountEndpoints;
use crate::auth::IdentityProvider;
use crate::error::{AccountError, Result};
use crate::redirect::Redirect;
use crate::store::SessionStore;

const CHECKOUT_FALLBACK_MESSAGE: &str = "Failed to create checkout session";

/// One-shot checkout creation. Never touches account state; the balance
/// changes later through the realtime channel once payment lands.
#[derive(Clone)]
pub struct CheckoutInitiator {
    store: SessionStore,
    provider: Arc<dyn IdentityProvider>,
    endpoints: Arc<dyn AccountEndpoints>,
    redirect: Arc<dyn Redirect>,
}

impl CheckoutInitiator {
    pub fn new(
        store: SessionStore,
        provider: Arc<dyn IdentityProvider>,
        endpoints: Arc<dyn AccountEndpoints>,
        redirect: Arc<dyn Redirect>,
    ) -> Self {
        Self {
            store,
            provider,
            endpoints,
            redirect,
        }
    }

    /// Create a checkout session for `price_id` and send the user to it.
    /// Returns the checkout URL.
    pub async fn purchase_credits(&self, price_id: &str) -> Result<String> {
        if self.store.session().is_none() {
            return Err(AccountError::AuthRequired("purchase credits"));
        }

        // The stored token may be close to expiry; ask the provider for a
        // current one.
        let session = self
            .provider
            .get_session()
            .await?
            .ok_or(AccountError::AuthRequired("purchase credits"))?;

        let checkout = self
            .endpoints
            .create_checkout(session.bearer(), price_id)
            .await
            .map_err(|e| {
                warn!(price_id, error = %e, "Checkout creation failed");
                AccountError::from_endpoint(e, CHECKOUT_FALLBACK_MESSAGE)
            })?;

        info!(price_id, "Redirecting to checkout");
        self.redirect.open(&checkout.url).map_err(|e| {
            warn!(error = %e, "Failed to open checkout page");
            AccountError::Redirect(checkout.url.clone())
        })?;
        Ok(checkout.url)
    }
}
