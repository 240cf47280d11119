//! Keeps the store's credit balance current.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{BalanceSource, QueryError};
use crate::cache::CredentialCache;
use crate::error::{AccountError, Result};
use crate::models::BudgetRow;
use crate::realtime::{ChannelSpec, RealtimeChannel};
use crate::store::{SessionStore, SubscriptionHandle};

/// Balance resolution and the realtime balance channel.
///
/// Clone is cheap; clones share the store, the cache and the sources.
#[derive(Clone)]
pub struct CreditSync {
    store: SessionStore,
    cache: CredentialCache,
    source: Arc<dyn BalanceSource>,
    realtime: Arc<dyn RealtimeChannel>,
}

impl CreditSync {
    pub fn new(
        store: SessionStore,
        cache: CredentialCache,
        source: Arc<dyn BalanceSource>,
        realtime: Arc<dyn RealtimeChannel>,
    ) -> Self {
        Self {
            store,
            cache,
            source,
            realtime,
        }
    }

    /// Resolve the balance and write it to the store.
    ///
    /// Order: the budget embedded in a valid cached credential, then the
    /// privileged view, then (only if the view does not exist) the raw
    /// budget table. Any other failure is logged and the balance is left as
    /// it was. Returns the balance written, if any.
    pub async fn fetch_balance(&self) -> Option<f64> {
        let Some((session, epoch)) = self.store.active_session() else {
            debug!("Not signed in, skipping balance fetch");
            return None;
        };

        if let Some(balance) = self.cache.read().and_then(|c| c.remaining_balance()) {
            debug!(balance, "Balance from cached credential");
            return self.store.set_balance(epoch, balance).then_some(balance);
        }

        let balance = match self.source.primary_balance(&session).await {
            Ok(Some(row)) => row.balance(),
            Ok(None) => {
                debug!(user_id = %session.user_id, "No balance row for user");
                return None;
            }
            Err(QueryError::RelationNotFound(detail)) => {
                warn!(detail = %detail, "Balance view missing, falling back to budget table");
                match self.source.fallback_balance(&session).await {
                    Ok(Some(row)) => row.balance(),
                    Ok(None) => {
                        debug!(user_id = %session.user_id, "No budget row for user");
                        return None;
                    }
                    Err(e) => {
                        warn!(error = %e, "Fallback balance query failed");
                        return None;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Balance query failed");
                return None;
            }
        };

        if self.store.set_balance(epoch, balance) {
            debug!(balance, "Balance updated");
            Some(balance)
        } else {
            debug!("Session changed during balance fetch, discarding result");
            None
        }
    }

    /// Open the realtime balance channel for the current user.
    ///
    /// No-op when signed out or when a channel is already open (or opening).
    /// A channel joined with an older access token is closed and reopened
    /// with the current one. Each change recomputes the balance from the
    /// row's new image; nothing is re-queried.
    pub async fn subscribe_realtime(&self) -> Result<()> {
        let Some((session, epoch)) = self.store.active_session() else {
            return Ok(());
        };
        if let Some(stale) = self.store.take_stale_subscription(epoch, session.bearer()) {
            info!(channel = %stale.channel(), "Access token changed, reopening realtime channel");
        }
        let Some(ticket) = self.store.reserve_subscription(epoch) else {
            debug!("Realtime balance channel already open");
            return Ok(());
        };

        let spec = ChannelSpec::user_budget(&session.user_id, session.bearer());
        let channel = spec.name.clone();
        let mut changes = match self.realtime.subscribe(spec).await {
            Ok(changes) => changes,
            Err(e) => {
                self.store.cancel_subscription(ticket);
                warn!(error = %e, "Failed to open realtime balance channel");
                return Err(AccountError::Realtime(e.to_string()));
            }
        };

        let store = self.store.clone();
        let pump = tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                let Some(row) = change.new_record.as_ref().and_then(BudgetRow::from_record) else {
                    debug!(kind = ?change.kind, "Ignoring balance change without new row");
                    continue;
                };
                let balance = row.balance();
                if store.set_balance(epoch, balance) {
                    debug!(balance, "Realtime balance update");
                }
            }
            debug!("Realtime balance stream ended");
            store.release_subscription(ticket);
        });

        match self
            .store
            .install_subscription(
                ticket,
                SubscriptionHandle::new(ticket, channel.as_str(), session.bearer(), pump),
            )
        {
            Ok(()) => {
                info!(user_id = %session.user_id, channel = %channel, "Subscribed to balance changes");
            }
            Err(stale) => {
                debug!(channel = %stale.channel(), "Subscription no longer wanted, closing");
            }
        }
        Ok(())
    }

    /// Close the realtime channel. Idempotent.
    pub fn unsubscribe(&self) {
        if let Some(handle) = self.store.take_subscription() {
            info!(channel = %handle.channel(), "Unsubscribed from balance changes");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BalanceRow, BudgetRow};
    use crate::realtime::{ChangeKind, RowChange};
    use crate::session::AuthEvent;
    use crate::testing::{credential, session, Harness};
    use chrono::Duration;
    use serde_json::json;

    fn update(record: serde_json::Value) -> RowChange {
        RowChange {
            kind: ChangeKind::Update,
            new_record: Some(record),
        }
    }

    #[tokio::test]
    async fn test_fetch_signed_out_is_noop() {
        let h = Harness::new();
        assert_eq!(h.account.credits().fetch_balance().await, None);
        assert_eq!(h.balances.network_calls(), 0);
    }

    #[tokio::test]
    async fn test_fetch_clamps_overspend() {
        let h = Harness::new();
        h.authenticate("u1");
        h.balances.set_primary(Ok(Some(BalanceRow {
            max_budget: 10.0,
            spend: 15.0,
            remaining_balance: Some(-5.0),
        })));

        assert_eq!(h.account.credits().fetch_balance().await, Some(0.0));
        assert_eq!(h.snapshot().balance, 0.0);
    }

    #[tokio::test]
    async fn test_fetch_falls_back_when_view_missing() {
        let h = Harness::new();
        h.authenticate("u1");
        h.balances
            .set_primary(Err(QueryError::RelationNotFound("user_credit_balance".to_string())));
        h.balances.set_fallback(Ok(Some(BudgetRow {
            max_budget: 50.0,
            spend: 20.0,
        })));

        assert_eq!(h.account.credits().fetch_balance().await, Some(30.0));
        assert_eq!(h.snapshot().balance, 30.0);
        assert_eq!(h.balances.fallback_calls(), 1);
    }

    #[tokio::test]
    async fn test_fetch_other_failure_leaves_balance() {
        let h = Harness::new();
        let epoch = h.authenticate("u1");
        h.account.store().set_balance(epoch, 8.0);
        h.balances
            .set_primary(Err(QueryError::Failed("permission denied".to_string())));

        assert_eq!(h.account.credits().fetch_balance().await, None);
        assert_eq!(h.snapshot().balance, 8.0);
        assert_eq!(h.balances.fallback_calls(), 0);
    }

    #[tokio::test]
    async fn test_fetch_prefers_cached_credential_budget() {
        let h = Harness::new();
        h.authenticate("u1");
        h.cache()
            .write(&credential(Duration::hours(2), Some(12.0)))
            .unwrap();
        h.balances.set_primary_balance(100.0, 0.0);

        assert_eq!(h.account.credits().fetch_balance().await, Some(12.0));
        assert_eq!(h.balances.network_calls(), 0);
    }

    #[tokio::test]
    async fn test_fetch_queries_when_cached_credential_has_no_budget() {
        let h = Harness::new();
        h.authenticate("u1");
        h.cache().write(&credential(Duration::hours(2), None)).unwrap();
        h.balances.set_primary_balance(100.0, 40.0);

        assert_eq!(h.account.credits().fetch_balance().await, Some(60.0));
        assert_eq!(h.balances.primary_calls(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_twice_opens_one_channel() {
        let h = Harness::new();
        h.authenticate("u1");
        let credits = h.account.credits();

        credits.subscribe_realtime().await.unwrap();
        credits.subscribe_realtime().await.unwrap();

        assert_eq!(h.realtime.subscribe_calls(), 1);
        assert!(h.snapshot().subscribed);
        let spec = h.realtime.last_spec().unwrap();
        assert_eq!(spec.filter, "user_id=eq.u1");
        assert_eq!(spec.access_token, "jwt-u1");
    }

    #[tokio::test]
    async fn test_concurrent_subscribe_opens_one_channel() {
        let h = Harness::new();
        h.authenticate("u1");
        let a = h.account.credits();
        let b = a.clone();

        let (ra, rb) = tokio::join!(a.subscribe_realtime(), b.subscribe_realtime());
        ra.unwrap();
        rb.unwrap();
        assert_eq!(h.realtime.subscribe_calls(), 1);
    }

    #[tokio::test]
    async fn test_refreshed_token_reopens_channel() {
        let h = Harness::new();
        h.authenticate("u1");
        let credits = h.account.credits();
        credits.subscribe_realtime().await.unwrap();

        let mut refreshed = session("u1");
        refreshed.access_token = "jwt-refreshed".to_string();
        h.account
            .store()
            .transition(AuthEvent::SessionChanged(Some(refreshed)));
        credits.subscribe_realtime().await.unwrap();

        assert_eq!(h.realtime.subscribe_calls(), 2);
        assert_eq!(h.realtime.last_spec().unwrap().access_token, "jwt-refreshed");
        assert!(h.snapshot().subscribed);

        // The old pump is aborted, which drops its receiver
        for _ in 0..10 {
            if h.realtime.open_channels() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(h.realtime.open_channels(), 1);

        // Same token again: the open channel is kept
        credits.subscribe_realtime().await.unwrap();
        assert_eq!(h.realtime.subscribe_calls(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_signed_out_is_noop() {
        let h = Harness::new();
        h.account.credits().subscribe_realtime().await.unwrap();
        assert_eq!(h.realtime.subscribe_calls(), 0);
    }

    #[tokio::test]
    async fn test_realtime_change_updates_balance_without_query() {
        let h = Harness::new();
        h.authenticate("u1");
        h.account.credits().subscribe_realtime().await.unwrap();

        assert!(h.realtime.push(update(json!({"user_id": "u1", "max_budget": 100, "spend": 40}))).await);
        h.wait_for(|s| s.balance == 60.0).await;
        assert_eq!(h.balances.network_calls(), 0);
    }

    #[tokio::test]
    async fn test_realtime_string_amounts_and_overspend() {
        let h = Harness::new();
        h.authenticate("u1");
        h.account.credits().subscribe_realtime().await.unwrap();

        h.realtime.push(update(json!({"max_budget": "20.5", "spend": "0.5"}))).await;
        h.wait_for(|s| s.balance == 20.0).await;

        h.realtime.push(update(json!({"max_budget": 5, "spend": 9}))).await;
        h.wait_for(|s| s.balance == 0.0).await;
    }

    #[tokio::test]
    async fn test_realtime_delete_ignored() {
        let h = Harness::new();
        let epoch = h.authenticate("u1");
        h.account.store().set_balance(epoch, 4.0);
        h.account.credits().subscribe_realtime().await.unwrap();

        h.realtime
            .push(RowChange {
                kind: ChangeKind::Delete,
                new_record: None,
            })
            .await;
        h.realtime.push(update(json!({"max_budget": 9, "spend": 1}))).await;

        // The later update proves the delete was consumed without effect
        h.wait_for(|s| s.balance == 8.0).await;
    }

    #[tokio::test]
    async fn test_subscribe_failure_frees_slot() {
        let h = Harness::new();
        h.authenticate("u1");
        h.realtime.fail_next("refused");
        let credits = h.account.credits();

        let err = credits.subscribe_realtime().await.unwrap_err();
        assert!(matches!(err, AccountError::Realtime(_)));
        assert!(!h.snapshot().subscribed);

        credits.subscribe_realtime().await.unwrap();
        assert_eq!(h.realtime.subscribe_calls(), 2);
        assert!(h.snapshot().subscribed);
    }

    #[tokio::test]
    async fn test_server_closing_stream_frees_slot() {
        let h = Harness::new();
        h.authenticate("u1");
        let credits = h.account.credits();
        credits.subscribe_realtime().await.unwrap();

        h.realtime.close_latest();
        h.wait_for(|s| !s.subscribed).await;

        credits.subscribe_realtime().await.unwrap();
        assert_eq!(h.realtime.subscribe_calls(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_channel_and_is_idempotent() {
        let h = Harness::new();
        h.authenticate("u1");
        let credits = h.account.credits();
        credits.subscribe_realtime().await.unwrap();
        assert!(h.realtime.is_open());

        credits.unsubscribe();
        credits.unsubscribe();
        assert!(!h.snapshot().subscribed);

        // The aborted pump drops the receiver once the runtime polls it
        for _ in 0..10 {
            if !h.realtime.is_open() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!h.realtime.is_open());
    }

    #[tokio::test]
    async fn test_late_realtime_change_after_sign_out_dropped() {
        let h = Harness::new();
        h.authenticate("u1");
        h.account.credits().subscribe_realtime().await.unwrap();
        let transition = h.account.store().transition(AuthEvent::SignedOut);
        // Keep the pump alive past the reset to simulate a late delivery
        let handle = transition.released.unwrap();

        h.realtime.push(update(json!({"max_budget": 100, "spend": 1}))).await;
        tokio::task::yield_now().await;
        assert_eq!(h.snapshot().balance, 0.0);
        drop(handle);
    }
}
