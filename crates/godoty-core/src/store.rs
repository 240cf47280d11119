//! Shared account state.
//!
//! `SessionStore` is built once by the composition root and cloned into every
//! component. All mutation happens under one lock, and every mutation
//! publishes a fresh `AccountSnapshot` on a watch channel for the UI.
//!
//! Writes that belong to a session carry the epoch they were started in.
//! The epoch changes whenever the signed-in user changes (sign-in, sign-out,
//! account switch), so results that resolve late are dropped instead of
//! resurrecting state for a session that no longer exists.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::auth::Session;
use crate::models::amount::non_negative;
use crate::models::CachedCredential;
use crate::session::state::{AuthAction, AuthEvent, AuthPhase, AuthState};

/// Point-in-time view of the account, published on every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountSnapshot {
    pub phase: AuthPhase,
    pub user_id: Option<String>,
    pub email: Option<String>,
    /// Always >= 0
    pub balance: f64,
    pub credential: Option<CachedCredential>,
    /// A virtual key request is in flight
    pub issuing: bool,
    /// A realtime balance channel is open
    pub subscribed: bool,
    /// Initial session resolution in progress
    pub loading: bool,
    pub last_error: Option<String>,
}

impl AccountSnapshot {
    pub fn is_authenticated(&self) -> bool {
        self.phase == AuthPhase::Authenticated
    }
}

/// An open realtime channel. Dropping the handle stops the task pumping
/// changes into the store, which in turn closes the channel.
pub struct SubscriptionHandle {
    id: u64,
    channel: String,
    /// Token the channel was joined with
    access_token: String,
    pump: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn new(
        id: u64,
        channel: impl Into<String>,
        access_token: impl Into<String>,
        pump: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            channel: channel.into(),
            access_token: access_token.into(),
            pump,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .finish()
    }
}

/// At most one subscription exists. `Pending` reserves the slot while the
/// channel is being opened so a second caller does not open another.
#[derive(Debug, Default)]
enum SubscriptionSlot {
    #[default]
    Empty,
    Pending {
        ticket: u64,
    },
    Active(SubscriptionHandle),
}

#[derive(Debug, Default)]
struct StoreState {
    auth: AuthState,
    balance: f64,
    credential: Option<CachedCredential>,
    issuing: bool,
    loading: bool,
    last_error: Option<String>,
    subscription: SubscriptionSlot,
    epoch: u64,
    next_ticket: u64,
}

impl StoreState {
    fn snapshot(&self) -> AccountSnapshot {
        let session = self.auth.session();
        AccountSnapshot {
            phase: self.auth.phase(),
            user_id: session.map(|s| s.user_id.clone()),
            email: session.and_then(|s| s.email.clone()),
            balance: self.balance,
            credential: self.credential.clone(),
            issuing: self.issuing,
            subscribed: matches!(self.subscription, SubscriptionSlot::Active(_)),
            loading: self.loading,
            last_error: self.last_error.clone(),
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.auth.session().is_some()
    }
}

/// Result of applying an auth event.
#[derive(Debug)]
pub struct Transition {
    /// Side effects the caller must run, in order
    pub actions: Vec<AuthAction>,
    /// Epoch after the transition
    pub epoch: u64,
    /// Subscription removed by an account reset, to be dropped by the caller
    pub released: Option<SubscriptionHandle>,
}

/// Clone is cheap; clones share the same state.
#[derive(Clone)]
pub struct SessionStore {
    state: Arc<Mutex<StoreState>>,
    snapshots: Arc<watch::Sender<AccountSnapshot>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(AccountSnapshot::default());
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            snapshots: Arc::new(tx),
        }
    }

    /// Receiver that sees every published snapshot.
    pub fn watch(&self) -> watch::Receiver<AccountSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> AccountSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Run `f` under the lock and publish the result. Publishing under the
    /// lock keeps snapshots in mutation order.
    fn mutate<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let mut state = self.state.lock();
        let result = f(&mut state);
        self.snapshots.send_replace(state.snapshot());
        result
    }

    pub fn session(&self) -> Option<Session> {
        self.state.lock().auth.session().cloned()
    }

    /// The current session and the epoch it belongs to.
    pub fn active_session(&self) -> Option<(Session, u64)> {
        let state = self.state.lock();
        state.auth.session().map(|s| (s.clone(), state.epoch))
    }

    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// True while `epoch` is the epoch of a live session.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.state.lock().is_current(epoch)
    }

    /// Feed an event through the auth state machine.
    ///
    /// An account reset clears the balance, the in-memory credential and the
    /// subscription in the same critical section as the state change, so no
    /// snapshot ever shows a signed-out user with leftover account data.
    pub fn transition(&self, event: AuthEvent) -> Transition {
        self.transition_with(event, || {})
    }

    /// Like `transition`, but runs `on_reset` inside the critical section
    /// when the transition resets the account, before the new state is
    /// published. Nothing that reacts to the new state can observe what
    /// `on_reset` removes.
    pub fn transition_with(&self, event: AuthEvent, on_reset: impl FnOnce()) -> Transition {
        self.mutate(|state| {
            let previous_user = state.auth.session().map(|s| s.user_id.clone());
            let (next, actions) = std::mem::take(&mut state.auth).on_event(event);
            let next_user = next.session().map(|s| s.user_id.clone());
            state.auth = next;

            let reset = actions.contains(&AuthAction::ResetAccount);
            let mut released = None;
            if reset {
                on_reset();
                state.balance = 0.0;
                state.credential = None;
                if let SubscriptionSlot::Active(handle) = std::mem::take(&mut state.subscription) {
                    released = Some(handle);
                }
            }
            if reset || previous_user != next_user {
                state.epoch += 1;
            }

            debug!(
                phase = ?state.auth.phase(),
                epoch = state.epoch,
                actions = ?actions,
                "Auth transition"
            );

            Transition {
                actions,
                epoch: state.epoch,
                released,
            }
        })
    }

    /// Last-write-wins balance update. Returns false if `epoch` is stale.
    pub fn set_balance(&self, epoch: u64, balance: f64) -> bool {
        self.mutate(|state| {
            if !state.is_current(epoch) {
                return false;
            }
            state.balance = non_negative(balance);
            true
        })
    }

    /// Install a freshly obtained credential. Its embedded budget, if any,
    /// becomes the balance. Returns false if `epoch` is stale.
    pub fn set_credential(&self, epoch: u64, credential: CachedCredential) -> bool {
        self.mutate(|state| {
            if !state.is_current(epoch) {
                return false;
            }
            if let Some(balance) = credential.remaining_balance() {
                state.balance = balance;
            }
            state.credential = Some(credential);
            true
        })
    }

    pub fn set_issuing(&self, issuing: bool) {
        self.mutate(|state| state.issuing = issuing);
    }

    pub fn set_loading(&self, loading: bool) {
        self.mutate(|state| state.loading = loading);
    }

    pub fn set_error(&self, error: Option<String>) {
        self.mutate(|state| state.last_error = error);
    }

    /// Reserve the subscription slot for `epoch`. Returns a ticket, or `None`
    /// if a channel is already open or being opened, or the epoch is stale.
    pub fn reserve_subscription(&self, epoch: u64) -> Option<u64> {
        let mut state = self.state.lock();
        if !state.is_current(epoch) || !matches!(state.subscription, SubscriptionSlot::Empty) {
            return None;
        }
        state.next_ticket += 1;
        let ticket = state.next_ticket;
        state.subscription = SubscriptionSlot::Pending { ticket };
        Some(ticket)
    }

    /// Empty the slot if its channel was joined with a token other than
    /// `access_token`, returning the stale channel.
    pub fn take_stale_subscription(&self, epoch: u64, access_token: &str) -> Option<SubscriptionHandle> {
        self.mutate(|state| {
            if !state.is_current(epoch) {
                return None;
            }
            match state.subscription {
                SubscriptionSlot::Active(ref handle) if handle.access_token != access_token => {
                    match std::mem::take(&mut state.subscription) {
                        SubscriptionSlot::Active(handle) => Some(handle),
                        _ => None,
                    }
                }
                _ => None,
            }
        })
    }

    /// Fill a reserved slot. If the reservation was dropped in the meantime
    /// (reset, unsubscribe, stream already ended) the handle is handed back.
    pub fn install_subscription(
        &self,
        ticket: u64,
        handle: SubscriptionHandle,
    ) -> Result<(), SubscriptionHandle> {
        self.mutate(|state| match state.subscription {
            SubscriptionSlot::Pending { ticket: reserved } if reserved == ticket => {
                state.subscription = SubscriptionSlot::Active(handle);
                Ok(())
            }
            _ => Err(handle),
        })
    }

    /// Give up a reservation that never produced a channel.
    pub fn cancel_subscription(&self, ticket: u64) {
        let mut state = self.state.lock();
        if matches!(state.subscription, SubscriptionSlot::Pending { ticket: t } if t == ticket) {
            state.subscription = SubscriptionSlot::Empty;
        }
    }

    /// Empty the slot, returning the open channel if there was one.
    pub fn take_subscription(&self) -> Option<SubscriptionHandle> {
        self.mutate(|state| match std::mem::take(&mut state.subscription) {
            SubscriptionSlot::Active(handle) => Some(handle),
            _ => None,
        })
    }

    /// Called when subscription `id`'s stream ends on its own.
    pub fn release_subscription(&self, id: u64) -> Option<SubscriptionHandle> {
        self.mutate(|state| match state.subscription {
            SubscriptionSlot::Pending { ticket } if ticket == id => {
                state.subscription = SubscriptionSlot::Empty;
                None
            }
            SubscriptionSlot::Active(ref handle) if handle.id == id => {
                match std::mem::take(&mut state.subscription) {
                    SubscriptionSlot::Active(handle) => Some(handle),
                    _ => None,
                }
            }
            _ => None,
        })
    }
}
