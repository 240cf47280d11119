//! Authentication state machine.
//!
//! Pure and side-effect free: `on_event` maps a state and an event to the
//! next state plus the actions the session manager must run. Startup
//! resolution, provider events and local sign-out all go through it, so the
//! side effects never depend on which path caused a transition.

use crate::auth::Session;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum AuthState {
    #[default]
    Unauthenticated,
    /// Initial session resolution in progress
    Authenticating,
    Authenticated { session: Session },
}

/// Public view of `AuthState` without the session itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthPhase {
    #[default]
    Unauthenticated,
    Authenticating,
    Authenticated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    /// Startup began resolving the existing session.
    Resolving,
    /// A session (or its absence) was reported, at startup or by the provider.
    SessionChanged(Option<Session>),
    /// Startup could not reach the provider. Whatever was persisted for the
    /// last session is kept for the next attempt.
    ResolveFailed,
    /// The provider confirmed a local sign-out request.
    SignedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    /// Drop everything tied to the previous session: balance to zero,
    /// realtime channel closed, virtual key cleared.
    ResetAccount,
    FetchBalance,
    SubscribeRealtime,
}

impl AuthState {
    pub fn phase(&self) -> AuthPhase {
        match self {
            Self::Unauthenticated => AuthPhase::Unauthenticated,
            Self::Authenticating => AuthPhase::Authenticating,
            Self::Authenticated { .. } => AuthPhase::Authenticated,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            Self::Authenticated { session } => Some(session),
            _ => None,
        }
    }

    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: AuthEvent) -> (Self, Vec<AuthAction>) {
        use AuthAction::*;

        match (self, event) {
            (Self::Unauthenticated, AuthEvent::Resolving) => (Self::Authenticating, vec![]),
            (state, AuthEvent::Resolving) => (state, vec![]),

            // Same account: token refresh, user update, repeated sign-in
            (Self::Authenticated { session: current }, AuthEvent::SessionChanged(Some(session)))
                if current.user_id == session.user_id =>
            {
                (
                    Self::Authenticated { session },
                    vec![FetchBalance, SubscribeRealtime],
                )
            }
            // Different account without an intervening sign-out
            (Self::Authenticated { .. }, AuthEvent::SessionChanged(Some(session))) => (
                Self::Authenticated { session },
                vec![ResetAccount, FetchBalance, SubscribeRealtime],
            ),
            (_, AuthEvent::SessionChanged(Some(session))) => (
                Self::Authenticated { session },
                vec![FetchBalance, SubscribeRealtime],
            ),

            (Self::Authenticating, AuthEvent::ResolveFailed) => (Self::Unauthenticated, vec![]),
            (state, AuthEvent::ResolveFailed) => (state, vec![]),

            (Self::Unauthenticated, AuthEvent::SessionChanged(None)) => {
                (Self::Unauthenticated, vec![])
            }
            (_, AuthEvent::SessionChanged(None)) => (Self::Unauthenticated, vec![ResetAccount]),

            // Always reset: a successful sign-out must leave nothing behind
            (_, AuthEvent::SignedOut) => (Self::Unauthenticated, vec![ResetAccount]),
        }
    }
}
