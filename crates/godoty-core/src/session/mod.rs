//! Authentication state and its side effects.
//!
//! - `state`: the pure auth state machine
//! - `manager`: `SessionManager`, which feeds it and runs its actions

pub mod manager;
pub mod state;

pub use manager::SessionManager;
pub use state::{AuthAction, AuthEvent, AuthPhase, AuthState};
