//! Data models shared by the account components.
//!
//! - `CachedCredential`: the delegated "virtual key" and its budget snapshot
//! - `BalanceRow`, `BudgetRow`: rows returned by the balance sources
//! - `amount`: lenient numeric decoding and the balance clamp

pub mod amount;
pub mod balance;
pub mod credential;

pub use amount::clamp_balance;
pub use balance::{BalanceRow, BudgetRow};
pub use credential::{CachedCredential, EXPIRY_BUFFER_MINUTES};
