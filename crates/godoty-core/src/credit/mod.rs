//! Credit balance resolution.
//!
//! - `BalanceSource`: the primary and fallback balance queries
//! - `CreditSync`: keeps the store's balance current from the cached
//!   credential, those queries, and a realtime channel

pub mod source;
pub mod sync;

pub use source::{BalanceSource, QueryError};
pub use sync::CreditSync;
