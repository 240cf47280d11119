//! Contract for the balance query backend.

use async_trait::async_trait;
use thiserror::Error;

use crate::auth::Session;
use crate::models::{BalanceRow, BudgetRow};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// The queried table or view does not exist in the backend schema.
    #[error("relation not found: {0}")]
    RelationNotFound(String),

    #[error("{0}")]
    Failed(String),
}

/// Balance queries, always scoped to the session's own rows.
///
/// `Ok(None)` means the query succeeded but matched no row.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    /// Pre-computed balance from the privileged view.
    async fn primary_balance(&self, session: &Session) -> Result<Option<BalanceRow>, QueryError>;

    /// Raw budget and spend by user id.
    async fn fallback_balance(&self, session: &Session) -> Result<Option<BudgetRow>, QueryError>;
}
