//! Rows returned by the balance sources.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::amount::{clamp_balance, lenient_opt, lenient_zero, non_negative};

/// Row from the privileged balance view (`user_credit_balance`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceRow {
    #[serde(default, deserialize_with = "lenient_zero")]
    pub max_budget: f64,
    #[serde(default, deserialize_with = "lenient_zero")]
    pub spend: f64,
    #[serde(default, deserialize_with = "lenient_opt")]
    pub remaining_balance: Option<f64>,
}

impl BalanceRow {
    /// The view computes the balance server-side; a null figure reads as zero.
    pub fn balance(&self) -> f64 {
        non_negative(self.remaining_balance.unwrap_or(0.0))
    }
}

/// Raw budget/spend row (`LiteLLM_UserTable`), used by the fallback query
/// and carried in realtime change payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetRow {
    #[serde(default, deserialize_with = "lenient_zero")]
    pub max_budget: f64,
    #[serde(default, deserialize_with = "lenient_zero")]
    pub spend: f64,
}

impl BudgetRow {
    pub fn balance(&self) -> f64 {
        clamp_balance(self.max_budget, self.spend)
    }

    /// Decode a realtime new-image record. Unrelated columns are ignored.
    pub fn from_record(record: &Value) -> Option<Self> {
        if !record.is_object() {
            return None;
        }
        serde_json::from_value(record.clone()).ok()
    }
}
