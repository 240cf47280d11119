//! The delegated API credential ("virtual key").

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::amount::{lenient_opt, non_negative};

/// A cached key is treated as expired this long before its real expiry,
/// so callers never start a request with a key about to lapse.
pub const EXPIRY_BUFFER_MINUTES: i64 = 60;

/// Credential as returned by the issuing endpoint and persisted locally.
///
/// Fields the issuer adds beyond the known ones are kept in `issuer` and
/// written back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedCredential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_opt"
    )]
    pub remaining_budget: Option<f64>,
    #[serde(flatten)]
    pub issuer: Map<String, Value>,
}

impl CachedCredential {
    /// Valid iff `now < expires_at - 1h`. Depends on nothing else.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - Duration::minutes(EXPIRY_BUFFER_MINUTES)
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// Budget snapshot embedded at issuance, clamped to zero.
    pub fn remaining_balance(&self) -> Option<f64> {
        self.remaining_budget.map(non_negative)
    }

    /// Minutes of usable life left before the buffer kicks in (for display).
    pub fn minutes_until_refresh(&self) -> i64 {
        let refresh_at = self.expires_at - Duration::minutes(EXPIRY_BUFFER_MINUTES);
        (refresh_at - Utc::now()).num_minutes().max(0)
    }

    /// Token with everything but the last four characters masked.
    pub fn masked_token(&self) -> String {
        let chars: Vec<char> = self.token.chars().collect();
        if chars.len() <= 4 {
            return "*".repeat(chars.len());
        }
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}{}", "*".repeat(chars.len() - 4), tail)
    }
}
