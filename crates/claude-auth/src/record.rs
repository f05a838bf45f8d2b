//! Persisted credential records
//!
//! A `TokenRecord` is the unit of stored identity: either an OAuth
//! access/refresh pair or a plain API key that is passed through verbatim.
//! Records serialize with a `type` tag so the storage file stays readable
//! and forward-compatible.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A stored credential, keyed by provider name in the token store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TokenRecord {
    /// OAuth credential. `access_token` may be empty, meaning the record
    /// must be refreshed before use; `refresh_token` is always non-empty.
    Oauth {
        access_token: String,
        refresh_token: String,
        /// Absolute expiry as unix seconds
        expires_at: u64,
    },
    /// Pre-issued API key, returned to callers verbatim.
    ApiKey { key: String },
}

impl TokenRecord {
    /// Whether the record needs a refresh before its token can be used.
    ///
    /// An OAuth record counts as expired when `now + skew >= expires_at`,
    /// or when it has never carried an access token at all. API keys do
    /// not expire.
    pub fn is_expired(&self, now: u64, skew_secs: u64) -> bool {
        match self {
            TokenRecord::Oauth {
                access_token,
                expires_at,
                ..
            } => access_token.is_empty() || now + skew_secs >= *expires_at,
            TokenRecord::ApiKey { .. } => false,
        }
    }
}

/// Current wall clock as unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
