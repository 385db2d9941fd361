//! Balance data models and API response types.
//!
//! This module defines:
//! - `StoreId`: which of the two independently owned stores a balance lives in
//! - `UserKey`: the opaque external user identifier shared by both stores
//! - `BalanceResponse`: Response body returned to clients

use serde::{Deserialize, Serialize};
use std::fmt;

/// External user identifier (the chat platform's numeric user id).
///
/// Stored as `BIGINT` in both stores under the same key semantics.
pub type UserKey = i64;

/// Identifies one of the two balance stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreId {
    /// Store the points are converted from (debited)
    Source,
    /// Store the points are converted into (credited)
    Target,
}

impl StoreId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreId::Source => "source",
            StoreId::Target => "target",
        }
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response body for balance lookups.
///
/// # JSON Example
///
/// ```json
/// {
///   "store": "source",
///   "user_key": 123456789,
///   "points": 1000
/// }
/// ```
#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub store: StoreId,
    pub user_key: UserKey,
    pub points: i64,
}
