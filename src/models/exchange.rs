//! Exchange data models, the per-attempt state machine and API types.
//!
//! This module defines:
//! - `ExchangeRequest`: what the coordinator is asked to do
//! - `ExchangeReceipt`: the success outcome
//! - `ExchangeState`: the saga state machine of one exchange attempt
//! - `CreateExchangeRequest` / `ExchangeResponse`: HTTP request and response bodies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::balance::UserKey;

/// A request to convert `source_amount` source points at `rate`.
///
/// `rate` source points buy one target point; the remainder of the division is
/// debited but not credited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRequest {
    pub user_key: UserKey,
    pub source_amount: i64,
    pub rate: i64,

    /// Optional caller token; a repeated token replays the recorded outcome
    pub idempotency_key: Option<String>,
}

impl ExchangeRequest {
    pub fn new(user_key: UserKey, source_amount: i64, rate: i64) -> Self {
        Self {
            user_key,
            source_amount,
            rate,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Target points this request converts to: `floor(source_amount / rate)`.
    ///
    /// Returns `None` when the rate is not positive.
    pub fn target_amount(&self) -> Option<i64> {
        if self.rate < 1 {
            return None;
        }
        Some(self.source_amount / self.rate)
    }
}

/// Successful exchange outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeReceipt {
    pub exchange_id: Uuid,
    pub user_key: UserKey,
    /// Source points removed
    pub debited: i64,
    /// Target points added
    pub credited: i64,
    pub completed_at: DateTime<Utc>,
    /// Returned from the idempotency cache instead of executed
    pub replayed: bool,
}

/// Exchange attempt states.
///
/// ```text
/// Initiated → Validated → Debited → Credited
///     ↓           ↓          ↓
///  Rejected   DebitFailed  CreditFailed → CompensationAttempted → Compensated
///                                                      ↓
///                                             CompensationFailed
/// ```
///
/// Terminal: Rejected, DebitFailed, Credited, Compensated, CompensationFailed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeState {
    /// Request received, nothing checked yet
    Initiated,

    /// Both users exist, balance and conversion checks passed
    Validated,

    /// Terminal: a precondition failed, no store was mutated
    Rejected,

    /// Terminal: debit did not commit, no store was mutated
    DebitFailed,

    /// Source debit committed, credit not yet attempted
    Debited,

    /// Terminal: both steps committed
    Credited,

    /// Credit rolled back or errored; the debit is still committed
    CreditFailed,

    /// Refund of the source debit in progress
    CompensationAttempted,

    /// Terminal: refund committed, balances restored
    Compensated,

    /// Terminal: refund failed, source stays debited without a credit
    CompensationFailed,
}

impl ExchangeState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExchangeState::Rejected
                | ExchangeState::DebitFailed
                | ExchangeState::Credited
                | ExchangeState::Compensated
                | ExchangeState::CompensationFailed
        )
    }

    /// Source points are debited without a matching credit.
    #[inline]
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ExchangeState::Debited
                | ExchangeState::CreditFailed
                | ExchangeState::CompensationAttempted
        )
    }

    /// Whether the machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ExchangeState) -> bool {
        use ExchangeState::*;
        matches!(
            (*self, next),
            (Initiated, Validated)
                | (Initiated, Rejected)
                | (Validated, Debited)
                | (Validated, DebitFailed)
                | (Debited, Credited)
                | (Debited, CreditFailed)
                | (CreditFailed, CompensationAttempted)
                | (CompensationAttempted, Compensated)
                | (CompensationAttempted, CompensationFailed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeState::Initiated => "INITIATED",
            ExchangeState::Validated => "VALIDATED",
            ExchangeState::Rejected => "REJECTED",
            ExchangeState::DebitFailed => "DEBIT_FAILED",
            ExchangeState::Debited => "DEBITED",
            ExchangeState::Credited => "CREDITED",
            ExchangeState::CreditFailed => "CREDIT_FAILED",
            ExchangeState::CompensationAttempted => "COMPENSATION_ATTEMPTED",
            ExchangeState::Compensated => "COMPENSATED",
            ExchangeState::CompensationFailed => "COMPENSATION_FAILED",
        }
    }
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Request body for `POST /api/v1/exchanges`.
///
/// # JSON Example
///
/// ```json
/// {
///   "user_key": 123456789,
///   "source_amount": 100,
///   "idempotency_key": "tg-callback-8812"
/// }
/// ```
///
/// The rate is not part of the request; the server applies its configured rate.
#[derive(Debug, Deserialize)]
pub struct CreateExchangeRequest {
    pub user_key: UserKey,
    pub source_amount: i64,
    pub idempotency_key: Option<String>,
}

/// Response body for a successful exchange.
///
/// # JSON Example
///
/// ```json
/// {
///   "exchange_id": "770e8400-e29b-41d4-a716-446655440002",
///   "user_key": 123456789,
///   "debited": 100,
///   "credited": 20,
///   "completed_at": "2025-12-21T16:00:00Z",
///   "replayed": false
/// }
/// ```
#[derive(Debug, Serialize, Deserialize)]
pub struct ExchangeResponse {
    pub exchange_id: Uuid,
    pub user_key: UserKey,
    pub debited: i64,
    pub credited: i64,
    pub completed_at: DateTime<Utc>,
    pub replayed: bool,
}

impl From<ExchangeReceipt> for ExchangeResponse {
    fn from(receipt: ExchangeReceipt) -> Self {
        Self {
            exchange_id: receipt.exchange_id,
            user_key: receipt.user_key,
            debited: receipt.debited,
            credited: receipt.credited,
            completed_at: receipt.completed_at,
            replayed: receipt.replayed,
        }
    }
}
