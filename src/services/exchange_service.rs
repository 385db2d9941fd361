//! Exchange Coordinator
//!
//! Converts source points into target points across two stores that cannot share a
//! transaction. The conversion is a two-step saga:
//!
//! ```text
//! validate ──► debit source (commit) ──► credit target (commit) ──► Success
//!                     │                         │
//!                 DebitFailed          refund source (one attempt)
//!                                        │                │
//!                                  CreditFailed    CompensationFailed
//! ```
//!
//! # Invariants
//!
//! 1. Both users must exist before anything is mutated.
//! 2. All steps for one user key run under that key's lock.
//! 3. The credit starts only after the debit committed; the refund starts only after
//!    the credit failed and rolled back.
//! 4. Once validation passes, the mutation phase runs on its own task, so dropping the
//!    caller's future cannot strand a committed debit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::user_locks::{UserLockGuard, UserLocks};
use crate::{
    error::{ExchangeError, StoreError},
    models::{
        balance::{StoreId, UserKey},
        exchange::{ExchangeReceipt, ExchangeRequest, ExchangeState},
    },
    store::BalanceStore,
};

/// Terminal outcome of one exchange call.
pub type ExchangeOutcome = Result<ExchangeReceipt, ExchangeError>;

type ReplayKey = (UserKey, String);

/// What an idempotency key was first used for: `(source_amount, rate)`.
type Fingerprint = (i64, i64);

/// Receives critical saga outcomes that need an operator.
///
/// Called from the saga task itself, so the alert goes out even when the caller
/// is gone, and only once per executed exchange.
pub trait AlertSink: Send + Sync {
    fn compensation_failed(&self, user_key: UserKey, debited: i64, owed: i64);
}

/// Outcome remembered for an idempotency key.
#[derive(Debug, Clone)]
struct RecordedOutcome {
    fingerprint: Fingerprint,
    outcome: ExchangeOutcome,
    recorded_at: Instant,
}

/// Result of looking up an idempotency key.
#[derive(Debug)]
enum Replay {
    /// Same request seen before; its recorded outcome
    Outcome(ExchangeOutcome),
    /// Key was used for a different amount or rate
    Conflict,
}

/// Outcomes of keyed requests that changed balances, shared with saga tasks.
#[derive(Debug)]
struct ReplayCache {
    entries: DashMap<ReplayKey, RecordedOutcome>,
    ttl: Duration,
}

impl ReplayCache {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn get(&self, key: &ReplayKey, fingerprint: Fingerprint) -> Option<Replay> {
        let recorded = self.entries.get(key)?;
        if recorded.recorded_at.elapsed() > self.ttl {
            drop(recorded);
            self.entries.remove(key);
            return None;
        }
        if recorded.fingerprint != fingerprint {
            return Some(Replay::Conflict);
        }
        Some(Replay::Outcome(recorded.outcome.clone().map(
            |receipt| ExchangeReceipt {
                replayed: true,
                ..receipt
            },
        )))
    }

    /// Remember `outcome` if it moved points; rejected and restored attempts are
    /// safe to execute again and are not recorded.
    fn record(&self, key: ReplayKey, fingerprint: Fingerprint, outcome: &ExchangeOutcome) {
        let moved_points = matches!(outcome, Ok(_) | Err(ExchangeError::CompensationFailed));
        if !moved_points {
            return;
        }
        let ttl = self.ttl;
        self.entries
            .retain(|_, recorded| recorded.recorded_at.elapsed() <= ttl);
        self.entries.insert(
            key,
            RecordedOutcome {
                fingerprint,
                outcome: outcome.clone(),
                recorded_at: Instant::now(),
            },
        );
    }
}

/// One exchange attempt moving through [`ExchangeState`].
#[derive(Debug)]
struct ExchangeAttempt {
    exchange_id: Uuid,
    user_key: UserKey,
    source_amount: i64,
    state: ExchangeState,
}

impl ExchangeAttempt {
    fn new(request: &ExchangeRequest) -> Self {
        Self {
            exchange_id: Uuid::new_v4(),
            user_key: request.user_key,
            source_amount: request.source_amount,
            state: ExchangeState::Initiated,
        }
    }

    /// Move to `next`. An illegal transition is refused and the state kept.
    fn advance(&mut self, next: ExchangeState) {
        if !self.state.can_transition_to(next) {
            error!(
                exchange_id = %self.exchange_id,
                user_key = self.user_key,
                from = %self.state,
                to = %next,
                "Illegal exchange state transition refused"
            );
            return;
        }
        debug!(
            exchange_id = %self.exchange_id,
            user_key = self.user_key,
            from = %self.state,
            to = %next,
            "Exchange state transition"
        );
        self.state = next;
    }

    fn reject(&mut self, reason: ExchangeError) -> ExchangeError {
        self.advance(ExchangeState::Rejected);
        info!(
            exchange_id = %self.exchange_id,
            user_key = self.user_key,
            amount = self.source_amount,
            code = reason.code(),
            "Exchange rejected"
        );
        reason
    }
}

/// Exchange Coordinator - validates requests and drives the debit/credit saga
pub struct ExchangeCoordinator {
    source: Arc<dyn BalanceStore>,
    target: Arc<dyn BalanceStore>,
    locks: UserLocks,
    replays: Arc<ReplayCache>,
    alerts: Option<Arc<dyn AlertSink>>,
}

impl ExchangeCoordinator {
    /// Default replay window for idempotency keys
    pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(86_400);

    pub fn new(source: Arc<dyn BalanceStore>, target: Arc<dyn BalanceStore>) -> Self {
        Self::with_idempotency_ttl(source, target, Self::DEFAULT_IDEMPOTENCY_TTL)
    }

    pub fn with_idempotency_ttl(
        source: Arc<dyn BalanceStore>,
        target: Arc<dyn BalanceStore>,
        idempotency_ttl: Duration,
    ) -> Self {
        Self {
            source,
            target,
            locks: UserLocks::new(),
            replays: Arc::new(ReplayCache::new(idempotency_ttl)),
            alerts: None,
        }
    }

    /// Raise `CompensationFailed` outcomes on `alerts`.
    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    fn store(&self, store: StoreId) -> &Arc<dyn BalanceStore> {
        match store {
            StoreId::Source => &self.source,
            StoreId::Target => &self.target,
        }
    }

    /// Current points of `user_key` in `store`, `None` if absent.
    pub async fn balance(
        &self,
        store: StoreId,
        user_key: UserKey,
    ) -> Result<Option<i64>, StoreError> {
        self.store(store).get_points(user_key).await
    }

    /// Connectivity check against one store.
    pub async fn ping(&self, store: StoreId) -> Result<(), StoreError> {
        self.store(store).ping().await
    }

    /// Wait until no exchange holds a user lock, or `limit` elapses.
    ///
    /// Every running saga owns its user's lock, so an empty lock table means nothing
    /// is mid-flight. Returns `false` on timeout.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let idle = async {
            while !self.locks.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(limit, idle).await.is_ok()
    }

    /// Convert `request.source_amount` source points into target points.
    ///
    /// # Validation (in order, nothing is mutated on failure)
    ///
    /// 1. `source_amount > 0` and `rate >= 1`, else `InvalidRequest`
    /// 2. user exists in source, else `UserNotFound { store: Source }`
    /// 3. user exists in target, else `UserNotFound { store: Target }`
    /// 4. `source_amount <= balance`, else `InsufficientBalance`
    /// 5. `source_amount / rate > 0`, else `ZeroConversionAmount`
    ///
    /// A read that fails or times out yields `StoreUnavailable`.
    ///
    /// # Mutation
    ///
    /// Debit, then credit, then at most one refund. See the module docs for the
    /// outcomes. A repeated idempotency key returns the recorded outcome; reusing it
    /// for a different amount or rate yields `IdempotencyKeyReused`.
    pub async fn exchange(&self, request: ExchangeRequest) -> ExchangeOutcome {
        let mut attempt = ExchangeAttempt::new(&request);

        if request.source_amount <= 0 {
            return Err(attempt.reject(ExchangeError::InvalidRequest(
                "amount must be greater than zero".to_string(),
            )));
        }
        let Some(target_amount) = request.target_amount() else {
            return Err(attempt.reject(ExchangeError::InvalidRequest(
                "rate must be at least 1".to_string(),
            )));
        };

        let guard = self.locks.lock(request.user_key).await;

        let replay_key = request
            .idempotency_key
            .clone()
            .map(|key| (request.user_key, key));
        let fingerprint = (request.source_amount, request.rate);
        if let Some(key) = &replay_key {
            match self.replays.get(key, fingerprint) {
                Some(Replay::Outcome(outcome)) => {
                    info!(
                        exchange_id = %attempt.exchange_id,
                        user_key = request.user_key,
                        idempotency_key = %key.1,
                        "Replaying recorded exchange outcome"
                    );
                    return outcome;
                }
                Some(Replay::Conflict) => {
                    return Err(attempt.reject(ExchangeError::IdempotencyKeyReused));
                }
                None => {}
            }
        }

        let source_points = self.read(&mut attempt, StoreId::Source).await?;
        self.read(&mut attempt, StoreId::Target).await?;

        if request.source_amount > source_points {
            return Err(attempt.reject(ExchangeError::InsufficientBalance {
                current: source_points,
            }));
        }
        if target_amount == 0 {
            return Err(attempt.reject(ExchangeError::ZeroConversionAmount {
                minimum_required: request.rate,
            }));
        }

        attempt.advance(ExchangeState::Validated);

        let saga = Saga {
            source: Arc::clone(&self.source),
            target: Arc::clone(&self.target),
            replays: Arc::clone(&self.replays),
            alerts: self.alerts.clone(),
            replay_key,
            fingerprint,
            target_amount,
            _guard: guard,
        };
        let exchange_id = attempt.exchange_id;

        match tokio::spawn(saga.run(attempt)).await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                // The saga's position is unknown; treat it like a failed refund.
                error!(
                    exchange_id = %exchange_id,
                    user_key = request.user_key,
                    error = %join_error,
                    critical = true,
                    "Exchange task aborted mid-saga, manual reconciliation required"
                );
                if let Some(alerts) = &self.alerts {
                    alerts.compensation_failed(
                        request.user_key,
                        request.source_amount,
                        target_amount,
                    );
                }
                Err(ExchangeError::CompensationFailed)
            }
        }
    }

    /// Read a balance during validation. Absent users and store errors reject.
    async fn read(
        &self,
        attempt: &mut ExchangeAttempt,
        store: StoreId,
    ) -> Result<i64, ExchangeError> {
        match self.store(store).get_points(attempt.user_key).await {
            Ok(Some(points)) => Ok(points),
            Ok(None) => Err(attempt.reject(ExchangeError::UserNotFound { store })),
            Err(e) => {
                warn!(
                    exchange_id = %attempt.exchange_id,
                    user_key = attempt.user_key,
                    store = %store,
                    error = %e,
                    "Balance read failed"
                );
                Err(attempt.reject(ExchangeError::StoreUnavailable { store }))
            }
        }
    }
}

/// The mutation phase, owned by a spawned task together with the user's lock.
struct Saga {
    source: Arc<dyn BalanceStore>,
    target: Arc<dyn BalanceStore>,
    replays: Arc<ReplayCache>,
    alerts: Option<Arc<dyn AlertSink>>,
    replay_key: Option<ReplayKey>,
    fingerprint: Fingerprint,
    target_amount: i64,
    _guard: UserLockGuard,
}

impl Saga {
    async fn run(self, mut attempt: ExchangeAttempt) -> ExchangeOutcome {
        let outcome = self.execute(&mut attempt).await;
        if let Some(key) = self.replay_key.clone() {
            self.replays.record(key, self.fingerprint, &outcome);
        }
        outcome
    }

    async fn execute(&self, attempt: &mut ExchangeAttempt) -> ExchangeOutcome {
        let user_key = attempt.user_key;
        let source_amount = attempt.source_amount;

        // === Debit ===
        if let Err(e) = self.source.debit(user_key, source_amount).await {
            attempt.advance(ExchangeState::DebitFailed);
            warn!(
                exchange_id = %attempt.exchange_id,
                user_key,
                amount = source_amount,
                error = %e,
                "Debit failed, nothing committed"
            );
            return Err(ExchangeError::DebitFailed);
        }
        attempt.advance(ExchangeState::Debited);
        info!(
            exchange_id = %attempt.exchange_id,
            user_key,
            amount = source_amount,
            "Source points debited"
        );

        // === Credit ===
        let credit_error = match self.target.credit(user_key, self.target_amount).await {
            Ok(()) => {
                attempt.advance(ExchangeState::Credited);
                info!(
                    exchange_id = %attempt.exchange_id,
                    user_key,
                    debited = source_amount,
                    credited = self.target_amount,
                    "Exchange completed"
                );
                return Ok(ExchangeReceipt {
                    exchange_id: attempt.exchange_id,
                    user_key,
                    debited: source_amount,
                    credited: self.target_amount,
                    completed_at: Utc::now(),
                    replayed: false,
                });
            }
            Err(e) => e,
        };
        attempt.advance(ExchangeState::CreditFailed);
        warn!(
            exchange_id = %attempt.exchange_id,
            user_key,
            amount = self.target_amount,
            error = %credit_error,
            "Credit failed, refunding source points"
        );

        // === Compensation (single attempt) ===
        attempt.advance(ExchangeState::CompensationAttempted);
        match self.source.credit(user_key, source_amount).await {
            Ok(()) => {
                attempt.advance(ExchangeState::Compensated);
                warn!(
                    exchange_id = %attempt.exchange_id,
                    user_key,
                    amount = source_amount,
                    "Source points refunded after failed credit"
                );
                Err(ExchangeError::CreditFailed)
            }
            Err(refund_error) => {
                attempt.advance(ExchangeState::CompensationFailed);
                error!(
                    exchange_id = %attempt.exchange_id,
                    user_key,
                    debited = source_amount,
                    owed = self.target_amount,
                    credit_error = %credit_error,
                    refund_error = %refund_error,
                    critical = true,
                    "COMPENSATION FAILED: source debited without credit, manual reconciliation required"
                );
                if let Some(alerts) = &self.alerts {
                    alerts.compensation_failed(user_key, source_amount, self.target_amount);
                }
                Err(ExchangeError::CompensationFailed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockStore;
    use std::sync::Mutex;

    const USER: UserKey = 123_456_789;

    /// Records every alert raised.
    #[derive(Default)]
    struct RecordingAlerts {
        raised: Mutex<Vec<(UserKey, i64, i64)>>,
    }

    impl RecordingAlerts {
        fn raised(&self) -> Vec<(UserKey, i64, i64)> {
            self.raised.lock().unwrap().clone()
        }
    }

    impl AlertSink for RecordingAlerts {
        fn compensation_failed(&self, user_key: UserKey, debited: i64, owed: i64) {
            self.raised.lock().unwrap().push((user_key, debited, owed));
        }
    }

    fn setup(
        source_points: Option<i64>,
        target_points: Option<i64>,
    ) -> (Arc<MockStore>, Arc<MockStore>, ExchangeCoordinator) {
        let mut source = MockStore::new(StoreId::Source);
        if let Some(points) = source_points {
            source = source.with_user(USER, points);
        }
        let mut target = MockStore::new(StoreId::Target);
        if let Some(points) = target_points {
            target = target.with_user(USER, points);
        }

        let source = Arc::new(source);
        let target = Arc::new(target);
        let coordinator = ExchangeCoordinator::new(source.clone(), target.clone());
        (source, target, coordinator)
    }

    #[tokio::test]
    async fn test_successful_exchange_conserves_points() {
        let (source, target, coordinator) = setup(Some(1000), Some(7));

        let receipt = coordinator
            .exchange(ExchangeRequest::new(USER, 100, 5))
            .await
            .unwrap();

        assert_eq!(receipt.debited, 100);
        assert_eq!(receipt.credited, 20);
        assert_eq!(receipt.user_key, USER);
        assert_eq!(source.points(USER), Some(900));
        assert_eq!(target.points(USER), Some(27));
    }

    #[tokio::test]
    async fn test_remainder_is_debited_not_credited() {
        let (source, target, coordinator) = setup(Some(1000), Some(0));

        let receipt = coordinator
            .exchange(ExchangeRequest::new(USER, 104, 5))
            .await
            .unwrap();

        assert_eq!(receipt.credited, 20);
        assert_eq!(source.points(USER), Some(896));
        assert_eq!(target.points(USER), Some(20));
    }

    #[tokio::test]
    async fn test_insufficient_balance_is_noop() {
        let (source, target, coordinator) = setup(Some(50), Some(0));

        let result = coordinator.exchange(ExchangeRequest::new(USER, 100, 5)).await;

        assert_eq!(
            result,
            Err(ExchangeError::InsufficientBalance { current: 50 })
        );
        assert_eq!(source.points(USER), Some(50));
        assert_eq!(target.points(USER), Some(0));
        assert_eq!(source.debit_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_conversion_is_noop() {
        let (source, target, coordinator) = setup(Some(1000), Some(0));

        let result = coordinator.exchange(ExchangeRequest::new(USER, 4, 5)).await;

        assert_eq!(
            result,
            Err(ExchangeError::ZeroConversionAmount {
                minimum_required: 5
            })
        );
        assert_eq!(source.points(USER), Some(1000));
        assert_eq!(target.points(USER), Some(0));
    }

    #[tokio::test]
    async fn test_missing_target_user_leaves_source_untouched() {
        let (source, _target, coordinator) = setup(Some(1000), None);

        let result = coordinator.exchange(ExchangeRequest::new(USER, 100, 5)).await;

        assert_eq!(
            result,
            Err(ExchangeError::UserNotFound {
                store: StoreId::Target
            })
        );
        assert_eq!(source.points(USER), Some(1000));
        assert_eq!(source.debit_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_source_user() {
        let (_source, target, coordinator) = setup(None, Some(10));

        let result = coordinator.exchange(ExchangeRequest::new(USER, 100, 5)).await;

        assert_eq!(
            result,
            Err(ExchangeError::UserNotFound {
                store: StoreId::Source
            })
        );
        assert_eq!(target.points(USER), Some(10));
    }

    #[tokio::test]
    async fn test_invalid_amount_and_rate_rejected_before_reads() {
        let (source, _target, coordinator) = setup(Some(1000), Some(0));
        source.set_fail_reads(true);

        for request in [
            ExchangeRequest::new(USER, 0, 5),
            ExchangeRequest::new(USER, -10, 5),
            ExchangeRequest::new(USER, 100, 0),
        ] {
            let result = coordinator.exchange(request).await;
            assert!(matches!(result, Err(ExchangeError::InvalidRequest(_))));
        }
    }

    #[tokio::test]
    async fn test_read_failure_is_store_unavailable() {
        let (_source, target, coordinator) = setup(Some(1000), Some(0));
        target.set_fail_reads(true);

        let result = coordinator.exchange(ExchangeRequest::new(USER, 100, 5)).await;

        assert_eq!(
            result,
            Err(ExchangeError::StoreUnavailable {
                store: StoreId::Target
            })
        );
    }

    #[tokio::test]
    async fn test_debit_failure_commits_nothing() {
        let (source, target, coordinator) = setup(Some(1000), Some(0));
        source.set_fail_debit(true);

        let result = coordinator.exchange(ExchangeRequest::new(USER, 100, 5)).await;

        assert_eq!(result, Err(ExchangeError::DebitFailed));
        assert_eq!(source.points(USER), Some(1000));
        assert_eq!(target.credit_count(), 0);
    }

    #[tokio::test]
    async fn test_credit_failure_is_compensated() {
        let (source, target, coordinator) = setup(Some(1000), Some(3));
        target.set_fail_credit(true);

        let result = coordinator.exchange(ExchangeRequest::new(USER, 100, 5)).await;

        assert_eq!(result, Err(ExchangeError::CreditFailed));
        assert_eq!(source.points(USER), Some(1000));
        assert_eq!(target.points(USER), Some(3));
        assert_eq!(source.credit_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_compensation_is_critical() {
        let (source, target, coordinator) = setup(Some(1000), Some(3));
        target.set_fail_credit(true);
        source.set_fail_credit(true);

        let result = coordinator.exchange(ExchangeRequest::new(USER, 100, 5)).await;

        assert_eq!(result, Err(ExchangeError::CompensationFailed));
        // Documented inconsistency: source stays debited.
        assert_eq!(source.points(USER), Some(900));
        assert_eq!(target.points(USER), Some(3));
        // Exactly one refund attempt.
        assert_eq!(source.credit_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_exchanges_never_overdraw() {
        let (source, target, coordinator) = setup(Some(1000), Some(0));
        source.set_delay(Duration::from_millis(5));
        let coordinator = Arc::new(coordinator);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let coordinator = Arc::clone(&coordinator);
            handles.push(tokio::spawn(async move {
                coordinator.exchange(ExchangeRequest::new(USER, 300, 5)).await
            }));
        }

        let mut debited = 0;
        for handle in handles {
            if let Ok(receipt) = handle.await.unwrap() {
                debited += receipt.debited;
            }
        }

        assert_eq!(debited, 900);
        assert_eq!(source.points(USER), Some(100));
        assert_eq!(target.points(USER), Some(180));
    }

    #[tokio::test]
    async fn test_different_users_run_in_parallel() {
        let source = MockStore::new(StoreId::Source)
            .with_user(1, 100)
            .with_user(2, 100);
        let target = MockStore::new(StoreId::Target)
            .with_user(1, 0)
            .with_user(2, 0);
        source.set_delay(Duration::from_millis(200));
        let coordinator = Arc::new(ExchangeCoordinator::new(
            Arc::new(source),
            Arc::new(target),
        ));

        // Hold user 1's lock; user 2 must still complete.
        let _held = coordinator.locks.lock(1).await;
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            coordinator.exchange(ExchangeRequest::new(2, 50, 5)),
        )
        .await;

        assert!(matches!(result, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn test_idempotency_key_replays_success() {
        let (source, target, coordinator) = setup(Some(1000), Some(0));
        let request = ExchangeRequest::new(USER, 100, 5).with_idempotency_key("cb-1");

        let first = coordinator.exchange(request.clone()).await.unwrap();
        let second = coordinator.exchange(request).await.unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.exchange_id, second.exchange_id);
        assert_eq!(first.credited, second.credited);
        assert_eq!(source.points(USER), Some(900));
        assert_eq!(target.points(USER), Some(20));
        assert_eq!(source.debit_count(), 1);
    }

    #[tokio::test]
    async fn test_idempotency_key_does_not_pin_rejections() {
        let (source, _target, coordinator) = setup(Some(50), Some(0));
        let request = ExchangeRequest::new(USER, 100, 5).with_idempotency_key("cb-2");

        let first = coordinator.exchange(request.clone()).await;
        assert!(matches!(first, Err(ExchangeError::InsufficientBalance { .. })));

        source.credit(USER, 50).await.unwrap();
        let second = coordinator.exchange(request).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_expired_idempotency_key_executes_again() {
        let source = Arc::new(MockStore::new(StoreId::Source).with_user(USER, 1000));
        let target = Arc::new(MockStore::new(StoreId::Target).with_user(USER, 0));
        let coordinator =
            ExchangeCoordinator::with_idempotency_ttl(source.clone(), target, Duration::ZERO);
        let request = ExchangeRequest::new(USER, 100, 5).with_idempotency_key("cb-3");

        coordinator.exchange(request.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        coordinator.exchange(request).await.unwrap();

        assert_eq!(source.points(USER), Some(800));
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_strand_debit() {
        let (source, target, coordinator) = setup(Some(1000), Some(0));
        target.set_delay(Duration::from_millis(50));
        let coordinator = Arc::new(coordinator);

        let call = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator.exchange(ExchangeRequest::new(USER, 100, 5)).await
            })
        };
        // Let the debit commit, then abandon the caller during the credit.
        tokio::time::sleep(Duration::from_millis(20)).await;
        call.abort();

        // The next exchange for the same user waits for the saga to finish.
        coordinator
            .exchange(ExchangeRequest::new(USER, 100, 5))
            .await
            .unwrap();

        assert_eq!(source.points(USER), Some(800));
        assert_eq!(target.points(USER), Some(40));
    }

    #[tokio::test]
    async fn test_lock_table_drained_after_exchange() {
        let (_source, _target, coordinator) = setup(Some(1000), Some(0));

        coordinator
            .exchange(ExchangeRequest::new(USER, 100, 5))
            .await
            .unwrap();
        let _ = coordinator.exchange(ExchangeRequest::new(USER, 5000, 5)).await;

        assert!(coordinator.locks.is_empty());
    }

    #[tokio::test]
    async fn test_wait_idle_outlasts_abandoned_saga() {
        let (source, target, coordinator) = setup(Some(1000), Some(0));
        target.set_delay(Duration::from_millis(50));
        let coordinator = Arc::new(coordinator);

        let call = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator.exchange(ExchangeRequest::new(USER, 100, 5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        call.abort();

        assert!(coordinator.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(source.points(USER), Some(900));
        assert_eq!(target.points(USER), Some(20));
    }

    #[test]
    fn test_illegal_transition_keeps_state() {
        let mut attempt = ExchangeAttempt::new(&ExchangeRequest::new(USER, 100, 5));

        attempt.advance(ExchangeState::Credited);
        assert_eq!(attempt.state, ExchangeState::Initiated);

        attempt.advance(ExchangeState::Validated);
        attempt.advance(ExchangeState::Debited);
        attempt.advance(ExchangeState::CompensationAttempted);
        assert_eq!(attempt.state, ExchangeState::Debited);
    }

    #[tokio::test]
    async fn test_idempotency_key_reused_for_other_amount_is_rejected() {
        let (source, target, coordinator) = setup(Some(1000), Some(0));

        coordinator
            .exchange(ExchangeRequest::new(USER, 100, 5).with_idempotency_key("cb-4"))
            .await
            .unwrap();
        let second = coordinator
            .exchange(ExchangeRequest::new(USER, 500, 5).with_idempotency_key("cb-4"))
            .await;

        assert_eq!(second, Err(ExchangeError::IdempotencyKeyReused));
        assert_eq!(source.points(USER), Some(900));
        assert_eq!(target.points(USER), Some(20));
        assert_eq!(source.debit_count(), 1);
    }

    #[tokio::test]
    async fn test_debit_timeout_is_debit_failed() {
        let (source, target, coordinator) = setup(Some(1000), Some(0));
        source.set_delay(Duration::from_millis(200));
        source.set_timeout(Duration::from_millis(20));

        let result = coordinator.exchange(ExchangeRequest::new(USER, 100, 5)).await;

        assert_eq!(result, Err(ExchangeError::DebitFailed));
        assert_eq!(source.points(USER), Some(1000));
        assert_eq!(target.credit_count(), 0);
    }

    #[tokio::test]
    async fn test_credit_timeout_is_compensated() {
        let (source, target, coordinator) = setup(Some(1000), Some(3));
        target.set_delay(Duration::from_millis(200));
        target.set_timeout(Duration::from_millis(20));

        let result = coordinator.exchange(ExchangeRequest::new(USER, 100, 5)).await;

        assert_eq!(result, Err(ExchangeError::CreditFailed));
        assert_eq!(source.points(USER), Some(1000));
        assert_eq!(target.points(USER), Some(3));
        assert_eq!(source.credit_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_compensation_alerts_after_caller_is_gone() {
        let (source, target, coordinator) = setup(Some(1000), Some(0));
        target.set_delay(Duration::from_millis(50));
        target.set_fail_credit(true);
        source.set_fail_credit(true);
        let alerts = Arc::new(RecordingAlerts::default());
        let coordinator = Arc::new(coordinator.with_alerts(alerts.clone()));

        let call = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator.exchange(ExchangeRequest::new(USER, 100, 5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        call.abort();

        assert!(coordinator.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(alerts.raised(), vec![(USER, 100, 20)]);
        assert_eq!(source.points(USER), Some(900));
    }

    #[tokio::test]
    async fn test_replayed_compensation_failure_alerts_once() {
        let (source, target, coordinator) = setup(Some(1000), Some(0));
        target.set_fail_credit(true);
        source.set_fail_credit(true);
        let alerts = Arc::new(RecordingAlerts::default());
        let coordinator = coordinator.with_alerts(alerts.clone());
        let request = ExchangeRequest::new(USER, 100, 5).with_idempotency_key("cb-5");

        let first = coordinator.exchange(request.clone()).await;
        let second = coordinator.exchange(request).await;

        assert_eq!(first, Err(ExchangeError::CompensationFailed));
        assert_eq!(second, Err(ExchangeError::CompensationFailed));
        assert_eq!(alerts.raised().len(), 1);
        assert_eq!(source.debit_count(), 1);
    }
}
