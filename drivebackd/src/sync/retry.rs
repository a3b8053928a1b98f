use std::time::Duration;

use driveback_core::ApiErrorClass;
use rand::Rng;
use tracing::{info, warn};

use crate::state::{StateError, StateStore};

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter { rng.gen_range(0..=exp) } else { exp };
        Duration::from_millis(delay_ms)
    }
}

/// What the scheduler did with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Another attempt was queued for `next_eligible_at`.
    Scheduled { attempt: i64, next_eligible_at: i64 },
    /// The record went terminal Failed; no further attempts without an
    /// operator reset.
    TerminalFailed,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub transient: Backoff,
    /// Rate limits get a longer initial delay than plain transient faults;
    /// the provider told us to back off, so we do.
    pub rate_limited: Backoff,
}

impl RetryPolicy {
    pub fn delay_for(&self, class: ApiErrorClass, attempt: u32) -> Duration {
        match class {
            ApiErrorClass::RateLimit => self.rate_limited.delay(attempt),
            _ => self.transient.delay(attempt),
        }
    }
}

/// Store-backed retry scheduling: each entry persists its next-eligible-time
/// so retries survive a daemon restart.
#[derive(Clone)]
pub struct RetryScheduler {
    store: StateStore,
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(store: StateStore, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    /// Routes one failed (file, destination) attempt: auth and permanent
    /// failures go terminal immediately, everything else re-queues with
    /// class-aware exponential backoff until the attempt budget runs out.
    pub async fn record_failure(
        &self,
        file_id: &str,
        destination_id: &str,
        class: ApiErrorClass,
        error: &str,
        now: i64,
    ) -> Result<RetryDecision, StateError> {
        if matches!(class, ApiErrorClass::Auth | ApiErrorClass::Permanent) {
            warn!(
                file_id,
                destination_id,
                error,
                "non-retryable failure, marking terminal"
            );
            self.store
                .mark_failed_terminal(file_id, destination_id, error, now)
                .await?;
            return Ok(RetryDecision::TerminalFailed);
        }

        let attempt = self
            .store
            .mark_attempt_failed(file_id, destination_id, error, now)
            .await?;

        if attempt > i64::from(self.policy.max_attempts) {
            warn!(
                file_id,
                destination_id,
                attempt,
                "retry budget exhausted, marking terminal"
            );
            self.store
                .mark_failed_terminal(file_id, destination_id, error, now)
                .await?;
            return Ok(RetryDecision::TerminalFailed);
        }

        let delay = self.policy.delay_for(class, attempt.max(0) as u32);
        let next_eligible_at = now + delay.as_secs() as i64;
        self.store
            .push_retry(file_id, destination_id, attempt, next_eligible_at)
            .await?;
        info!(
            file_id,
            destination_id,
            attempt,
            next_eligible_at,
            "transfer re-queued"
        );
        Ok(RetryDecision::Scheduled {
            attempt,
            next_eligible_at,
        })
    }

    /// Removes the queue entry after a successful transfer.
    pub async fn record_success(
        &self,
        file_id: &str,
        destination_id: &str,
    ) -> Result<(), StateError> {
        self.store.remove_retry(file_id, destination_id).await
    }
}
