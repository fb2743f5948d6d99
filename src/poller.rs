use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::EvaluationOutcome;
use crate::store::{StoreError, SubmissionStore};

#[derive(Error, Debug)]
pub enum PollError {
    /// The evaluation may still be running; only the wait gave up.
    #[error("evaluation of submission {submission_id} not ready after {attempts} attempts")]
    TimedOut { submission_id: Uuid, attempts: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    /// Multiplier applied to the delay after each empty attempt. `1.0` keeps it fixed.
    pub backoff: f64,
    pub max_delay: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::fixed(10, Duration::from_secs(1))
    }
}

impl PollPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: 1.0,
            max_delay: delay,
        }
    }

    pub fn with_backoff(mut self, factor: f64, max_delay: Duration) -> Self {
        self.backoff = if factor.is_finite() && factor >= 1.0 { factor } else { 1.0 };
        self.max_delay = max_delay.max(self.delay);
        self
    }

    /// Delay to wait after the `attempt`-th (1-based) empty read.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if self.backoff == 1.0 {
            return self.delay;
        }
        let factor = self.backoff.powi(attempt.saturating_sub(1) as i32);
        let secs = self.delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Waits for a submission's evaluation by re-reading it on a bounded schedule.
///
/// Dropping the returned future stops polling; the evaluation itself is unaffected.
pub struct ResultPoller {
    store: Arc<dyn SubmissionStore>,
    policy: PollPolicy,
}

impl ResultPoller {
    pub fn new(store: Arc<dyn SubmissionStore>, policy: PollPolicy) -> Self {
        Self { store, policy }
    }

    pub async fn wait_for(&self, submission_id: Uuid) -> Result<EvaluationOutcome, PollError> {
        let attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(outcome) = self.store.get_evaluation(submission_id).await? {
                tracing::debug!(%submission_id, attempt, "evaluation observed");
                return Ok(outcome);
            }
            if attempt < attempts {
                tokio::time::sleep(self.policy.delay_after(attempt)).await;
            }
        }
        tracing::info!(%submission_id, attempts, "gave up waiting for evaluation");
        Err(PollError::TimedOut {
            submission_id,
            attempts,
        })
    }
}
