use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::models::EvaluationOutcome;
use crate::runner::EvaluationJob;
use crate::store::{StoreError, SubmissionStore};
use crate::tasks::EvaluationScheduler;

#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub rescheduled: usize,
    pub still_running: usize,
    pub marked_failed: usize,
}

/// Picks up submissions left unresolved, e.g. after a crash or a failed write-back.
///
/// Running twice against the same record is harmless: the write-back is set-once.
/// A submission restarted `max_attempts` times without resolving is marked failed.
pub struct Reconciler {
    store: Arc<dyn SubmissionStore>,
    scheduler: EvaluationScheduler,
    stale_after: chrono::Duration,
    max_attempts: u32,
    restarts: Mutex<HashMap<Uuid, u32>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn SubmissionStore>,
        scheduler: EvaluationScheduler,
        stale_after: Duration,
        max_attempts: u32,
    ) -> Self {
        let stale_after =
            chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::days(1));
        Self {
            store,
            scheduler,
            stale_after,
            max_attempts: max_attempts.max(1),
            restarts: Mutex::new(HashMap::new()),
        }
    }

    fn restarts(&self) -> MutexGuard<'_, HashMap<Uuid, u32>> {
        self.restarts.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let cutoff = Utc::now() - self.stale_after;
        let stale = self.store.list_unresolved(cutoff).await?;
        let mut report = SweepReport {
            examined: stale.len(),
            ..Default::default()
        };
        // Resolved since the last sweep.
        self.restarts()
            .retain(|id, _| stale.iter().any(|sub| sub.id == *id));

        for sub in stale {
            if self.scheduler.is_tracked(sub.id) {
                report.still_running += 1;
                continue;
            }
            let restarted = self.restarts().get(&sub.id).copied().unwrap_or(0);
            if restarted >= self.max_attempts {
                tracing::error!(submission_id = %sub.id, restarted, "evaluation keeps getting lost; giving up");
                let diagnostic =
                    format!("evaluation did not complete after {restarted} restarts");
                if self.mark_failed(sub.id, diagnostic).await? {
                    report.marked_failed += 1;
                }
                self.restarts().remove(&sub.id);
                continue;
            }
            match self.store.find_quiz(sub.quiz_id).await? {
                Some(quiz) => {
                    let job = EvaluationJob {
                        submission_id: sub.id,
                        quiz,
                        answers: sub.answers,
                    };
                    if self.scheduler.schedule(job).is_ok() {
                        *self.restarts().entry(sub.id).or_insert(0) += 1;
                        report.rescheduled += 1;
                    }
                }
                None => {
                    let diagnostic = format!("quiz {} no longer exists", sub.quiz_id);
                    if self.mark_failed(sub.id, diagnostic).await? {
                        report.marked_failed += 1;
                    }
                }
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                rescheduled = report.rescheduled,
                still_running = report.still_running,
                marked_failed = report.marked_failed,
                "reconciliation sweep"
            );
        }
        Ok(report)
    }

    /// Returns false when something else resolved the submission first.
    async fn mark_failed(&self, id: Uuid, diagnostic: String) -> Result<bool, StoreError> {
        let marker = EvaluationOutcome::failed(diagnostic);
        match self.store.attach_evaluation(id, &marker).await {
            Ok(()) => Ok(true),
            Err(StoreError::AlreadyResolved(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Sweeps every `interval` until the task is dropped.
    pub async fn run_every(self, interval: Duration) {
        let interval = if interval.is_zero() {
            tracing::warn!("reconciliation interval is zero; sweeping every second");
            Duration::from_secs(1)
        } else {
            interval
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep().await {
                tracing::error!(error=%e, "reconciliation sweep failed");
            }
        }
    }
}
