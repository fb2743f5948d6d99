use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinError};
use uuid::Uuid;

use crate::models::EvaluationOutcome;
use crate::runner::{EvaluationJob, EvaluationRunner};
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("scheduler is shut down")]
    Closed,
    #[error("no async runtime available: {0}")]
    NoRuntime(String),
    #[error("an evaluation is already running for submission {0}")]
    AlreadyRunning(Uuid),
}

#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub scheduled: u64,
    pub in_flight: u64,
    pub completed: u64,
    pub failed: u64,
    /// Write-back refused because the submission was already resolved.
    pub duplicates: u64,
    /// Runner panicked, was aborted, or could not persist its outcome.
    pub lost: u64,
    pub schedule_failures: u64,
}

#[derive(Default)]
struct Counters {
    scheduled: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    duplicates: AtomicU64,
    lost: AtomicU64,
    schedule_failures: AtomicU64,
}

/// Tracks every detached evaluation until its supervisor observes how it ended.
#[derive(Default)]
pub struct TaskRegistry {
    running: Mutex<HashMap<Uuid, AbortHandle>>,
    counters: Counters,
}

impl TaskRegistry {
    pub fn is_tracked(&self, submission_id: Uuid) -> bool {
        self.lock().contains_key(&submission_id)
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    pub fn stats(&self) -> RegistryStats {
        let c = &self.counters;
        RegistryStats {
            scheduled: c.scheduled.load(Ordering::Relaxed),
            in_flight: self.in_flight() as u64,
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            lost: c.lost.load(Ordering::Relaxed),
            schedule_failures: c.schedule_failures.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, AbortHandle>> {
        // A poisoned map is still a valid map.
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn finish(
        &self,
        submission_id: Uuid,
        ended: Result<Result<EvaluationOutcome, StoreError>, JoinError>,
    ) {
        self.lock().remove(&submission_id);
        let c = &self.counters;
        match ended {
            Ok(Ok(EvaluationOutcome::Completed(_))) => {
                c.completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Ok(EvaluationOutcome::Failed { .. })) => {
                c.failed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(StoreError::AlreadyResolved(_))) => {
                c.duplicates.fetch_add(1, Ordering::Relaxed);
                tracing::info!(%submission_id, "submission was already resolved; outcome discarded");
            }
            Ok(Err(e)) => {
                c.lost.fetch_add(1, Ordering::Relaxed);
                tracing::error!(%submission_id, error=%e, "evaluation write-back failed; submission left processing");
            }
            Err(e) => {
                c.lost.fetch_add(1, Ordering::Relaxed);
                tracing::error!(%submission_id, error=%e, "evaluation task died before write-back");
            }
        }
    }
}

/// Starts evaluations as supervised background tasks.
#[derive(Clone)]
pub struct EvaluationScheduler {
    runner: Arc<EvaluationRunner>,
    registry: Arc<TaskRegistry>,
    closed: Arc<AtomicBool>,
}

impl EvaluationScheduler {
    pub fn new(runner: Arc<EvaluationRunner>, registry: Arc<TaskRegistry>) -> Self {
        Self {
            runner,
            registry,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn is_tracked(&self, submission_id: Uuid) -> bool {
        self.registry.is_tracked(submission_id)
    }

    /// Detaches one evaluation. Returns as soon as the task is spawned.
    pub fn schedule(&self, job: EvaluationJob) -> Result<(), ScheduleError> {
        let submission_id = job.submission_id;
        let res = self.spawn(job);
        if let Err(e) = &res {
            self.registry
                .counters
                .schedule_failures
                .fetch_add(1, Ordering::Relaxed);
            tracing::error!(%submission_id, error=%e, "could not schedule evaluation");
        }
        res
    }

    fn spawn(&self, job: EvaluationJob) -> Result<(), ScheduleError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ScheduleError::Closed);
        }
        let handle = Handle::try_current().map_err(|e| ScheduleError::NoRuntime(e.to_string()))?;
        let submission_id = job.submission_id;

        // Held until the entry is inserted so the supervisor cannot remove it first.
        let mut running = self.registry.lock();
        if running.contains_key(&submission_id) {
            return Err(ScheduleError::AlreadyRunning(submission_id));
        }

        let runner = self.runner.clone();
        let work = handle.spawn(async move { runner.run(job).await });
        running.insert(submission_id, work.abort_handle());
        drop(running);

        let registry = self.registry.clone();
        handle.spawn(async move {
            let ended = work.await;
            registry.finish(submission_id, ended);
        });

        self.registry
            .counters
            .scheduled
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%submission_id, "evaluation scheduled");
        Ok(())
    }

    /// Refuses new work, waits up to `grace` for running evaluations, then aborts the
    /// rest. Returns how many were aborted.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + grace;
        while self.registry.in_flight() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let running = self.registry.lock();
        for abort in running.values() {
            abort.abort();
        }
        if !running.is_empty() {
            tracing::warn!(count = running.len(), "aborted evaluations still running at shutdown");
        }
        running.len()
    }
}
