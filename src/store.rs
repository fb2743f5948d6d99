use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{EvaluationOutcome, NewSubmission, Quiz, Submission};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("submission not found: {0}")]
    SubmissionNotFound(Uuid),
    /// The evaluation field is set once; a second write is refused.
    #[error("submission {0} already has an evaluation attached")]
    AlreadyResolved(Uuid),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Persistence seam shared by intake, runner, poller and the reconciliation sweep.
///
/// Implementations must be `Send + Sync + 'static` so they can live in axum state and
/// be moved into detached evaluation tasks.
#[async_trait]
pub trait SubmissionStore: Send + Sync + 'static {
    async fn find_quiz(&self, quiz_id: Uuid) -> Result<Option<Quiz>, StoreError>;

    /// Inserts a new submission with no evaluation and returns the stored record.
    async fn insert_submission(&self, new: NewSubmission) -> Result<Submission, StoreError>;

    async fn get_submission(&self, id: Uuid) -> Result<Submission, StoreError>;

    /// Point read of the evaluation field. `Ok(None)` means still processing.
    async fn get_evaluation(&self, id: Uuid) -> Result<Option<EvaluationOutcome>, StoreError>;

    /// Sets the evaluation field if, and only if, it is still empty.
    ///
    /// Returns `Err(StoreError::AlreadyResolved)` when a value is already present.
    async fn attach_evaluation(
        &self,
        id: Uuid,
        outcome: &EvaluationOutcome,
    ) -> Result<(), StoreError>;

    /// Submissions still without an evaluation that were submitted at or before `cutoff`,
    /// oldest first.
    async fn list_unresolved(&self, cutoff: DateTime<Utc>) -> Result<Vec<Submission>, StoreError>;
}

/// In-process store used when no `DATABASE_URL` is configured, and by tests.
#[derive(Default)]
pub struct MemoryStore {
    quizzes: RwLock<HashMap<Uuid, Quiz>>,
    submissions: RwLock<HashMap<Uuid, Submission>>,
    evaluation_reads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_quiz(&self, quiz: Quiz) {
        self.quizzes.write().await.insert(quiz.id, quiz);
    }

    /// Number of `get_evaluation` calls served so far.
    #[cfg(test)]
    pub fn evaluation_reads(&self) -> usize {
        self.evaluation_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn find_quiz(&self, quiz_id: Uuid) -> Result<Option<Quiz>, StoreError> {
        Ok(self.quizzes.read().await.get(&quiz_id).cloned())
    }

    async fn insert_submission(&self, new: NewSubmission) -> Result<Submission, StoreError> {
        if !self.quizzes.read().await.contains_key(&new.quiz_id) {
            return Err(StoreError::Backend(format!(
                "quiz {} does not exist",
                new.quiz_id
            )));
        }
        let submission = Submission {
            id: Uuid::new_v4(),
            quiz_id: new.quiz_id,
            answers: new.answers,
            submitted_at: Utc::now(),
            evaluation: None,
        };
        self.submissions
            .write()
            .await
            .insert(submission.id, submission.clone());
        Ok(submission)
    }

    async fn get_submission(&self, id: Uuid) -> Result<Submission, StoreError> {
        self.submissions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::SubmissionNotFound(id))
    }

    async fn get_evaluation(&self, id: Uuid) -> Result<Option<EvaluationOutcome>, StoreError> {
        self.evaluation_reads.fetch_add(1, Ordering::SeqCst);
        self.submissions
            .read()
            .await
            .get(&id)
            .map(|s| s.evaluation.clone())
            .ok_or(StoreError::SubmissionNotFound(id))
    }

    async fn attach_evaluation(
        &self,
        id: Uuid,
        outcome: &EvaluationOutcome,
    ) -> Result<(), StoreError> {
        let mut submissions = self.submissions.write().await;
        let submission = submissions
            .get_mut(&id)
            .ok_or(StoreError::SubmissionNotFound(id))?;
        if submission.evaluation.is_some() {
            return Err(StoreError::AlreadyResolved(id));
        }
        submission.evaluation = Some(outcome.clone());
        Ok(())
    }

    async fn list_unresolved(&self, cutoff: DateTime<Utc>) -> Result<Vec<Submission>, StoreError> {
        let mut stale: Vec<Submission> = self
            .submissions
            .read()
            .await
            .values()
            .filter(|s| s.evaluation.is_none() && s.submitted_at <= cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|s| s.submitted_at);
        Ok(stale)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::seeded;
    use super::*;
    use crate::models::Answers;

    #[tokio::test]
    async fn evaluation_is_set_once() {
        let (store, quiz) = seeded(&["q1"]).await;
        let sub = store
            .insert_submission(NewSubmission {
                quiz_id: quiz.id,
                answers: Answers::from([("q1".into(), "because".into())]),
            })
            .await
            .unwrap();
        assert_eq!(store.get_evaluation(sub.id).await.unwrap(), None);

        let first = EvaluationOutcome::failed("boom");
        store.attach_evaluation(sub.id, &first).await.unwrap();

        let second = EvaluationOutcome::failed("again");
        let err = store.attach_evaluation(sub.id, &second).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyResolved(id) if id == sub.id));

        for _ in 0..3 {
            assert_eq!(store.get_evaluation(sub.id).await.unwrap(), Some(first.clone()));
        }
        assert_eq!(store.evaluation_reads(), 4);
    }

    #[tokio::test]
    async fn insert_requires_existing_quiz() {
        let store = MemoryStore::new();
        let err = store
            .insert_submission(NewSubmission {
                quiz_id: Uuid::new_v4(),
                answers: Answers::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[tokio::test]
    async fn unknown_submission_is_not_found() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            store.get_evaluation(id).await,
            Err(StoreError::SubmissionNotFound(_))
        ));
        assert!(matches!(
            store.attach_evaluation(id, &EvaluationOutcome::failed("x")).await,
            Err(StoreError::SubmissionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn unresolved_listing_skips_resolved_and_recent() {
        let (store, quiz) = seeded(&["q1"]).await;
        let new = || NewSubmission {
            quiz_id: quiz.id,
            answers: Answers::new(),
        };
        let open = store.insert_submission(new()).await.unwrap();
        let done = store.insert_submission(new()).await.unwrap();
        store
            .attach_evaluation(done.id, &EvaluationOutcome::failed("x"))
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::seconds(1);
        let stale = store.list_unresolved(later).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, open.id);

        let earlier = open.submitted_at - chrono::Duration::seconds(1);
        assert!(store.list_unresolved(earlier).await.unwrap().is_empty());
    }
}
