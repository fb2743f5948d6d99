use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Answers, NewSubmission, Quiz, Submission};
use crate::runner::EvaluationJob;
use crate::scorer::ScorerPayload;
use crate::store::{StoreError, SubmissionStore};
use crate::tasks::EvaluationScheduler;

pub const MAX_ANSWER_LEN: usize = 10_000;

#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("quiz not found: {0}")]
    QuizNotFound(Uuid),
    #[error("invalid answers: {0}")]
    InvalidAnswers(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntakeError {
    /// True when the request itself was at fault and nothing was written.
    pub fn is_validation(&self) -> bool {
        matches!(self, IntakeError::QuizNotFound(_) | IntakeError::InvalidAnswers(_))
    }
}

/// Accepts quiz answers, stores them and hands grading off to the scheduler.
pub struct SubmissionIntake {
    store: Arc<dyn SubmissionStore>,
    scheduler: EvaluationScheduler,
}

impl SubmissionIntake {
    pub fn new(store: Arc<dyn SubmissionStore>, scheduler: EvaluationScheduler) -> Self {
        Self { store, scheduler }
    }

    /// Persists a new submission and returns it while evaluation runs in the background.
    ///
    /// A failure to schedule the evaluation is logged and counted by the scheduler but
    /// does not fail the call; the stored submission is still returned, unresolved.
    pub async fn submit(&self, quiz_id: Uuid, answers: Answers) -> Result<Submission, IntakeError> {
        let quiz = self
            .store
            .find_quiz(quiz_id)
            .await?
            .ok_or(IntakeError::QuizNotFound(quiz_id))?;
        validate_answers(&quiz, &answers)?;

        let submission = self
            .store
            .insert_submission(NewSubmission { quiz_id, answers })
            .await?;
        tracing::info!(
            submission_id = %submission.id,
            %quiz_id,
            answered = submission.answers.len(),
            "submission stored"
        );

        let job = EvaluationJob {
            submission_id: submission.id,
            quiz,
            answers: submission.answers.clone(),
        };
        if self.scheduler.schedule(job).is_err() {
            tracing::warn!(submission_id = %submission.id, "submission accepted without a running evaluation");
        }
        Ok(submission)
    }
}

fn validate_answers(quiz: &Quiz, answers: &Answers) -> Result<(), IntakeError> {
    for (question_id, text) in answers {
        if question_id.trim().is_empty() {
            return Err(IntakeError::InvalidAnswers("empty question id".into()));
        }
        if !quiz.has_question(question_id) {
            return Err(IntakeError::InvalidAnswers(format!(
                "question `{question_id}` is not part of quiz {}",
                quiz.id
            )));
        }
        if text.chars().count() > MAX_ANSWER_LEN {
            return Err(IntakeError::InvalidAnswers(format!(
                "answer to `{question_id}` exceeds {MAX_ANSWER_LEN} characters"
            )));
        }
    }
    // The scorer receives quiz and answers in one environment string.
    ScorerPayload { quiz, answers }
        .encode()
        .map_err(|e| IntakeError::InvalidAnswers(e.to_string()))?;
    Ok(())
}
