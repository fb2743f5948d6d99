use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::models::{Answers, EvaluationOutcome, EvaluationResult, Quiz};
use crate::scorer::{Scorer, ScorerPayload};
use crate::store::{StoreError, SubmissionStore};

/// Everything the runner needs to grade one submission.
#[derive(Debug, Clone)]
pub struct EvaluationJob {
    pub submission_id: Uuid,
    pub quiz: Quiz,
    pub answers: Answers,
}

/// Grades a submission with the external scorer and writes the outcome back.
pub struct EvaluationRunner {
    store: Arc<dyn SubmissionStore>,
    scorer: Arc<dyn Scorer>,
    permits: Arc<Semaphore>,
}

impl EvaluationRunner {
    /// `max_concurrent` bounds how many scorer processes run at the same time.
    pub fn new(
        store: Arc<dyn SubmissionStore>,
        scorer: Arc<dyn Scorer>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            scorer,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Runs the scorer and persists whatever came out of it.
    ///
    /// Scorer problems never surface as `Err`: they become a `Failed` outcome. The
    /// only error is the write-back itself failing, in which case the submission stays
    /// unresolved.
    pub async fn run(&self, job: EvaluationJob) -> Result<EvaluationOutcome, StoreError> {
        let outcome = self.evaluate(&job).await;
        match &outcome {
            EvaluationOutcome::Completed(r) => tracing::info!(
                submission_id = %job.submission_id,
                score = r.score,
                "evaluation completed"
            ),
            EvaluationOutcome::Failed { diagnostic, .. } => tracing::warn!(
                submission_id = %job.submission_id,
                diagnostic = %diagnostic,
                "evaluation failed"
            ),
        }
        self.store
            .attach_evaluation(job.submission_id, &outcome)
            .await?;
        Ok(outcome)
    }

    async fn evaluate(&self, job: &EvaluationJob) -> EvaluationOutcome {
        let _permit = match self.permits.acquire().await {
            Ok(p) => p,
            Err(_) => return EvaluationOutcome::failed("evaluation capacity closed"),
        };
        let payload = ScorerPayload {
            quiz: &job.quiz,
            answers: &job.answers,
        };
        match self.scorer.run(&payload).await {
            Ok(stdout) => match parse_output(&stdout, &job.answers) {
                Ok(parsed) => {
                    if !parsed.dropped.is_empty() {
                        tracing::warn!(
                            submission_id = %job.submission_id,
                            dropped = ?parsed.dropped,
                            "scorer graded unanswered questions; entries dropped"
                        );
                    }
                    EvaluationOutcome::Completed(parsed.result)
                }
                Err(diagnostic) => EvaluationOutcome::failed(diagnostic),
            },
            Err(e) => EvaluationOutcome::failed(e.to_string()),
        }
    }
}

#[derive(Debug)]
pub struct ParsedOutput {
    pub result: EvaluationResult,
    /// Question ids the scorer reported on that were never answered.
    pub dropped: Vec<String>,
}

/// Parses the scorer's stdout and restricts it to the graded answers.
///
/// Scorers report on every quiz question, so entries for unanswered ones are
/// dropped rather than failing the evaluation. The score is kept as emitted.
pub fn parse_output(stdout: &str, answers: &Answers) -> Result<ParsedOutput, String> {
    let mut result: EvaluationResult = serde_json::from_str(stdout.trim())
        .map_err(|e| format!("malformed scorer output: {e}"))?;
    let dropped = result.retain_answered(answers);
    result
        .validate_against(answers)
        .map_err(|e| format!("invalid scorer output: {e}"))?;
    Ok(ParsedOutput { result, dropped })
}
