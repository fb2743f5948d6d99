use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Learner answers keyed by question id. Missing keys mean "unanswered".
pub type Answers = BTreeMap<String, String>;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    MultipleChoice,
    Subjective,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QuestionOption {
    pub id: String,
    pub text: String,
}

// Field names follow the document the scorer reads (`type`, `correctAnswer`).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Question {
    pub id: String,
    pub question: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(rename = "correctAnswer")]
    pub correct_answer: String,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    pub marks: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuizStatus {
    Draft,
    Published,
}

impl QuizStatus {
    pub fn parse(v: &str) -> Option<Self> {
        match v {
            "draft" => Some(QuizStatus::Draft),
            "published" => Some(QuizStatus::Published),
            _ => None,
        }
    }
}

/// Quiz content is owned by the surrounding application; this service only reads it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Quiz {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub questions: Vec<Question>,
    #[serde(default)]
    pub randomize: bool,
    pub status: QuizStatus,
    pub created_at: DateTime<Utc>,
}

impl Quiz {
    pub fn has_question(&self, question_id: &str) -> bool {
        self.questions.iter().any(|q| q.id == question_id)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FeedbackEntry {
    pub question_id: String,
    pub feedback: String,
}

/// Graded output of one submission, exactly as emitted by the scorer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    pub score: f64,
    pub feedback: Vec<FeedbackEntry>,
    pub plagiarism_scores: BTreeMap<String, f64>,
}

#[derive(Error, Debug, PartialEq)]
pub enum ResultViolation {
    #[error("score {0} is not a finite non-negative number")]
    BadScore(f64),
    #[error("feedback references question `{0}` which has no answer")]
    UnknownFeedbackQuestion(String),
    #[error("plagiarism score references question `{0}` which has no answer")]
    UnknownPlagiarismQuestion(String),
    #[error("plagiarism score for question `{0}` is not finite")]
    BadPlagiarismScore(String),
}

impl EvaluationResult {
    /// Drops feedback and plagiarism entries for questions the learner left
    /// unanswered. Returns the dropped question ids, deduplicated.
    pub fn retain_answered(&mut self, answers: &Answers) -> Vec<String> {
        let mut dropped = std::collections::BTreeSet::new();
        self.feedback.retain(|f| {
            let keep = answers.contains_key(&f.question_id);
            if !keep {
                dropped.insert(f.question_id.clone());
            }
            keep
        });
        self.plagiarism_scores.retain(|q, _| {
            let keep = answers.contains_key(q);
            if !keep {
                dropped.insert(q.clone());
            }
            keep
        });
        dropped.into_iter().collect()
    }

    /// Checks the result against the answers of the submission it grades.
    pub fn validate_against(&self, answers: &Answers) -> Result<(), ResultViolation> {
        if !self.score.is_finite() || self.score < 0.0 {
            return Err(ResultViolation::BadScore(self.score));
        }
        if let Some(entry) = self
            .feedback
            .iter()
            .find(|f| !answers.contains_key(&f.question_id))
        {
            return Err(ResultViolation::UnknownFeedbackQuestion(entry.question_id.clone()));
        }
        for (question_id, score) in &self.plagiarism_scores {
            if !answers.contains_key(question_id) {
                return Err(ResultViolation::UnknownPlagiarismQuestion(question_id.clone()));
            }
            if !score.is_finite() {
                return Err(ResultViolation::BadPlagiarismScore(question_id.clone()));
            }
        }
        Ok(())
    }
}

/// The value of a submission's evaluation field once it is set.
///
/// Stored as a single JSON document tagged by `status`, so a completed record reads
/// `{"status":"completed","score":..,"feedback":[..],"plagiarism_scores":{..}}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EvaluationOutcome {
    Completed(EvaluationResult),
    Failed {
        diagnostic: String,
        failed_at: DateTime<Utc>,
    },
}

impl EvaluationOutcome {
    pub fn failed(diagnostic: impl Into<String>) -> Self {
        EvaluationOutcome::Failed {
            diagnostic: diagnostic.into(),
            failed_at: Utc::now(),
        }
    }

    pub fn status(&self) -> SubmissionStatus {
        match self {
            EvaluationOutcome::Completed(_) => SubmissionStatus::Completed,
            EvaluationOutcome::Failed { .. } => SubmissionStatus::Failed,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Processing,
    Completed,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Submission {
    pub id: Uuid,
    pub quiz_id: Uuid,
    pub answers: Answers,
    pub submitted_at: DateTime<Utc>,
    pub evaluation: Option<EvaluationOutcome>,
}

impl Submission {
    pub fn status(&self) -> SubmissionStatus {
        self.evaluation
            .as_ref()
            .map(EvaluationOutcome::status)
            .unwrap_or(SubmissionStatus::Processing)
    }
}

#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub quiz_id: Uuid,
    pub answers: Answers,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmitReq {
    pub quiz_id: Uuid,
    #[serde(default)]
    pub answers: Answers,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct SubmitQuery {
    #[serde(default)]
    pub wait: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmitResp {
    pub submission_id: Uuid,
    pub status: SubmissionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationOutcome>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmissionView {
    pub id: Uuid,
    pub quiz_id: Uuid,
    pub answers: Answers,
    pub submitted_at: DateTime<Utc>,
    pub status: SubmissionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationOutcome>,
}

impl From<Submission> for SubmissionView {
    fn from(s: Submission) -> Self {
        let status = s.status();
        SubmissionView {
            id: s.id,
            quiz_id: s.quiz_id,
            answers: s.answers,
            submitted_at: s.submitted_at,
            status,
            evaluation: s.evaluation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answers(ids: &[&str]) -> Answers {
        ids.iter().map(|id| (id.to_string(), "x".to_string())).collect()
    }

    #[test]
    fn scorer_document_parses_and_validates() {
        let raw = r#"{
            "score": 62.5,
            "feedback": [{"question_id": "q2", "feedback": "Partially correct"}],
            "plagiarism_scores": {"q2": 1.5}
        }"#;
        let result: EvaluationResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.score, 62.5);
        assert_eq!(result.feedback[0].question_id, "q2");
        assert!(result.validate_against(&answers(&["q1", "q2"])).is_ok());
    }

    #[test]
    fn feedback_for_unanswered_question_is_rejected() {
        let result = EvaluationResult {
            score: 10.0,
            feedback: vec![FeedbackEntry {
                question_id: "q9".into(),
                feedback: "n/a".into(),
            }],
            plagiarism_scores: BTreeMap::new(),
        };
        assert_eq!(
            result.validate_against(&answers(&["q1"])),
            Err(ResultViolation::UnknownFeedbackQuestion("q9".into()))
        );
    }

    #[test]
    fn entries_for_unanswered_questions_are_dropped() {
        let mut result: EvaluationResult = serde_json::from_str(
            r#"{"score": 3,
                "feedback": [{"question_id": "q1", "feedback": "good"},
                             {"question_id": "q2", "feedback": "no answer given"}],
                "plagiarism_scores": {"q1": 0.0, "q2": 0.0}}"#,
        )
        .unwrap();
        let dropped = result.retain_answered(&answers(&["q1"]));
        assert_eq!(dropped, vec!["q2".to_string()]);
        assert_eq!(result.feedback.len(), 1);
        assert_eq!(result.plagiarism_scores.keys().collect::<Vec<_>>(), vec!["q1"]);
        assert!(result.validate_against(&answers(&["q1"])).is_ok());
    }

    #[test]
    fn document_without_feedback_fields_is_rejected() {
        assert!(serde_json::from_str::<EvaluationResult>(r#"{"score": 5}"#).is_err());
        assert!(
            serde_json::from_str::<EvaluationResult>(r#"{"score": 5, "feedback": []}"#).is_err()
        );
    }

    #[test]
    fn negative_or_nan_score_is_rejected() {
        let mut result = EvaluationResult {
            score: -1.0,
            feedback: vec![],
            plagiarism_scores: BTreeMap::new(),
        };
        assert!(matches!(
            result.validate_against(&answers(&[])),
            Err(ResultViolation::BadScore(_))
        ));
        result.score = f64::NAN;
        assert!(result.validate_against(&answers(&[])).is_err());
    }

    #[test]
    fn outcome_is_tagged_by_status() {
        let done = EvaluationOutcome::Completed(EvaluationResult {
            score: 100.0,
            feedback: vec![],
            plagiarism_scores: BTreeMap::new(),
        });
        let v = serde_json::to_value(&done).unwrap();
        assert_eq!(v["status"], "completed");
        assert_eq!(v["score"], 100.0);
        let back: EvaluationOutcome = serde_json::from_value(v).unwrap();
        assert_eq!(back, done);

        let failed = EvaluationOutcome::failed("scorer exited with exit status: 1");
        let v = serde_json::to_value(&failed).unwrap();
        assert_eq!(v["status"], "failed");
        assert_eq!(failed.status(), SubmissionStatus::Failed);
    }

    #[test]
    fn submission_without_evaluation_is_processing() {
        let sub = Submission {
            id: Uuid::new_v4(),
            quiz_id: Uuid::new_v4(),
            answers: answers(&["q1"]),
            submitted_at: Utc::now(),
            evaluation: None,
        };
        assert_eq!(sub.status(), SubmissionStatus::Processing);
        let view = SubmissionView::from(sub);
        let v = serde_json::to_value(&view).unwrap();
        assert_eq!(v["status"], "processing");
        assert!(v.get("evaluation").is_none());
    }

    #[test]
    fn question_uses_scorer_field_names() {
        let q: Question = serde_json::from_str(
            r#"{"id":"q1","question":"2+2?","options":[{"id":"a","text":"4"}],
                "correctAnswer":"a","type":"multiple_choice","marks":1}"#,
        )
        .unwrap();
        assert_eq!(q.kind, QuestionKind::MultipleChoice);
        let v = serde_json::to_value(&q).unwrap();
        assert_eq!(v["correctAnswer"], "a");
        assert_eq!(v["type"], "multiple_choice");
    }
}
