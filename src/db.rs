use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, types::Json, Pool, Postgres};
use uuid::Uuid;

use crate::models::{
    Answers, EvaluationOutcome, NewSubmission, Question, Quiz, QuizStatus, Submission,
};
use crate::store::{StoreError, SubmissionStore};

pub type Db = Pool<Postgres>;

// Upper bound on rows returned by one reconciliation sweep.
const UNRESOLVED_BATCH: i64 = 100;

pub async fn connect(url: &str) -> Result<Db> {
    Ok(PgPoolOptions::new().max_connections(10).connect(url).await?)
}

#[derive(sqlx::FromRow)]
struct QuizRow {
    id: Uuid,
    title: String,
    description: String,
    questions: Json<Vec<Question>>,
    randomize: bool,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<QuizRow> for Quiz {
    type Error = StoreError;

    fn try_from(r: QuizRow) -> Result<Self, Self::Error> {
        let status = QuizStatus::parse(&r.status).ok_or_else(|| {
            StoreError::Backend(format!("quiz {} has unknown status `{}`", r.id, r.status))
        })?;
        Ok(Quiz {
            id: r.id,
            title: r.title,
            description: r.description,
            questions: r.questions.0,
            randomize: r.randomize,
            status,
            created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubmissionRow {
    id: Uuid,
    quiz_id: Uuid,
    answers: Json<Answers>,
    submitted_at: DateTime<Utc>,
    evaluation_results: Option<Json<EvaluationOutcome>>,
}

impl From<SubmissionRow> for Submission {
    fn from(r: SubmissionRow) -> Self {
        Submission {
            id: r.id,
            quiz_id: r.quiz_id,
            answers: r.answers.0,
            submitted_at: r.submitted_at,
            evaluation: r.evaluation_results.map(|j| j.0),
        }
    }
}

/// Postgres-backed store over the `quizzes` and `quiz_submissions` tables.
#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SubmissionStore for PgStore {
    async fn find_quiz(&self, quiz_id: Uuid) -> Result<Option<Quiz>, StoreError> {
        let row: Option<QuizRow> = sqlx::query_as(
            r#"
            SELECT id, title, description, questions, randomize, status, created_at
            FROM quizzes WHERE id = $1
            "#,
        )
        .bind(quiz_id)
        .fetch_optional(&self.db)
        .await
        .map_err(backend)?;
        row.map(Quiz::try_from).transpose()
    }

    async fn insert_submission(&self, new: NewSubmission) -> Result<Submission, StoreError> {
        let row: SubmissionRow = sqlx::query_as(
            r#"
            INSERT INTO quiz_submissions (id, quiz_id, answers)
            VALUES ($1,$2,$3)
            RETURNING id, quiz_id, answers, submitted_at, evaluation_results
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.quiz_id)
        .bind(Json(&new.answers))
        .fetch_one(&self.db)
        .await
        .map_err(backend)?;
        Ok(row.into())
    }

    async fn get_submission(&self, id: Uuid) -> Result<Submission, StoreError> {
        let row: Option<SubmissionRow> = sqlx::query_as(
            r#"
            SELECT id, quiz_id, answers, submitted_at, evaluation_results
            FROM quiz_submissions WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .map_err(backend)?;
        row.map(Submission::from)
            .ok_or(StoreError::SubmissionNotFound(id))
    }

    async fn get_evaluation(&self, id: Uuid) -> Result<Option<EvaluationOutcome>, StoreError> {
        // Outer Option: row exists. Inner Option: column is NULL.
        let value: Option<Option<Json<EvaluationOutcome>>> = sqlx::query_scalar(
            "SELECT evaluation_results FROM quiz_submissions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .map_err(backend)?;
        value
            .map(|v| v.map(|j| j.0))
            .ok_or(StoreError::SubmissionNotFound(id))
    }

    async fn attach_evaluation(
        &self,
        id: Uuid,
        outcome: &EvaluationOutcome,
    ) -> Result<(), StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE quiz_submissions
            SET evaluation_results = $2, resolved_at = now()
            WHERE id = $1 AND evaluation_results IS NULL
            "#,
        )
        .bind(id)
        .bind(Json(outcome))
        .execute(&self.db)
        .await
        .map_err(backend)?;

        if done.rows_affected() == 1 {
            return Ok(());
        }

        let exists: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM quiz_submissions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.db)
                .await
                .map_err(backend)?;
        match exists {
            Some(_) => Err(StoreError::AlreadyResolved(id)),
            None => Err(StoreError::SubmissionNotFound(id)),
        }
    }

    async fn list_unresolved(&self, cutoff: DateTime<Utc>) -> Result<Vec<Submission>, StoreError> {
        let rows: Vec<SubmissionRow> = sqlx::query_as(
            r#"
            SELECT id, quiz_id, answers, submitted_at, evaluation_results
            FROM quiz_submissions
            WHERE evaluation_results IS NULL AND submitted_at <= $1
            ORDER BY submitted_at
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(UNRESOLVED_BATCH)
        .fetch_all(&self.db)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(Submission::from).collect())
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    tracing::error!(error=%e, "database error");
    StoreError::Backend(e.to_string())
}
