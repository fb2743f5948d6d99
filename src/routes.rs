use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use http::StatusCode;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    intake::{IntakeError, SubmissionIntake},
    models::*,
    poller::{PollError, ResultPoller},
    store::{StoreError, SubmissionStore},
    tasks::{RegistryStats, TaskRegistry},
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SubmissionStore>,
    pub intake: Arc<SubmissionIntake>,
    pub poller: Arc<ResultPoller>,
    pub registry: Arc<TaskRegistry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/submissions", post(submit))
        .route("/api/submissions/:submission_id", get(get_submission))
        .route("/api/submissions/:submission_id/result", get(wait_result))
        .route("/api/evaluations/stats", get(stats))
        .with_state(state)
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

async fn submit(
    State(st): State<AppState>,
    Query(q): Query<SubmitQuery>,
    Json(req): Json<SubmitReq>,
) -> ApiResult<SubmitResp> {
    let submission = st
        .intake
        .submit(req.quiz_id, req.answers)
        .await
        .map_err(intake_err)?;

    if !q.wait {
        return Ok(Json(SubmitResp {
            submission_id: submission.id,
            status: SubmissionStatus::Processing,
            evaluation: None,
        }));
    }

    // The client disconnecting drops this future, which stops the poll.
    let outcome = st.poller.wait_for(submission.id).await.map_err(poll_err)?;
    Ok(Json(SubmitResp {
        submission_id: submission.id,
        status: outcome.status(),
        evaluation: Some(outcome),
    }))
}

async fn get_submission(
    State(st): State<AppState>,
    Path(submission_id): Path<Uuid>,
) -> ApiResult<SubmissionView> {
    let submission = st
        .store
        .get_submission(submission_id)
        .await
        .map_err(store_err)?;
    Ok(Json(submission.into()))
}

async fn wait_result(
    State(st): State<AppState>,
    Path(submission_id): Path<Uuid>,
) -> ApiResult<EvaluationOutcome> {
    let outcome = st.poller.wait_for(submission_id).await.map_err(poll_err)?;
    Ok(Json(outcome))
}

async fn stats(State(st): State<AppState>) -> Json<RegistryStats> {
    Json(st.registry.stats())
}

// --- helpers ---
fn intake_err(e: IntakeError) -> (StatusCode, String) {
    match e {
        IntakeError::QuizNotFound(_) => e404(e.to_string()),
        e if e.is_validation() => e400(e.to_string()),
        IntakeError::Store(e) => store_err(e),
        e => e500(e),
    }
}

fn poll_err(e: PollError) -> (StatusCode, String) {
    match e {
        PollError::TimedOut { .. } => (StatusCode::GATEWAY_TIMEOUT, e.to_string()),
        PollError::Store(e) => store_err(e),
    }
}

fn store_err(e: StoreError) -> (StatusCode, String) {
    match e {
        StoreError::SubmissionNotFound(_) => e404(e.to_string()),
        e => e500(e),
    }
}

fn e400<T: Into<String>>(msg: T) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, msg.into())
}

fn e404<T: Into<String>>(msg: T) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, msg.into())
}

fn e500<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    tracing::error!(error=%e, "internal error");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::PollPolicy;
    use crate::runner::testing::FakeScorer;
    use crate::runner::EvaluationRunner;
    use crate::store::testing::seeded;
    use crate::store::MemoryStore;
    use crate::tasks::EvaluationScheduler;
    use axum::body::Body;
    use http::Request;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(store: Arc<MemoryStore>, scorer: FakeScorer, policy: PollPolicy) -> Router {
        let registry = Arc::new(TaskRegistry::default());
        let runner = Arc::new(EvaluationRunner::new(store.clone(), Arc::new(scorer), 4));
        let scheduler = EvaluationScheduler::new(runner, registry.clone());
        router(AppState {
            store: store.clone(),
            intake: Arc::new(SubmissionIntake::new(store.clone(), scheduler)),
            poller: Arc::new(ResultPoller::new(store, policy)),
            registry,
        })
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn submit_then_poll_for_result() {
        let (store, quiz) = seeded(&["q1", "q2"]).await;
        let app = app(store, FakeScorer::echo(Duration::from_millis(1500)), PollPolicy::default());

        let (status, body) = call(
            &app,
            post_json(
                "/api/submissions",
                json!({"quiz_id": quiz.id, "answers": {"q1": "Paris"}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "processing");
        let id = body["submission_id"].as_str().unwrap().to_string();

        let (status, body) = call(&app, get(&format!("/api/submissions/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "processing");
        assert_eq!(body["answers"]["q1"], "Paris");

        let (status, body) = call(&app, get(&format!("/api/submissions/{id}/result"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["feedback"][0]["question_id"], "q1");

        let (_, body) = call(&app, get(&format!("/api/submissions/{id}"))).await;
        assert_eq!(body["status"], "completed");

        let (_, stats) = call(&app, get("/api/evaluations/stats")).await;
        assert_eq!(stats["completed"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn submit_and_wait_returns_failure_marker() {
        let (store, quiz) = seeded(&["q1"]).await;
        let app = app(store, FakeScorer::ok("not json"), PollPolicy::default());
        let (status, body) = call(
            &app,
            post_json(
                "/api/submissions?wait=true",
                json!({"quiz_id": quiz.id, "answers": {"q1": "x"}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "failed");
        assert!(body["evaluation"]["diagnostic"]
            .as_str()
            .unwrap()
            .contains("malformed scorer output"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_evaluation_times_out_as_gateway_timeout() {
        let (store, quiz) = seeded(&["q1"]).await;
        let app = app(
            store,
            FakeScorer::echo(Duration::from_secs(3600)),
            PollPolicy::fixed(3, Duration::from_millis(100)),
        );
        let (_, body) = call(
            &app,
            post_json("/api/submissions", json!({"quiz_id": quiz.id, "answers": {}})),
        )
        .await;
        let id = body["submission_id"].as_str().unwrap().to_string();

        let (status, _) = call(&app, get(&format!("/api/submissions/{id}/result"))).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn rejects_unknown_quiz_and_foreign_questions() {
        let (store, quiz) = seeded(&["q1"]).await;
        let app = app(store, FakeScorer::echo(Duration::ZERO), PollPolicy::default());

        let (status, _) = call(
            &app,
            post_json(
                "/api/submissions",
                json!({"quiz_id": Uuid::new_v4(), "answers": {}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            &app,
            post_json(
                "/api/submissions",
                json!({"quiz_id": quiz.id, "answers": {"zz": "?"}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.as_str().unwrap().contains("zz"));
    }

    #[tokio::test]
    async fn unknown_submission_is_404() {
        let (store, _) = seeded(&[]).await;
        let app = app(store, FakeScorer::echo(Duration::ZERO), PollPolicy::default());
        let (status, _) = call(&app, get(&format!("/api/submissions/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
