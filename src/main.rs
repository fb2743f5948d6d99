use anyhow::Context;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::{Any, CorsLayer}, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod db;
mod intake;
mod models;
mod poller;
mod reconcile;
mod routes;
mod runner;
mod scorer;
mod store;
mod tasks;

use config::Config;
use store::{MemoryStore, SubmissionStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "quiz_eval_runtime=info,axum=info".into())
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Config::from_env();
    let store = open_store(&cfg).await?;

    let scorer = Arc::new(scorer::ProcessScorer::new(
        cfg.scorer_program.clone(),
        cfg.scorer_args.clone(),
        cfg.scorer_timeout,
    ));
    let runner = Arc::new(runner::EvaluationRunner::new(
        store.clone(),
        scorer,
        cfg.max_concurrent_evaluations,
    ));
    let scheduler =
        tasks::EvaluationScheduler::new(runner, Arc::new(tasks::TaskRegistry::default()));

    let reconciler = reconcile::Reconciler::new(
        store.clone(),
        scheduler.clone(),
        cfg.reconcile_stale_after,
        cfg.reconcile_max_attempts,
    );
    let sweeper = tokio::spawn(reconciler.run_every(cfg.reconcile_interval));
    let sweeper_abort = sweeper.abort_handle();
    tokio::spawn(async move {
        match sweeper.await {
            Err(e) if e.is_cancelled() => {}
            Err(e) => tracing::error!(error=%e, "reconciliation sweep died; stuck submissions will not be retried"),
            Ok(()) => tracing::error!("reconciliation sweep exited"),
        }
    });

    let state = routes::AppState {
        store: store.clone(),
        intake: Arc::new(intake::SubmissionIntake::new(store.clone(), scheduler.clone())),
        poller: Arc::new(poller::ResultPoller::new(store, cfg.poll_policy())),
        registry: scheduler.registry().clone(),
    };

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(routes::router(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(
        scorer = %cfg.scorer_program,
        timeout_secs = cfg.scorer_timeout.as_secs(),
        "listening on http://{}",
        addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    sweeper_abort.abort();
    let aborted = scheduler.shutdown(cfg.scorer_timeout).await;
    tracing::info!(aborted, "shutdown complete");
    Ok(())
}

async fn open_store(cfg: &Config) -> anyhow::Result<Arc<dyn SubmissionStore>> {
    if let Some(url) = &cfg.database_url {
        let pool = db::connect(url).await?;
        // crate-relative path for sqlx migrations
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!("using postgres store");
        return Ok(Arc::new(db::PgStore::new(pool)));
    }

    let mem = MemoryStore::new();
    if let Some(path) = &cfg.seed_quizzes {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {path}"))?;
        let quizzes: Vec<models::Quiz> =
            serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?;
        tracing::info!(count = quizzes.len(), "seeded quizzes");
        for quiz in quizzes {
            mem.put_quiz(quiz).await;
        }
    }
    tracing::warn!("DATABASE_URL not set; submissions are kept in memory");
    Ok(Arc::new(mem))
}
