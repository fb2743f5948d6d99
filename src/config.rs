use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::poller::PollPolicy;

/// Runtime settings, read from the environment after `.env` is loaded.
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    /// Unset means the in-memory store.
    pub database_url: Option<String>,
    /// JSON array of quizzes loaded into the in-memory store at startup.
    pub seed_quizzes: Option<String>,
    pub scorer_program: String,
    pub scorer_args: Vec<String>,
    pub scorer_timeout: Duration,
    pub max_concurrent_evaluations: usize,
    pub poll_max_attempts: u32,
    pub poll_delay: Duration,
    pub poll_backoff: f64,
    pub poll_max_delay: Duration,
    pub reconcile_interval: Duration,
    pub reconcile_stale_after: Duration,
    /// Sweeps that may restart one submission before it is marked failed.
    pub reconcile_max_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8081,
            database_url: None,
            seed_quizzes: None,
            scorer_program: "python3".into(),
            scorer_args: vec!["evaluation/evaluation.py".into()],
            scorer_timeout: Duration::from_secs(120),
            max_concurrent_evaluations: 4,
            poll_max_attempts: 10,
            poll_delay: Duration::from_millis(1000),
            poll_backoff: 1.0,
            poll_max_delay: Duration::from_millis(1000),
            reconcile_interval: Duration::from_secs(60),
            reconcile_stale_after: Duration::from_secs(600),
            reconcile_max_attempts: 3,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| env::var(k).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let poll_delay = var(&get, "POLL_DELAY_MS").map(Duration::from_millis).unwrap_or(d.poll_delay);
        Self {
            port: var(&get, "PORT").unwrap_or(d.port),
            database_url: get("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            seed_quizzes: get("SEED_QUIZZES").filter(|v| !v.trim().is_empty()),
            scorer_program: get("SCORER_PROGRAM").unwrap_or(d.scorer_program),
            scorer_args: get("SCORER_ARGS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or(d.scorer_args),
            scorer_timeout: secs(&get, "SCORER_TIMEOUT_SECS").unwrap_or(d.scorer_timeout),
            max_concurrent_evaluations: var(&get, "MAX_CONCURRENT_EVALUATIONS")
                .unwrap_or(d.max_concurrent_evaluations),
            poll_max_attempts: var(&get, "POLL_MAX_ATTEMPTS").unwrap_or(d.poll_max_attempts),
            poll_delay,
            poll_backoff: var(&get, "POLL_BACKOFF").unwrap_or(d.poll_backoff),
            poll_max_delay: var(&get, "POLL_MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(poll_delay),
            reconcile_interval: secs(&get, "RECONCILE_INTERVAL_SECS")
                .unwrap_or(d.reconcile_interval),
            reconcile_max_attempts: var(&get, "RECONCILE_MAX_ATTEMPTS")
                .filter(|n: &u32| *n > 0)
                .unwrap_or(d.reconcile_max_attempts),
            reconcile_stale_after: var(&get, "RECONCILE_STALE_AFTER_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.reconcile_stale_after),
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::fixed(self.poll_max_attempts, self.poll_delay)
            .with_backoff(self.poll_backoff, self.poll_max_delay)
    }
}

fn var<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|v| v.trim().parse().ok())
}

/// Whole seconds; zero is treated as unset.
fn secs(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    var(get, key).filter(|s: &u64| *s > 0).map(Duration::from_secs)
}
