use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

use crate::models::{Answers, Quiz};

/// Environment variable carrying the JSON payload into the scorer process.
pub const PAYLOAD_ENV: &str = "QUIZ_DATA";

/// Largest serialized payload accepted. Linux rejects a single environment string
/// over 128 KiB (`MAX_ARG_STRLEN`) with E2BIG.
pub const MAX_PAYLOAD_BYTES: usize = 96 * 1024;

// Keep diagnostics readable when a scorer dumps a traceback.
const STDERR_TAIL: usize = 2000;

/// The single document handed to the scorer for one submission.
#[derive(Serialize, Debug)]
pub struct ScorerPayload<'a> {
    pub quiz: &'a Quiz,
    pub answers: &'a Answers,
}

impl ScorerPayload<'_> {
    pub fn encode(&self) -> Result<String, ScorerError> {
        let data = serde_json::to_string(self)?;
        if data.len() > MAX_PAYLOAD_BYTES {
            return Err(ScorerError::PayloadTooLarge(data.len()));
        }
        Ok(data)
    }
}

#[derive(Error, Debug)]
pub enum ScorerError {
    #[error("failed to launch scorer `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("scorer exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },
    #[error("scorer did not finish within {0:?} and was terminated")]
    TimedOut(Duration),
    #[error("failed to collect scorer output: {0}")]
    Io(#[source] std::io::Error),
    #[error("failed to encode scorer payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("scorer payload is {0} bytes, over the {MAX_PAYLOAD_BYTES} byte limit")]
    PayloadTooLarge(usize),
}

/// Out-of-process grader. Returns the raw standard output of one run.
#[async_trait]
pub trait Scorer: Send + Sync + 'static {
    async fn run(&self, payload: &ScorerPayload<'_>) -> Result<String, ScorerError>;
}

/// Runs an external program once per submission.
///
/// The payload goes in through [`PAYLOAD_ENV`]; stdin is closed. The process is
/// killed if it outlives `timeout`.
#[derive(Debug, Clone)]
pub struct ProcessScorer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessScorer {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl Scorer for ProcessScorer {
    async fn run(&self, payload: &ScorerPayload<'_>) -> Result<String, ScorerError> {
        let data = payload.encode()?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(PAYLOAD_ENV, data)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        tracing::debug!(program = %self.program, args = ?self.args, "launching scorer");

        let child = cmd.spawn().map_err(|source| ScorerError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(res) => res.map_err(ScorerError::Io)?,
            Err(_) => return Err(ScorerError::TimedOut(self.timeout)),
        };

        if !output.status.success() {
            return Err(ScorerError::Exited {
                status: output.status.to_string(),
                stderr: tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn tail(s: &str, max: usize) -> String {
    let s = s.trim();
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &s[start..])
}
