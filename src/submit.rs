use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Answers keyed by question id. Owned by the surrounding exam UI; the
/// controller only snapshots it at submit time and treats the payloads as
/// opaque JSON.
pub type AnswerDraft = BTreeMap<String, Value>;

/// Server acknowledgement of a finalized submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub session_id: String,
    pub submission_id: String,
    pub score_percent: Option<f64>,
    pub received_at: DateTime<Utc>,
}

impl Receipt {
    /// Pass/fail presentation only; the pass mark never drives transitions.
    pub fn passed(&self, pass_mark_percent: f64) -> Option<bool> {
        self.score_percent.map(|s| s >= pass_mark_percent)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubmitError {
    /// Network or server hiccup; safe to retry with the same payload
    /// (server-side idempotency is keyed by session_id).
    #[error("transient submission failure: {0}")]
    Transient(String),
    /// The server rejected the submission outright, e.g. session already
    /// finalized. Never retried.
    #[error("submission rejected: {0}")]
    Permanent(String),
}

/// REST boundary that persists answers and finalizes a submission. The
/// only operation in the controller allowed to block.
pub trait SubmissionClient {
    fn submit(&mut self, session_id: &str, draft: &AnswerDraft) -> Result<Receipt, SubmitError>;
}

/// Bounded exponential backoff for transient submission failures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_secs: u64,
    pub cap_secs: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_secs: 2,
            cap_secs: 30,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `failed_attempts` transient failures, jittered
    /// by up to 10% so parallel clients do not retry in lockstep.
    pub fn backoff_after(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(16);
        let secs = self
            .base_secs
            .saturating_mul(1u64 << exponent)
            .min(self.cap_secs);
        let millis = secs * 1000;
        let jitter = rand::thread_rng().gen_range(0..=millis / 10);
        Duration::milliseconds((millis + jitter) as i64)
    }
}

/// Scripted client for tests and the harness: fails transiently a set
/// number of times, then succeeds (or always rejects). Clones share state
/// so callers can inspect recorded submissions afterwards.
#[derive(Debug, Clone, Default)]
pub struct ScriptedClient {
    inner: Arc<Mutex<ScriptedClientInner>>,
}

#[derive(Debug, Default)]
struct ScriptedClientInner {
    fail_transient: u32,
    reject: Option<String>,
    score_percent: Option<f64>,
    submissions: Vec<(String, AnswerDraft)>,
}

impl ScriptedClient {
    pub fn succeeding() -> Self {
        Self::default()
    }

    /// Fail with a transient error for the first `n` submissions.
    pub fn flaky(n: u32) -> Self {
        let client = Self::default();
        client.inner.lock().unwrap().fail_transient = n;
        client
    }

    /// Reject every submission permanently.
    pub fn rejecting(reason: &str) -> Self {
        let client = Self::default();
        client.inner.lock().unwrap().reject = Some(reason.to_string());
        client
    }

    pub fn with_score(self, score_percent: f64) -> Self {
        self.inner.lock().unwrap().score_percent = Some(score_percent);
        self
    }

    /// Every submit invocation seen so far, in order, with its payload.
    pub fn submissions(&self) -> Vec<(String, AnswerDraft)> {
        self.inner.lock().unwrap().submissions.clone()
    }
}

impl SubmissionClient for ScriptedClient {
    fn submit(&mut self, session_id: &str, draft: &AnswerDraft) -> Result<Receipt, SubmitError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .submissions
            .push((session_id.to_string(), draft.clone()));

        if let Some(reason) = &inner.reject {
            return Err(SubmitError::Permanent(reason.clone()));
        }
        if inner.fail_transient > 0 {
            inner.fail_transient -= 1;
            return Err(SubmitError::Transient("simulated outage".into()));
        }

        Ok(Receipt {
            session_id: session_id.to_string(),
            submission_id: format!("{}-{}", session_id, inner.submissions.len()),
            score_percent: inner.score_percent,
            received_at: Utc::now(),
        })
    }
}
