use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Outcome of running a candidate's code against the judge service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub runtime_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum JudgeError {
    #[error("judge unavailable: {0}")]
    Unavailable(String),
    #[error("language not supported: {0}")]
    UnsupportedLanguage(String),
}

/// Third-party code-execution boundary, used only for coding-question
/// feedback while an exam is in progress. Results never affect the timer
/// or the session phase.
pub trait CodeExecutionClient {
    fn run(
        &mut self,
        source: &str,
        language: &str,
        stdin: &str,
    ) -> Result<ExecutionResult, JudgeError>;
}

/// Canned judge for the harness and tests: returns a fixed result per
/// language, or `UnsupportedLanguage` for anything unregistered.
#[derive(Debug, Clone, Default)]
pub struct StaticJudge {
    responses: HashMap<String, ExecutionResult>,
}

impl StaticJudge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, language: &str, result: ExecutionResult) -> Self {
        self.responses.insert(language.to_string(), result);
        self
    }
}

impl CodeExecutionClient for StaticJudge {
    fn run(
        &mut self,
        _source: &str,
        language: &str,
        _stdin: &str,
    ) -> Result<ExecutionResult, JudgeError> {
        self.responses
            .get(language)
            .cloned()
            .ok_or_else(|| JudgeError::UnsupportedLanguage(language.to_string()))
    }
}
