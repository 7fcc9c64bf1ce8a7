use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::Language;

// =============================================================================
// Status Enums
// =============================================================================

/// Lifecycle of a solve attempt. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    #[default]
    Pending,
    Compiling,
    Running,
    Completed,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Compiling => "compiling",
            AttemptStatus::Running => "running",
            AttemptStatus::Completed => "completed",
            AttemptStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptStatus::Completed | AttemptStatus::Failed)
    }

    pub fn can_transition_to(&self, next: AttemptStatus) -> bool {
        use AttemptStatus::*;
        matches!(
            (self, next),
            (Pending, Compiling)
                | (Pending, Running)
                | (Pending, Failed)
                | (Compiling, Running)
                | (Compiling, Failed)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

/// Why an attempt ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CompileError,
    RuntimeError,
    Timeout,
    InfrastructureError,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::CompileError => "compile_error",
            FailureKind::RuntimeError => "runtime_error",
            FailureKind::Timeout => "timeout",
            FailureKind::InfrastructureError => "infrastructure_error",
        }
    }
}

/// Where the executed source came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SolveMethod {
    Custom,
    Template,
    #[default]
    AiGenerated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid attempt transition: {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: AttemptStatus,
    pub to: AttemptStatus,
}

// =============================================================================
// Attempt Record
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveAttempt {
    pub id: String,
    #[serde(default)]
    pub challenge_id: Option<String>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub method: SolveMethod,
    pub status: AttemptStatus,
    pub language: Language,
    pub source_code: String,
    #[serde(default)]
    pub stdin: Option<Vec<u8>>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub extracted_token: Option<String>,
    #[serde(default)]
    pub failure_kind: Option<FailureKind>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub execution_time_seconds: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SolveAttempt {
    pub fn new(language: Language, source_code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            challenge_id: None,
            category: String::new(),
            method: SolveMethod::default(),
            status: AttemptStatus::Pending,
            language,
            source_code: source_code.into(),
            stdin: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            extracted_token: None,
            failure_kind: None,
            error_message: None,
            execution_time_seconds: 0.0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_challenge(mut self, challenge_id: Option<String>, category: impl Into<String>) -> Self {
        self.challenge_id = challenge_id;
        self.category = category.into();
        self
    }

    pub fn with_method(mut self, method: SolveMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_stdin(mut self, stdin: Option<Vec<u8>>) -> Self {
        self.stdin = stdin;
        self
    }

    /// Move to a non-terminal state.
    pub fn advance(&mut self, next: AttemptStatus) -> Result<(), TransitionError> {
        if next.is_terminal() || !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Finish a run that exited successfully.
    pub fn complete(
        &mut self,
        output: CapturedOutput,
        extracted_token: Option<String>,
    ) -> Result<(), TransitionError> {
        self.finish(AttemptStatus::Completed)?;
        self.apply_output(output);
        self.extracted_token = extracted_token;
        Ok(())
    }

    /// Finish with a failure. Any captured output is kept for diagnosis.
    pub fn fail(
        &mut self,
        kind: FailureKind,
        message: impl Into<String>,
        output: Option<CapturedOutput>,
    ) -> Result<(), TransitionError> {
        self.finish(AttemptStatus::Failed)?;
        if let Some(output) = output {
            self.apply_output(output);
        }
        self.failure_kind = Some(kind);
        self.error_message = Some(message.into());
        self.extracted_token = None;
        Ok(())
    }

    fn finish(&mut self, terminal: AttemptStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(terminal) {
            return Err(TransitionError {
                from: self.status,
                to: terminal,
            });
        }
        self.status = terminal;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    fn apply_output(&mut self, output: CapturedOutput) {
        self.stdout = output.stdout;
        self.stderr = output.stderr;
        self.exit_code = output.exit_code;
        self.execution_time_seconds = output.execution_time_seconds;
    }
}

/// What the run step produced, handed to the record on completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub execution_time_seconds: f64,
}

// =============================================================================
// Partial Updates
// =============================================================================

/// Field-wise merge applied by record stores. Applying the same update twice
/// leaves the record unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AttemptStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl AttemptUpdate {
    pub fn status(status: AttemptStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Everything a finished attempt carries beyond its creation fields.
    pub fn outcome_of(attempt: &SolveAttempt) -> Self {
        Self {
            status: Some(attempt.status),
            source_code: None,
            stdout: Some(attempt.stdout.clone()),
            stderr: Some(attempt.stderr.clone()),
            exit_code: attempt.exit_code,
            extracted_token: attempt.extracted_token.clone(),
            failure_kind: attempt.failure_kind,
            error_message: attempt.error_message.clone(),
            execution_time_seconds: Some(attempt.execution_time_seconds),
            completed_at: attempt.completed_at,
        }
    }

    pub fn apply(&self, attempt: &mut SolveAttempt) {
        if let Some(status) = self.status {
            attempt.status = status;
        }
        if let Some(ref source) = self.source_code {
            attempt.source_code = source.clone();
        }
        if let Some(ref stdout) = self.stdout {
            attempt.stdout = stdout.clone();
        }
        if let Some(ref stderr) = self.stderr {
            attempt.stderr = stderr.clone();
        }
        if self.exit_code.is_some() {
            attempt.exit_code = self.exit_code;
        }
        if self.extracted_token.is_some() {
            attempt.extracted_token = self.extracted_token.clone();
        }
        if self.failure_kind.is_some() {
            attempt.failure_kind = self.failure_kind;
        }
        if self.error_message.is_some() {
            attempt.error_message = self.error_message.clone();
        }
        if let Some(secs) = self.execution_time_seconds {
            attempt.execution_time_seconds = secs;
        }
        if self.completed_at.is_some() {
            attempt.completed_at = self.completed_at;
        }
    }
}
