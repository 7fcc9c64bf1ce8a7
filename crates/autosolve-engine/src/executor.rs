use std::time::Duration;

use autosolve_core::{CapturedOutput, EngineConfig, FailureKind, LanguageProfile, ResourceLimits};
use thiserror::Error;

use crate::process::{run_process, ProcessOutput, ProcessSpec, Termination};
use crate::workspace::Workspace;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Compilation failed: {0}")]
    CompilationFailed(String),
    #[error("Runtime error: {0}")]
    RuntimeError(String),
    #[error("Execution timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ExecutorError::CompilationFailed(_) => FailureKind::CompileError,
            ExecutorError::RuntimeError(_) => FailureKind::RuntimeError,
            ExecutorError::Timeout(_) => FailureKind::Timeout,
            ExecutorError::Io(_) => FailureKind::InfrastructureError,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Result of the run step. Output is kept even when the run failed.
#[derive(Debug)]
pub struct RunOutcome {
    pub output: CapturedOutput,
    pub error: Option<ExecutorError>,
}

/// Compiles and runs staged source according to its language profile.
#[derive(Debug, Clone)]
pub struct CodeExecutor {
    compile_timeout: Duration,
    kill_grace: Duration,
    max_output_bytes: usize,
    clear_env: bool,
    limits: ResourceLimits,
}

impl CodeExecutor {
    pub fn new(engine: &EngineConfig, limits: &ResourceLimits) -> Self {
        Self {
            compile_timeout: engine.compile_timeout(),
            kill_grace: engine.kill_grace(),
            max_output_bytes: engine.max_output_bytes,
            clear_env: engine.clear_env,
            limits: limits.clone(),
        }
    }

    /// Run the profile's compile command. A no-op for interpreted languages.
    pub async fn compile(&self, workspace: &Workspace, profile: &LanguageProfile) -> Result<()> {
        let Some(compile) = &profile.compile else {
            return Ok(());
        };

        let (program, args) = compile.resolve(
            workspace.source_path(),
            workspace.binary_path(),
            workspace.path(),
        );
        tracing::debug!("Compiling with {} {:?}", program, args);

        let mut spec = ProcessSpec::new(program, args, workspace.path());
        spec.timeout = self.compile_timeout;
        spec.kill_grace = self.kill_grace;
        spec.max_output_bytes = self.max_output_bytes;

        let output = run_process(&spec).await?;
        match output.termination {
            Termination::TimedOut => Err(ExecutorError::CompilationFailed(format!(
                "compiler timed out after {}s",
                self.compile_timeout.as_secs_f64()
            ))),
            Termination::Exited(0) => {
                match tokio::fs::try_exists(workspace.binary_path()).await {
                    Ok(true) => Ok(()),
                    _ => Err(ExecutorError::CompilationFailed(format!(
                        "compiler reported success but produced no artifact\n{}",
                        diagnostics(&output)
                    ))),
                }
            }
            Termination::Exited(_) | Termination::Signaled(_) => {
                Err(ExecutorError::CompilationFailed(diagnostics(&output)))
            }
        }
    }

    /// Run the staged program with `timeout`, feeding `stdin` if given.
    pub async fn run(
        &self,
        workspace: &Workspace,
        profile: &LanguageProfile,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> RunOutcome {
        let (program, args) = profile.run.resolve(
            workspace.source_path(),
            workspace.binary_path(),
            workspace.path(),
        );
        tracing::debug!("Running {} {:?} with timeout {:?}", program, args, timeout);

        let mut spec = ProcessSpec::new(program, args, workspace.path());
        spec.stdin = stdin.map(<[u8]>::to_vec);
        spec.timeout = timeout;
        spec.kill_grace = self.kill_grace;
        spec.max_output_bytes = self.max_output_bytes;
        spec.limits = Some(self.limits.clone());
        spec.clear_env = self.clear_env;

        let output = match run_process(&spec).await {
            Ok(output) => output,
            Err(e) => {
                return RunOutcome {
                    output: CapturedOutput::default(),
                    error: Some(ExecutorError::Io(e)),
                }
            }
        };

        if output.truncated {
            tracing::warn!(
                "Output of {} truncated at {} bytes",
                spec.program,
                self.max_output_bytes
            );
        }

        let error = match output.termination {
            Termination::Exited(0) => None,
            Termination::TimedOut => Some(ExecutorError::Timeout(timeout)),
            Termination::Exited(code) => Some(ExecutorError::RuntimeError(
                failure_text(&output, &format!("process exited with status {code}")),
            )),
            Termination::Signaled(signal) => Some(ExecutorError::RuntimeError(
                failure_text(&output, &format!("process killed by signal {signal}")),
            )),
        };

        RunOutcome {
            output: CapturedOutput {
                stdout: output.stdout_lossy(),
                stderr: output.stderr_lossy(),
                exit_code: match output.termination {
                    Termination::Exited(code) => Some(code),
                    _ => None,
                },
                execution_time_seconds: output.elapsed.as_secs_f64(),
            },
            error,
        }
    }
}

fn diagnostics(output: &ProcessOutput) -> String {
    let stderr = output.stderr_lossy();
    let stdout = output.stdout_lossy();
    format!("{}\n{}", stderr.trim(), stdout.trim())
        .trim()
        .to_string()
}

/// Stderr when the program said something, else `fallback`.
fn failure_text(output: &ProcessOutput, fallback: &str) -> String {
    let stderr = output.stderr_lossy();
    match stderr.trim().is_empty() {
        true => fallback.to_string(),
        false => stderr.trim().to_string(),
    }
}
