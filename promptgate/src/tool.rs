//! External tool invocation.
//!
//! The `ToolClient` trait abstracts one attempt against the external
//! text-generation CLI, so the executor's retry logic is testable without
//! spawning real subprocesses. All retry decisions live in the executor; a
//! client performs exactly one invocation per call.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error as ThisError;

use crate::types::PromptOptions;

/// Output of a successful tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Captured stdout of the tool.
    pub text: String,
    /// Exit code reported by the process.
    pub exit_code: i32,
}

/// Classification of a failed tool invocation. Drives retry eligibility.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ToolError {
    /// The attempt exceeded its timeout. Transient.
    #[error("tool invocation timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// Subprocess or I/O failure that may clear on retry.
    #[error("transient tool failure: {0}")]
    Transient(String),

    /// The input was rejected by the tool. Retrying cannot help.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Authentication-class failure. Retrying cannot help.
    #[error("authentication failure: {0}")]
    Auth(String),
}

impl ToolError {
    /// Whether the retry policy may schedule another attempt for this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, ToolError::Timeout(_) | ToolError::Transient(_))
    }
}

/// One attempt against the external tool.
#[async_trait]
pub trait ToolClient: Send + Sync + Clone {
    /// Invoke the tool once with a per-attempt timeout.
    async fn invoke(
        &self,
        prompt: &str,
        options: &PromptOptions,
        timeout: Duration,
    ) -> std::result::Result<ToolOutput, ToolError>;
}

// ============================================================================
// Production implementation: subprocess invocation
// ============================================================================

/// Production client that shells out to the external CLI tool.
#[derive(Debug, Clone)]
pub struct CliToolClient {
    program: String,
    base_flags: Vec<String>,
}

impl CliToolClient {
    pub fn new(program: impl Into<String>, base_flags: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_flags,
        }
    }
}

#[async_trait]
impl ToolClient for CliToolClient {
    #[tracing::instrument(skip(self, prompt, options), fields(program = %self.program))]
    async fn invoke(
        &self,
        prompt: &str,
        options: &PromptOptions,
        timeout: Duration,
    ) -> std::result::Result<ToolOutput, ToolError> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.base_flags);
        for (name, value) in options.iter() {
            cmd.arg(format!("--{name}"));
            if !value.is_empty() {
                cmd.arg(value);
            }
        }
        cmd.arg("-p").arg(prompt);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(timeout_s = timeout.as_secs(), "invoking external tool");

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolError::Transient(format!(
                    "failed to run {}: {e}",
                    self.program
                )))
            }
            Err(_) => return Err(ToolError::Timeout(timeout)),
        };

        if output.status.success() {
            tracing::debug!(stdout_len = output.stdout.len(), "tool invocation succeeded");
            Ok(ToolOutput {
                text: String::from_utf8_lossy(&output.stdout).into_owned(),
                exit_code: 0,
            })
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let error = classify_failure(output.status.code(), stderr.trim());
            tracing::warn!(exit_code = ?output.status.code(), error = %error, "tool invocation failed");
            Err(error)
        }
    }
}

/// Map a non-zero exit to a failure class.
///
/// Usage errors (conventionally exit code 2) and auth complaints are not
/// retryable; anything else is assumed transient.
fn classify_failure(code: Option<i32>, stderr: &str) -> ToolError {
    let lower = stderr.to_lowercase();
    if lower.contains("unauthenticated")
        || lower.contains("api key")
        || lower.contains("permission denied")
    {
        ToolError::Auth(stderr.to_string())
    } else if code == Some(2) || lower.contains("usage:") || lower.contains("invalid argument") {
        ToolError::InvalidInput(stderr.to_string())
    } else {
        ToolError::Transient(format!(
            "tool exited with {}: {stderr}",
            code.map_or_else(|| "signal".to_string(), |c| c.to_string())
        ))
    }
}

// ============================================================================
// Test/mock implementation
// ============================================================================

/// Mock tool client for testing.
///
/// Responses are scripted per prompt and returned in FIFO order. Every call is
/// recorded for later inspection.
#[derive(Clone)]
pub struct MockToolClient {
    responses: Arc<Mutex<HashMap<String, Vec<std::result::Result<ToolOutput, ToolError>>>>>,
    calls: Arc<Mutex<Vec<MockInvocation>>>,
}

/// Record of a call made to the mock tool client.
#[derive(Debug, Clone)]
pub struct MockInvocation {
    pub prompt: String,
    pub options: PromptOptions,
    pub timeout: Duration,
}

impl MockToolClient {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Script a response for a prompt. Multiple responses for the same prompt
    /// are consumed in FIFO order.
    pub fn add_response(
        &self,
        prompt: &str,
        response: std::result::Result<ToolOutput, ToolError>,
    ) {
        self.responses
            .lock()
            .entry(prompt.to_string())
            .or_default()
            .push(response);
    }

    /// Script a plain successful text response.
    pub fn add_success(&self, prompt: &str, text: &str) {
        self.add_response(
            prompt,
            Ok(ToolOutput {
                text: text.to_string(),
                exit_code: 0,
            }),
        );
    }

    pub fn get_calls(&self) -> Vec<MockInvocation> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Default for MockToolClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolClient for MockToolClient {
    async fn invoke(
        &self,
        prompt: &str,
        options: &PromptOptions,
        timeout: Duration,
    ) -> std::result::Result<ToolOutput, ToolError> {
        self.calls.lock().push(MockInvocation {
            prompt: prompt.to_string(),
            options: options.clone(),
            timeout,
        });

        let mut responses = self.responses.lock();
        if let Some(queue) = responses.get_mut(prompt) {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }

        Err(ToolError::Transient(format!(
            "no scripted response for prompt {prompt:?}"
        )))
    }
}
