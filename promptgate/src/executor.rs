//! Retry/backoff loop around the external tool.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::tool::{ToolClient, ToolError, ToolOutput};
use crate::types::PromptOptions;

/// Retry policy for transient tool failures.
///
/// `next_delay` is a pure function of the attempt number and the failure
/// class, so the policy is testable without invoking the real tool.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts allowed after the first failure.
    pub max_retries: u32,
    /// Base backoff duration, doubled (by `backoff_factor`) each retry.
    pub backoff: Duration,
    /// Factor by which the backoff grows with each retry.
    pub backoff_factor: u32,
    /// Ceiling on any single backoff delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(1),
            backoff_factor: 2,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the retry following failed attempt `attempt` (0-based).
    ///
    /// Exponential: `backoff * backoff_factor^attempt`, capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let ms = (self.backoff.as_millis() as u64)
            .saturating_mul((self.backoff_factor as u64).saturating_pow(attempt));
        Duration::from_millis(ms).min(self.max_backoff)
    }

    /// Decide whether the failure of attempt `attempt` (0-based) warrants a
    /// retry, and after how long. `None` means give up.
    ///
    /// Only transient failures (timeouts, transient subprocess errors) are
    /// retried; invalid-input and auth-class failures fail immediately.
    pub fn next_delay(&self, attempt: u32, error: &ToolError) -> Option<Duration> {
        if !error.is_transient() || attempt >= self.max_retries {
            return None;
        }
        Some(self.backoff_for(attempt))
    }
}

/// Runs prompts against the external tool, applying the retry policy.
///
/// Exactly one tool invocation per attempt, each with an independent timeout.
/// No state mutation happens here: ledger recording is the caller's job once
/// the outcome is definitive.
#[derive(Clone)]
pub struct Executor<T: ToolClient> {
    client: T,
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl<T: ToolClient> Executor<T> {
    pub fn new(client: T, policy: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self {
            client,
            policy,
            attempt_timeout,
        }
    }

    /// Invoke the tool, retrying transient failures with exponential backoff.
    ///
    /// Returns the output together with the number of attempts made. On
    /// exhaustion the last underlying error is surfaced.
    #[tracing::instrument(skip_all)]
    pub async fn run(&self, prompt: &str, options: &PromptOptions) -> Result<(ToolOutput, u32)> {
        let mut attempt = 0u32;
        loop {
            match self.client.invoke(prompt, options, self.attempt_timeout).await {
                Ok(output) => return Ok((output, attempt + 1)),
                Err(error) => match self.policy.next_delay(attempt, &error) {
                    Some(delay) => {
                        tracing::warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "tool attempt failed, backing off before retry"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(exhausted(error, attempt + 1)),
                },
            }
        }
    }
}

/// Map the final tool error to the caller-facing taxonomy.
fn exhausted(error: ToolError, attempts: u32) -> Error {
    match error {
        ToolError::Timeout(_) => Error::ExecutionTimeout { attempts },
        ToolError::InvalidInput(message) => Error::InvalidInput(message),
        ToolError::Transient(message) | ToolError::Auth(message) => Error::ExecutionFailed {
            message,
            attempts,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::MockToolClient;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: Duration::from_millis(5),
            backoff_factor: 2,
            max_backoff: Duration::from_millis(50),
        }
    }

    #[test]
    fn backoff_grows_exponentially() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff: Duration::from_millis(1000),
            backoff_factor: 2,
            max_backoff: Duration::from_secs(60),
        };

        assert_eq!(policy.backoff_for(0).as_millis(), 1000);
        assert_eq!(policy.backoff_for(1).as_millis(), 2000);
        assert_eq!(policy.backoff_for(2).as_millis(), 4000);
        assert_eq!(policy.backoff_for(3).as_millis(), 8000);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            backoff: Duration::from_millis(1000),
            backoff_factor: 2,
            max_backoff: Duration::from_millis(5000),
        };

        assert_eq!(policy.backoff_for(6), Duration::from_millis(5000));
    }

    #[test]
    fn non_transient_failures_never_retry() {
        let policy = fast_policy(5);
        assert_eq!(
            policy.next_delay(0, &ToolError::InvalidInput("bad".to_string())),
            None
        );
        assert_eq!(
            policy.next_delay(0, &ToolError::Auth("expired".to_string())),
            None
        );
        assert!(policy
            .next_delay(0, &ToolError::Timeout(Duration::from_secs(1)))
            .is_some());
    }

    #[test]
    fn retry_budget_is_bounded() {
        let policy = fast_policy(2);
        let error = ToolError::Transient("flaky".to_string());
        assert!(policy.next_delay(0, &error).is_some());
        assert!(policy.next_delay(1, &error).is_some());
        assert_eq!(policy.next_delay(2, &error), None);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let mock = MockToolClient::new();
        mock.add_response("hi", Err(ToolError::Timeout(Duration::from_secs(1))));
        mock.add_response("hi", Err(ToolError::Timeout(Duration::from_secs(1))));
        mock.add_success("hi", "finally");

        let executor = Executor::new(mock.clone(), fast_policy(2), Duration::from_secs(1));
        let (output, attempts) = executor
            .run("hi", &PromptOptions::default())
            .await
            .expect("third attempt succeeds");

        assert_eq!(output.text, "finally");
        assert_eq!(attempts, 3);
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn exhausts_retries_then_surfaces_last_error() {
        let mock = MockToolClient::new();
        for _ in 0..3 {
            mock.add_response("hi", Err(ToolError::Transient("flaky".to_string())));
        }

        let executor = Executor::new(mock.clone(), fast_policy(2), Duration::from_secs(1));
        let error = executor
            .run("hi", &PromptOptions::default())
            .await
            .expect_err("retries exhausted");

        // First attempt + exactly max_retries retries.
        assert_eq!(mock.call_count(), 3);
        match error {
            Error::ExecutionFailed { message, attempts } => {
                assert_eq!(message, "flaky");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_exhaustion_is_reported_as_timeout() {
        let mock = MockToolClient::new();
        mock.add_response("hi", Err(ToolError::Timeout(Duration::from_secs(1))));
        mock.add_response("hi", Err(ToolError::Timeout(Duration::from_secs(1))));

        let executor = Executor::new(mock.clone(), fast_policy(1), Duration::from_secs(1));
        let error = executor
            .run("hi", &PromptOptions::default())
            .await
            .expect_err("timeouts exhausted");

        assert!(matches!(error, Error::ExecutionTimeout { attempts: 2 }));
    }

    #[tokio::test]
    async fn invalid_input_fails_with_zero_retries() {
        let mock = MockToolClient::new();
        mock.add_response("bad", Err(ToolError::InvalidInput("malformed".to_string())));

        let executor = Executor::new(mock.clone(), fast_policy(5), Duration::from_secs(1));
        let error = executor
            .run("bad", &PromptOptions::default())
            .await
            .expect_err("invalid input is terminal");

        assert_eq!(mock.call_count(), 1);
        assert!(matches!(error, Error::InvalidInput(_)));
    }
}
