//! Core types shared across the governance engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for an asynchronous job.
///
/// Serializes as the full UUID; `Display` uses a short, readable format like
/// "job_abc123xy" for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Convert to a short, readable string format.
    ///
    /// Takes the first 8 hex characters of the UUID and formats as "job_xxxxxxxx".
    pub fn to_short_string(&self) -> String {
        let hex = format!("{:032x}", self.0.as_u128());
        format!("job_{}", &hex[..8])
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<JobId> for Uuid {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_short_string())
    }
}

/// Ordered, normalized set of extra options passed to the external tool.
///
/// Pairs are sorted by `(name, value)` on construction, so two semantically
/// equal option sets compare equal and derive the same cache key regardless of
/// insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<(String, String)>", into = "Vec<(String, String)>")]
pub struct PromptOptions {
    pairs: Vec<(String, String)>,
}

impl PromptOptions {
    /// Build a normalized option set from arbitrary pairs.
    pub fn from_pairs<I, N, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        let mut pairs: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .collect();
        pairs.sort();
        Self { pairs }
    }

    /// Iterate over the normalized `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }
}

impl From<Vec<(String, String)>> for PromptOptions {
    fn from(pairs: Vec<(String, String)>) -> Self {
        Self::from_pairs(pairs)
    }
}

impl From<PromptOptions> for Vec<(String, String)> {
    fn from(options: PromptOptions) -> Self {
        options.pairs
    }
}

/// Result of a governed prompt execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptResponse {
    /// Text produced by the external tool (or served from the cache).
    pub output: String,
    /// Whether the response was served from the cache.
    pub from_cache: bool,
    /// Number of tool attempts made. Zero for cache hits.
    pub attempts: u32,
}

/// Structured reason for a terminal job failure.
///
/// Callers use this to decide whether resubmitting makes sense: a rate-limited
/// job can be retried later, a genuine execution failure usually cannot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The admission requeue budget ran out before a rate-limit slot opened.
    RateLimited { requeues: u32 },
    /// The external tool failed (after exhausting eligible retries).
    Execution { error: String },
    /// The job was cancelled before completing.
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::RateLimited { requeues } => {
                write!(f, "rate limited after {requeues} requeue(s)")
            }
            FailureReason::Execution { error } => write!(f, "execution failed: {error}"),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The current status of an asynchronous job.
///
/// Transitions are one-way: `queued -> running -> completed | failed`.
/// A queued job may also move directly to `failed` on cancellation. No job
/// re-enters `queued` or `running` after reaching a terminal state, except
/// that a rate-limited `running` job is returned to `queued` with a pickup
/// delay (which is not a terminal transition).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker. `not_before` delays pickup after an admission
    /// requeue.
    Queued {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        not_before: Option<DateTime<Utc>>,
    },

    /// A worker is executing the job.
    Running { started_at: DateTime<Utc> },

    /// The job produced output.
    Completed {
        output: String,
        from_cache: bool,
        completed_at: DateTime<Utc>,
    },

    /// The job reached a terminal failure.
    Failed {
        reason: FailureReason,
        failed_at: DateTime<Utc>,
    },
}

impl JobStatus {
    /// Check if this status represents a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed { .. } | JobStatus::Failed { .. })
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, JobStatus::Queued { .. })
    }

    /// Short status name for summaries and log lines.
    pub fn name(&self) -> &'static str {
        match self {
            JobStatus::Queued { .. } => "queued",
            JobStatus::Running { .. } => "running",
            JobStatus::Completed { .. } => "completed",
            JobStatus::Failed { .. } => "failed",
        }
    }
}

/// An asynchronous unit of work owned by the job queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub prompt: String,
    pub options: PromptOptions,
    pub use_cache: bool,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// Number of times admission sent the job back to the queue.
    pub requeues: u32,
    /// Set when a caller cancels a running job; observed best-effort after the
    /// in-flight attempt returns.
    #[serde(skip)]
    pub cancel_requested: bool,
}

impl Job {
    /// Completion time, present only in terminal states.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match &self.status {
            JobStatus::Completed { completed_at, .. } => Some(*completed_at),
            JobStatus::Failed { failed_at, .. } => Some(*failed_at),
            _ => None,
        }
    }
}

/// Per-prompt outcome within a batch, position-aligned with the input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    Success { output: String, from_cache: bool },
    Failure { reason: FailureReason },
}

/// Ordered sequence of per-prompt outcomes for a batch submission.
pub type BatchResult = Vec<BatchOutcome>;

/// Snapshot of the rate budget, as exposed by the `usage` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    /// Executed calls recorded within the trailing window.
    pub requests_last_hour: u64,
    /// Executed calls recorded since the start of the current UTC day.
    pub requests_today: u64,
    /// Calls still admissible before the window fills.
    pub remaining_this_hour: u64,
    /// Configured admission limit.
    pub max_per_hour: u64,
    /// Seconds until the oldest in-window record ages out. Zero when the
    /// window is empty.
    pub reset_in_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_short_string() {
        let id = JobId::new();
        let short = id.to_short_string();
        assert!(short.starts_with("job_"));
        assert_eq!(short.len(), 12);
    }

    #[test]
    fn options_normalize_ordering() {
        let a = PromptOptions::from_pairs([("temperature", "0.2"), ("model", "pro")]);
        let b = PromptOptions::from_pairs([("model", "pro"), ("temperature", "0.2")]);
        assert_eq!(a, b);

        let names: Vec<&str> = a.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["model", "temperature"]);
    }

    #[test]
    fn options_deserialize_normalizes() {
        let options: PromptOptions =
            serde_json::from_str(r#"[["z","1"],["a","2"]]"#).expect("valid options");
        assert_eq!(
            options,
            PromptOptions::from_pairs([("a", "2"), ("z", "1")])
        );
    }

    #[test]
    fn status_terminal() {
        assert!(!JobStatus::Queued { not_before: None }.is_terminal());
        assert!(!JobStatus::Running {
            started_at: Utc::now()
        }
        .is_terminal());

        assert!(JobStatus::Completed {
            output: "ok".to_string(),
            from_cache: false,
            completed_at: Utc::now(),
        }
        .is_terminal());

        assert!(JobStatus::Failed {
            reason: FailureReason::Cancelled,
            failed_at: Utc::now(),
        }
        .is_terminal());
    }

    #[test]
    fn status_serializes_with_tag() {
        let status = JobStatus::Failed {
            reason: FailureReason::RateLimited { requeues: 3 },
            failed_at: Utc::now(),
        };
        let value = serde_json::to_value(&status).expect("serializable");
        assert_eq!(value["status"], "failed");
        assert_eq!(value["reason"]["kind"], "rate_limited");
    }
}
