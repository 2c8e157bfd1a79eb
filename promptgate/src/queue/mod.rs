//! Asynchronous job queue.
//!
//! The queue owns every `Job`; other components only read jobs by id.
//! Submission never blocks and is never rejected — backpressure happens in the
//! workers' execution path, not at enqueue time. Terminal transitions are
//! written exactly once: the first writer wins and later writers are ignored.
//!
//! Terminal jobs are retained for the life of the process so callers can
//! fetch results and failure reasons at any point after completion; there is
//! no eviction of finished jobs.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::types::{FailureReason, Job, JobId, JobStatus, PromptOptions};

pub mod worker;

pub use worker::{WorkerConfig, WorkerPool};

/// FIFO job queue with exactly-once terminal transitions.
pub struct JobQueue {
    jobs: DashMap<JobId, Job>,
    /// Submission order. Claiming skips entries whose requeue delay has not
    /// elapsed without losing their position.
    pending: Mutex<VecDeque<JobId>>,
    /// Wakes `wait_terminal` callers whenever any job reaches a terminal state.
    terminal_notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            pending: Mutex::new(VecDeque::new()),
            terminal_notify: Notify::new(),
        }
    }

    /// Enqueue a job. Non-blocking; always succeeds.
    pub fn submit(&self, prompt: String, options: PromptOptions, use_cache: bool) -> JobId {
        let id = JobId::new();
        let job = Job {
            id,
            prompt,
            options,
            use_cache,
            status: JobStatus::Queued { not_before: None },
            created_at: Utc::now(),
            requeues: 0,
            cancel_requested: false,
        };
        self.jobs.insert(id, job);
        self.pending.lock().push_back(id);
        tracing::debug!(job_id = %id, "job submitted");
        id
    }

    /// Snapshot of a job by id.
    pub fn get(&self, id: JobId) -> Option<Job> {
        self.jobs.get(&id).map(|job| job.clone())
    }

    /// Snapshot of all jobs, in no particular order.
    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.iter().map(|entry| entry.clone()).collect()
    }

    /// Number of jobs still waiting for a worker.
    pub fn queued_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Claim up to `limit` runnable jobs in submission order, marking each
    /// `running`. Jobs whose `not_before` lies in the future keep their place
    /// in the queue; terminal jobs are dropped from it.
    pub(crate) fn claim(&self, limit: usize) -> Vec<Job> {
        let now = Utc::now();
        let mut pending = self.pending.lock();
        let mut kept = VecDeque::with_capacity(pending.len());
        let mut claimed = Vec::new();

        while let Some(id) = pending.pop_front() {
            if claimed.len() >= limit {
                kept.push_back(id);
                continue;
            }
            let Some(mut job) = self.jobs.get_mut(&id) else {
                continue;
            };
            match &job.status {
                JobStatus::Queued { not_before } => {
                    if not_before.is_some_and(|t| t > now) {
                        kept.push_back(id);
                        continue;
                    }
                    job.status = JobStatus::Running { started_at: now };
                    claimed.push(job.clone());
                }
                // Cancelled while queued, or otherwise already terminal.
                _ => {}
            }
        }

        *pending = kept;
        claimed
    }

    /// Return a claimed job to the head of the queue without a delay.
    /// Used when a worker could not actually take the job.
    pub(crate) fn unclaim(&self, id: JobId) {
        let mut found = false;
        if let Some(mut job) = self.jobs.get_mut(&id) {
            if !job.status.is_terminal() {
                job.status = JobStatus::Queued { not_before: None };
                found = true;
            }
        }
        if found {
            self.pending.lock().push_front(id);
        }
    }

    /// Send a rate-limited job back to the queue with a pickup delay.
    /// Not a terminal transition: rate-limit rejection is not a job failure.
    pub(crate) fn requeue(&self, id: JobId, delay: Duration) {
        let mut found = false;
        if let Some(mut job) = self.jobs.get_mut(&id) {
            if !job.status.is_terminal() {
                job.requeues += 1;
                job.status = JobStatus::Queued {
                    not_before: Some(Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64)),
                };
                found = true;
            }
        }
        if found {
            self.pending.lock().push_back(id);
        }
    }

    /// Record a successful terminal outcome. Ignored if already terminal.
    pub(crate) fn complete(&self, id: JobId, output: String, from_cache: bool) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            if !job.status.is_terminal() {
                job.status = JobStatus::Completed {
                    output,
                    from_cache,
                    completed_at: Utc::now(),
                };
            }
        }
        self.terminal_notify.notify_waiters();
    }

    /// Record a failed terminal outcome. Ignored if already terminal.
    pub(crate) fn fail(&self, id: JobId, reason: FailureReason) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            if !job.status.is_terminal() {
                job.status = JobStatus::Failed {
                    reason,
                    failed_at: Utc::now(),
                };
            }
        }
        self.terminal_notify.notify_waiters();
    }

    /// Whether a cancellation has been requested for this job.
    pub(crate) fn cancel_requested(&self, id: JobId) -> bool {
        self.jobs
            .get(&id)
            .map_or(false, |job| job.cancel_requested)
    }

    /// Cancel a job.
    ///
    /// Queued jobs move straight to `failed: cancelled`. Running jobs are only
    /// flagged: the in-flight tool call may complete before the flag is
    /// observed, and the worker writes the cancelled state afterwards.
    pub fn cancel(&self, id: JobId) -> Result<()> {
        let mut terminal = false;
        {
            let mut job = self.jobs.get_mut(&id).ok_or(Error::NotFound(id))?;
            match &job.status {
                JobStatus::Queued { .. } => {
                    job.status = JobStatus::Failed {
                        reason: FailureReason::Cancelled,
                        failed_at: Utc::now(),
                    };
                    terminal = true;
                }
                JobStatus::Running { .. } => {
                    job.cancel_requested = true;
                }
                // Already terminal; nothing to do.
                _ => {}
            }
        }
        if terminal {
            self.terminal_notify.notify_waiters();
        }
        Ok(())
    }

    /// Wait until the job reaches a terminal state and return it.
    pub async fn wait_terminal(&self, id: JobId) -> Result<Job> {
        loop {
            let mut notified = std::pin::pin!(self.terminal_notify.notified());
            notified.as_mut().enable();

            match self.get(id) {
                None => return Err(Error::NotFound(id)),
                Some(job) if job.status.is_terminal() => return Ok(job),
                Some(_) => {}
            }

            notified.await;
        }
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}
