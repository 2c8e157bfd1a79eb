//! Worker pool that drains the job queue.
//!
//! A bounded set of concurrent workers claims jobs in FIFO order and runs each
//! through the shared execution pipeline. Rate-limit rejections requeue the
//! job with the computed wait; everything else ends in a terminal state,
//! written exactly once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};

use crate::client::Pipeline;
use crate::error::Error;
use crate::queue::JobQueue;
use crate::tool::ToolClient;
use crate::types::{FailureReason, Job};

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum number of jobs executing concurrently.
    pub workers: usize,

    /// Maximum number of jobs to claim in each drain iteration.
    pub claim_batch_size: usize,

    /// How long to sleep when the queue has nothing runnable.
    pub claim_interval: Duration,

    /// How many admission requeues a job may accumulate before it fails
    /// terminally with a rate-limited reason.
    pub max_admission_requeues: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            claim_batch_size: 16,
            claim_interval: Duration::from_millis(500),
            max_admission_requeues: 10,
        }
    }
}

/// Drains the job queue against the shared pipeline.
pub struct WorkerPool<T: ToolClient> {
    queue: Arc<JobQueue>,
    pipeline: Arc<Pipeline<T>>,
    config: WorkerConfig,
    permits: Arc<Semaphore>,
    jobs_in_flight: Arc<AtomicUsize>,
}

impl<T: ToolClient + 'static> WorkerPool<T> {
    pub fn new(queue: Arc<JobQueue>, pipeline: Arc<Pipeline<T>>, config: WorkerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.workers));
        Self {
            queue,
            pipeline,
            config,
            permits,
            jobs_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of jobs currently executing.
    pub fn in_flight(&self) -> usize {
        self.jobs_in_flight.load(Ordering::Relaxed)
    }

    /// Spawn the drain loop onto the runtime.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run the drain loop.
    ///
    /// Continuously claims runnable jobs and executes them on a bounded set of
    /// concurrent tasks until the task is cancelled.
    #[tracing::instrument(skip(self), fields(workers = self.config.workers))]
    pub async fn run(self: Arc<Self>) {
        tracing::info!("worker pool starting drain loop");

        let mut join_set: JoinSet<()> = JoinSet::new();

        loop {
            // Reap finished tasks (non-blocking).
            while let Some(result) = join_set.try_join_next() {
                if let Err(join_error) = result {
                    tracing::error!(error = %join_error, "worker task panicked");
                }
            }

            // Only claim what can run right now; delayed jobs keep their
            // queue position until their pickup time.
            let capacity = self.permits.available_permits();
            if capacity == 0 {
                tokio::time::sleep(self.config.claim_interval).await;
                continue;
            }

            let claimed = self
                .queue
                .claim(capacity.min(self.config.claim_batch_size));
            if claimed.is_empty() {
                tokio::time::sleep(self.config.claim_interval).await;
                continue;
            }

            tracing::debug!(claimed = claimed.len(), "claimed jobs from queue");

            for job in claimed {
                let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                    // The claim was sized to available permits, so this only
                    // races with a shrinking pool. Give the job back.
                    self.queue.unclaim(job.id);
                    continue;
                };

                let queue = self.queue.clone();
                let pipeline = self.pipeline.clone();
                let max_requeues = self.config.max_admission_requeues;
                let jobs_in_flight = self.jobs_in_flight.clone();
                jobs_in_flight.fetch_add(1, Ordering::Relaxed);

                join_set.spawn(async move {
                    // Permit is held for the duration of this task.
                    let _permit = permit;
                    let _guard = scopeguard::guard((), move |_| {
                        jobs_in_flight.fetch_sub(1, Ordering::Relaxed);
                    });

                    Self::process(queue, pipeline, job, max_requeues).await;
                });
            }
        }
    }

    /// Run one claimed job through the pipeline and record the outcome.
    async fn process(
        queue: Arc<JobQueue>,
        pipeline: Arc<Pipeline<T>>,
        job: Job,
        max_requeues: u32,
    ) {
        tracing::info!(job_id = %job.id, "processing job");

        let result = pipeline
            .execute(&job.prompt, &job.options, job.use_cache)
            .await;

        // A cancellation requested while the job was in flight wins over
        // whatever the pipeline produced.
        if queue.cancel_requested(job.id) {
            tracing::info!(job_id = %job.id, "cancellation observed after in-flight attempt");
            queue.fail(job.id, FailureReason::Cancelled);
            return;
        }

        match result {
            Ok(response) => {
                tracing::info!(job_id = %job.id, from_cache = response.from_cache, "job completed");
                queue.complete(job.id, response.output, response.from_cache);
            }
            Err(Error::RateLimitExceeded { wait }) => {
                if job.requeues >= max_requeues {
                    tracing::warn!(
                        job_id = %job.id,
                        requeues = job.requeues,
                        "admission requeue budget exhausted"
                    );
                    queue.fail(
                        job.id,
                        FailureReason::RateLimited {
                            requeues: job.requeues,
                        },
                    );
                } else {
                    tracing::debug!(
                        job_id = %job.id,
                        wait_s = wait.as_secs(),
                        "rate limited, requeueing with delay"
                    );
                    queue.requeue(job.id, wait);
                }
            }
            Err(error) => {
                tracing::warn!(job_id = %job.id, error = %error, "job failed");
                queue.fail(
                    job.id,
                    FailureReason::Execution {
                        error: error.to_string(),
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::cache::MemoryCache;
    use crate::client::Pipeline;
    use crate::executor::{Executor, RetryPolicy};
    use crate::ledger::UsageLedger;
    use crate::tool::{MockToolClient, ToolError};
    use crate::types::{JobStatus, PromptOptions};

    async fn test_pipeline(
        mock: MockToolClient,
        limit: u64,
    ) -> (Arc<Pipeline<MockToolClient>>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = Arc::new(
            UsageLedger::open(&dir.path().join("ledger.db"), Duration::from_secs(3600))
                .await
                .expect("open ledger"),
        );
        let pipeline = Pipeline::new(
            AdmissionController::new(ledger.clone(), limit),
            Arc::new(MemoryCache::new()),
            Duration::from_secs(3600),
            Executor::new(
                mock,
                RetryPolicy {
                    max_retries: 1,
                    backoff: Duration::from_millis(5),
                    backoff_factor: 2,
                    max_backoff: Duration::from_millis(20),
                },
                Duration::from_secs(1),
            ),
            ledger,
        );
        (Arc::new(pipeline), dir)
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            workers: 2,
            claim_batch_size: 8,
            claim_interval: Duration::from_millis(10),
            max_admission_requeues: 0,
        }
    }

    async fn wait_for_terminal(queue: &Arc<JobQueue>, id: crate::types::JobId) -> JobStatus {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(job) = queue.get(id) {
                if job.status.is_terminal() {
                    return job.status;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job did not reach a terminal state in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn pool_completes_submitted_jobs() {
        let mock = MockToolClient::new();
        mock.add_success("hello", "world");

        let (pipeline, _dir) = test_pipeline(mock, 100).await;
        let queue = Arc::new(JobQueue::new());
        let pool = Arc::new(WorkerPool::new(queue.clone(), pipeline, fast_config()));
        let handle = pool.spawn();

        let id = queue.submit("hello".to_string(), PromptOptions::default(), false);

        match wait_for_terminal(&queue, id).await {
            JobStatus::Completed { output, .. } => assert_eq!(output, "world"),
            other => panic!("expected completion, got {other:?}"),
        }

        handle.abort();
    }

    #[tokio::test]
    async fn failed_jobs_carry_execution_reason() {
        let mock = MockToolClient::new();
        mock.add_response("boom", Err(ToolError::InvalidInput("bad prompt".to_string())));

        let (pipeline, _dir) = test_pipeline(mock, 100).await;
        let queue = Arc::new(JobQueue::new());
        let pool = Arc::new(WorkerPool::new(queue.clone(), pipeline, fast_config()));
        let handle = pool.spawn();

        let id = queue.submit("boom".to_string(), PromptOptions::default(), false);

        match wait_for_terminal(&queue, id).await {
            JobStatus::Failed {
                reason: FailureReason::Execution { error },
                ..
            } => assert!(error.contains("bad prompt"), "got: {error}"),
            other => panic!("expected execution failure, got {other:?}"),
        }

        handle.abort();
    }

    #[tokio::test]
    async fn requeue_budget_exhaustion_fails_with_rate_limited_reason() {
        // Limit of zero: admission always rejects; with zero allowed requeues
        // the job fails terminally with the rate-limited reason.
        let (pipeline, _dir) = test_pipeline(MockToolClient::new(), 0).await;
        let queue = Arc::new(JobQueue::new());
        let pool = Arc::new(WorkerPool::new(queue.clone(), pipeline, fast_config()));
        let handle = pool.spawn();

        let id = queue.submit("starved".to_string(), PromptOptions::default(), false);

        match wait_for_terminal(&queue, id).await {
            JobStatus::Failed {
                reason: FailureReason::RateLimited { .. },
                ..
            } => {}
            other => panic!("expected rate-limited failure, got {other:?}"),
        }

        handle.abort();
    }

    /// Tool client whose every invocation succeeds after a fixed delay,
    /// leaving a window in which the job is observably `running`.
    #[derive(Clone)]
    struct SlowToolClient {
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl crate::tool::ToolClient for SlowToolClient {
        async fn invoke(
            &self,
            _prompt: &str,
            _options: &PromptOptions,
            _timeout: Duration,
        ) -> std::result::Result<crate::tool::ToolOutput, ToolError> {
            tokio::time::sleep(self.delay).await;
            Ok(crate::tool::ToolOutput {
                text: "slow output".to_string(),
                exit_code: 0,
            })
        }
    }

    #[tokio::test]
    async fn cancel_while_running_wins_over_a_successful_attempt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = Arc::new(
            UsageLedger::open(&dir.path().join("ledger.db"), Duration::from_secs(3600))
                .await
                .expect("open ledger"),
        );
        let pipeline = Arc::new(Pipeline::new(
            AdmissionController::new(ledger.clone(), 100),
            Arc::new(MemoryCache::new()),
            Duration::from_secs(3600),
            Executor::new(
                SlowToolClient {
                    delay: Duration::from_millis(200),
                },
                RetryPolicy::default(),
                Duration::from_secs(5),
            ),
            ledger,
        ));
        let queue = Arc::new(JobQueue::new());
        let pool = Arc::new(WorkerPool::new(queue.clone(), pipeline, fast_config()));
        let handle = pool.spawn();

        let id = queue.submit("slow".to_string(), PromptOptions::default(), false);

        // Wait for a worker to pick the job up.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let job = queue.get(id).expect("job exists");
            if matches!(job.status, JobStatus::Running { .. }) {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job never started running"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Cancel mid-flight: only the flag is set, the attempt keeps going.
        queue.cancel(id).unwrap();
        assert!(!queue.get(id).unwrap().status.is_terminal());

        // The attempt completes successfully, but the cancellation wins.
        match wait_for_terminal(&queue, id).await {
            JobStatus::Failed {
                reason: FailureReason::Cancelled,
                ..
            } => {}
            other => panic!("expected cancelled, got {other:?}"),
        }

        handle.abort();
    }

    #[tokio::test]
    async fn rate_limited_job_is_requeued_not_failed() {
        let (pipeline, _dir) = test_pipeline(MockToolClient::new(), 0).await;
        let queue = Arc::new(JobQueue::new());
        let config = WorkerConfig {
            max_admission_requeues: 100,
            ..fast_config()
        };
        let pool = Arc::new(WorkerPool::new(queue.clone(), pipeline, config));
        let handle = pool.spawn();

        let id = queue.submit("patient".to_string(), PromptOptions::default(), false);

        // Give the pool time to claim and bounce the job at least once.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let job = queue.get(id).expect("job exists");
            assert!(!job.status.is_terminal(), "job must not fail terminally");
            if job.requeues > 0 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job was never requeued"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.abort();
    }
}
