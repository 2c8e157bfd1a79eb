//! High-level client facade.
//!
//! `Pipeline` is the governed execution path every prompt goes through:
//! admission first, then the cache, then the retrying executor, then the
//! ledger. `PromptClient` wraps the pipeline together with the job queue and
//! background tasks into the one entry point both the HTTP layer and embedders
//! use.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::admission::{Admission, AdmissionController};
use crate::cache::{cache_key, ResponseCache};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::ledger::UsageLedger;
use crate::queue::{JobQueue, WorkerConfig, WorkerPool};
use crate::tool::ToolClient;
use crate::types::{
    BatchOutcome, BatchResult, Job, JobId, JobStatus, PromptOptions, PromptResponse, UsageStats,
};

/// The governed execution path for a single prompt.
///
/// Order matters: admission is checked before the cache, so a caller that is
/// over budget is rejected even when the answer is sitting in the cache. The
/// ledger is written only after the tool actually ran; cache hits and
/// rejections consume no budget.
pub struct Pipeline<T: ToolClient> {
    admission: AdmissionController,
    cache: Arc<dyn ResponseCache>,
    cache_ttl: Duration,
    executor: Executor<T>,
    ledger: Arc<UsageLedger>,
}

impl<T: ToolClient> Pipeline<T> {
    pub fn new(
        admission: AdmissionController,
        cache: Arc<dyn ResponseCache>,
        cache_ttl: Duration,
        executor: Executor<T>,
        ledger: Arc<UsageLedger>,
    ) -> Self {
        Self {
            admission,
            cache,
            cache_ttl,
            executor,
            ledger,
        }
    }

    /// Execute one prompt through admission, cache, executor and ledger.
    #[tracing::instrument(skip_all, fields(use_cache))]
    pub async fn execute(
        &self,
        prompt: &str,
        options: &PromptOptions,
        use_cache: bool,
    ) -> Result<PromptResponse> {
        if prompt.trim().is_empty() {
            return Err(Error::InvalidInput("prompt must not be empty".to_string()));
        }

        match self.admission.try_admit().await? {
            Admission::Admitted => {}
            Admission::Rejected { wait } => return Err(Error::RateLimitExceeded { wait }),
        }

        let key = cache_key(prompt, options);

        if use_cache {
            // A cache failure is a miss, not a request failure.
            match self.cache.get(&key).await {
                Ok(Some(output)) => {
                    tracing::debug!(key = %key, "cache hit");
                    return Ok(PromptResponse {
                        output,
                        from_cache: true,
                        attempts: 0,
                    });
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(error = %error, "cache read failed, treating as miss");
                }
            }
        }

        let (output, attempts) = self.executor.run(prompt, options).await?;

        // The call executed, so it counts against the budget even if the
        // bookkeeping below fails.
        if let Err(error) = self
            .ledger
            .record_call(&key, output.text.len() as i64)
            .await
        {
            tracing::error!(error = %error, "failed to record executed call in ledger");
        }

        if use_cache {
            if let Err(error) = self
                .cache
                .put(&key, output.text.clone(), self.cache_ttl)
                .await
            {
                tracing::warn!(error = %error, "cache write failed, response not cached");
            }
        }

        Ok(PromptResponse {
            output: output.text,
            from_cache: false,
            attempts,
        })
    }

    /// Snapshot of the rate budget.
    pub async fn usage(&self) -> Result<UsageStats> {
        let window = self.ledger.window();
        let count = self.ledger.count_in_window(window).await?;
        let limit = self.admission.limit();
        let reset = self.ledger.time_until_slot_free().await?;

        let day_start = chrono::Utc::now()
            .date_naive()
            .and_time(chrono::NaiveTime::MIN)
            .and_utc();
        let today = self.ledger.count_since(day_start).await?;

        Ok(UsageStats {
            requests_last_hour: count,
            requests_today: today,
            remaining_this_hour: limit.saturating_sub(count),
            max_per_hour: limit,
            reset_in_secs: reset.as_secs_f64().ceil() as u64,
        })
    }
}

/// Entry point for governed prompt execution.
///
/// Owns the pipeline, the job queue, and the configuration for the background
/// tasks. Callers choose between the synchronous path (`prompt`, `batch`) and
/// the asynchronous one (`prompt_async`, `batch_async` plus job inspection).
pub struct PromptClient<T: ToolClient> {
    pipeline: Arc<Pipeline<T>>,
    queue: Arc<JobQueue>,
    ledger: Arc<UsageLedger>,
    cache: Arc<dyn ResponseCache>,
    worker_config: WorkerConfig,
    prune_interval: Duration,
}

impl<T: ToolClient + 'static> PromptClient<T> {
    pub fn new(
        pipeline: Arc<Pipeline<T>>,
        queue: Arc<JobQueue>,
        ledger: Arc<UsageLedger>,
        cache: Arc<dyn ResponseCache>,
        worker_config: WorkerConfig,
        prune_interval: Duration,
    ) -> Self {
        Self {
            pipeline,
            queue,
            ledger,
            cache,
            worker_config,
            prune_interval,
        }
    }

    /// Start the background tasks: the worker pool draining the job queue and
    /// the periodic ledger retention pass.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let pool = Arc::new(WorkerPool::new(
            self.queue.clone(),
            self.pipeline.clone(),
            self.worker_config.clone(),
        ));
        let pool_handle = pool.spawn();

        let ledger = self.ledger.clone();
        let prune_interval = self.prune_interval;
        let prune_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(prune_interval);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match ledger.prune().await {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "pruned expired ledger records"),
                    Err(error) => tracing::warn!(error = %error, "ledger prune failed"),
                }
            }
        });

        vec![pool_handle, prune_handle]
    }

    /// Execute a prompt synchronously through the governed pipeline.
    pub async fn prompt(
        &self,
        prompt: &str,
        options: &PromptOptions,
        use_cache: bool,
    ) -> Result<PromptResponse> {
        self.pipeline.execute(prompt, options, use_cache).await
    }

    /// Enqueue a prompt for background execution. Never blocks or rejects.
    pub fn prompt_async(&self, prompt: String, options: PromptOptions, use_cache: bool) -> JobId {
        self.queue.submit(prompt, options, use_cache)
    }

    /// Look up a job by id.
    pub fn job_status(&self, id: JobId) -> Result<Job> {
        self.queue.get(id).ok_or(Error::NotFound(id))
    }

    /// Snapshot of all known jobs.
    pub fn jobs(&self) -> Vec<Job> {
        self.queue.jobs()
    }

    /// Cancel a job. Queued jobs fail immediately; running jobs are flagged
    /// and fail once the in-flight attempt returns.
    pub fn cancel(&self, id: JobId) -> Result<()> {
        self.queue.cancel(id)
    }

    /// Enqueue a batch of prompts, one job per prompt, in order.
    pub fn batch_async(
        &self,
        prompts: Vec<(String, PromptOptions)>,
        use_cache: bool,
    ) -> Vec<JobId> {
        prompts
            .into_iter()
            .map(|(prompt, options)| self.queue.submit(prompt, options, use_cache))
            .collect()
    }

    /// Enqueue a batch and wait for every job to finish.
    ///
    /// Outcomes are position-aligned with the input; one prompt failing does
    /// not abort the rest of the batch.
    pub async fn batch(
        &self,
        prompts: Vec<(String, PromptOptions)>,
        use_cache: bool,
    ) -> Result<BatchResult> {
        let ids = self.batch_async(prompts, use_cache);

        let jobs = futures::future::try_join_all(
            ids.iter().map(|&id| self.queue.wait_terminal(id)),
        )
        .await?;

        Ok(jobs
            .into_iter()
            .map(|job| match job.status {
                JobStatus::Completed {
                    output, from_cache, ..
                } => BatchOutcome::Success { output, from_cache },
                JobStatus::Failed { reason, .. } => BatchOutcome::Failure { reason },
                // wait_terminal only returns terminal jobs.
                JobStatus::Queued { .. } | JobStatus::Running { .. } => unreachable!(),
            })
            .collect())
    }

    /// Current rate budget.
    pub async fn usage(&self) -> Result<UsageStats> {
        self.pipeline.usage().await
    }

    /// Wipe the response cache. Operator action.
    pub async fn clear_cache(&self) -> Result<()> {
        self.cache.clear().await
    }
}
