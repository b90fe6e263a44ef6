//! # PlatformWorker
//!
//! One worker process drains one queue prefix, one task at a time. Each
//! pass: tail-pop a task id, take the TTL'd task lock, process under the
//! lock, always release. Scaling is horizontal — any number of processes
//! can run this loop against the same prefix because the lock guarantees a
//! task is held by at most one of them, and a crashed holder is recovered
//! by lock expiry.

use std::time;

use tracing::{error, info, warn};

use tagger_common::health::HealthHandle;
use tagger_common::queue::TaskQueue;
use tagger_common::store::TaskStore;
use tagger_common::task::{TagReport, TaskDetail, TaskStatus};

use crate::download::Downloader;
use crate::error::{JobError, WorkerError};
use crate::index::IndexClient;
use crate::limiter::RateLimiter;
use crate::provider::ModelProvider;

pub struct PlatformWorker {
    /// An identifier for this worker, used in logs.
    name: String,
    queue: TaskQueue,
    store: TaskStore,
    downloader: Downloader,
    provider: ModelProvider,
    limiter: Option<RateLimiter>,
    index: Option<IndexClient>,
    poll_interval: time::Duration,
    lock_timeout: time::Duration,
    max_retries: u32,
    tokens_per_generate: u64,
    /// The liveness check handle, reported on every loop pass.
    liveness: HealthHandle,
}

impl PlatformWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        queue: TaskQueue,
        store: TaskStore,
        downloader: Downloader,
        provider: ModelProvider,
        limiter: Option<RateLimiter>,
        index: Option<IndexClient>,
        poll_interval: time::Duration,
        lock_timeout: time::Duration,
        max_retries: u32,
        tokens_per_generate: u64,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            store,
            downloader,
            provider,
            limiter,
            index,
            poll_interval,
            lock_timeout,
            max_retries,
            tokens_per_generate,
            liveness,
        }
    }

    /// Run this worker forever. Nothing escapes the loop: a failing pass is
    /// logged and the loop continues after a short sleep.
    pub async fn run(&self) {
        info!(
            worker = %self.name,
            queue = self.queue.prefix(),
            "starting tagging worker"
        );
        loop {
            match self.step().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.poll_interval).await,
                Err(err) => {
                    error!("worker pass failed: {}", err);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// One pass: dequeue, lock, process, release. Returns whether a task
    /// was dequeued, so the caller knows when to back off.
    async fn step(&self) -> Result<bool, WorkerError> {
        self.liveness.report_healthy().await;

        let Some(task_id) = self.queue.pop_task().await? else {
            return Ok(false);
        };

        let labels = [("queue", self.queue.prefix().to_owned())];
        metrics::counter!("tagger_jobs_dequeued_total", &labels).increment(1);

        if !self.queue.acquire_lock(&task_id, self.lock_timeout).await? {
            // Another worker already owns it; the owner (or lock expiry)
            // is responsible for any requeue, so just move on.
            warn!(task_id, "task is being processed elsewhere");
            return Ok(true);
        }

        let outcome = self.process_task(&task_id).await;

        // The lock is released on every path out of process_task.
        if let Err(err) = self.queue.release_lock(&task_id).await {
            error!(task_id, "failed to release task lock: {}", err);
        }

        outcome?;
        Ok(true)
    }

    async fn process_task(&self, task_id: &str) -> Result<(), WorkerError> {
        let Some(detail) = self.queue.read_detail(task_id).await? else {
            error!(task_id, "task has no detail record, skipping");
            return Ok(());
        };

        info!(task_id, url = %detail.url, "processing task");
        let started = tokio::time::Instant::now();

        match self.attempt(task_id, &detail).await {
            Ok(status) => {
                let labels = [("queue", self.queue.prefix().to_owned())];
                metrics::histogram!("tagger_jobs_processing_duration_seconds", &labels)
                    .record(started.elapsed().as_secs_f64());
                match status {
                    TaskStatus::Completed => {
                        metrics::counter!("tagger_jobs_completed_total", &labels).increment(1)
                    }
                    _ => metrics::counter!("tagger_jobs_failed_total", &labels).increment(1),
                }
                info!(task_id, status = %status, "task finished");
                Ok(())
            }
            Err(job_error) => self.handle_job_failure(task_id, &job_error).await,
        }
    }

    /// One full attempt at the job: mark processing, download, fan out,
    /// persist, clean up. Any error out of here is a whole-job failure.
    async fn attempt(&self, task_id: &str, detail: &TaskDetail) -> Result<TaskStatus, JobError> {
        self.queue
            .update_status(task_id, TaskStatus::Processing, None)
            .await?;
        self.store.mark_processing(task_id).await?;

        let video_path = self.downloader.fetch(&detail.url, task_id).await?;

        let tagged = self.tag_video(task_id, detail, &video_path).await;

        // The local file never outlives the attempt.
        self.downloader.cleanup(&video_path).await;

        let report = tagged?;
        let status = report.final_status();

        if let Some(index) = &self.index {
            if !detail.material_ids.is_empty() {
                match index.submit(&detail.material_ids, &report.tags_value()).await {
                    Ok(()) => info!(task_id, "tags forwarded to the index service"),
                    Err(err) => warn!(task_id, "index submission failed: {}", err),
                }
            }
        }

        self.queue.delete_detail(task_id).await?;
        Ok(status)
    }

    /// Upload once, generate per dimension in the configured order, delete
    /// the remote file, persist the bundle. Per-dimension failures are
    /// isolated into the report; only upload and persist abort the job.
    async fn tag_video(
        &self,
        task_id: &str,
        detail: &TaskDetail,
        video_path: &std::path::Path,
    ) -> Result<TagReport, JobError> {
        let file = self
            .provider
            .upload(video_path)
            .await
            .map_err(JobError::Upload)?;

        let mut report = TagReport::default();
        for dimension in detail.dimensions.dimensions() {
            if let Some(limiter) = &self.limiter {
                if let Err(err) = limiter.acquire(self.tokens_per_generate).await {
                    warn!(task_id, %dimension, "rate limiter unavailable: {}", err);
                }
            }

            let generation_started = tokio::time::Instant::now();
            match self.provider.generate(&file, dimension).await {
                Ok(body) => match serde_json::from_str::<serde_json::Value>(body.trim()) {
                    Ok(tags) => {
                        info!(
                            task_id,
                            %dimension,
                            elapsed = generation_started.elapsed().as_secs_f64(),
                            "dimension tagged"
                        );
                        report.record_success(dimension, tags);
                    }
                    Err(err) => {
                        warn!(task_id, %dimension, "model response was not valid JSON: {}", err);
                        report
                            .record_failure(dimension, &format!("response was not valid JSON: {}", err));
                    }
                },
                Err(err) => {
                    warn!(task_id, %dimension, "dimension generation failed: {}", err);
                    report.record_failure(dimension, &err.to_string());
                }
            }
        }

        if let Err(err) = self.provider.delete(&file).await {
            warn!(task_id, "failed to delete remote file {}: {}", file.name, err);
        }

        let status = report.final_status();
        self.store
            .finalize(
                task_id,
                status,
                &report.tags_value(),
                &report.message_value(),
            )
            .await?;
        self.queue.update_status(task_id, status, None).await?;

        Ok(report)
    }

    /// Requeue-or-park decision for a whole-job failure. The retry counter
    /// lives on the detail hash; per-dimension failures never reach here.
    async fn handle_job_failure(
        &self,
        task_id: &str,
        error: &JobError,
    ) -> Result<(), WorkerError> {
        let labels = [("queue", self.queue.prefix().to_owned())];
        let retry_count = self.queue.increment_retry(task_id).await?;

        if retry_count >= self.max_retries {
            self.queue.push_failed(task_id).await?;
            let report = TagReport::whole_job_failure(&error.to_string());
            self.store
                .mark_failed(task_id, &report.message_value())
                .await?;
            self.queue
                .update_status(task_id, TaskStatus::Failed, Some(&error.to_string()))
                .await?;
            metrics::counter!("tagger_jobs_exhausted_total", &labels).increment(1);
            error!(
                task_id,
                retry_count, "task exhausted its retry budget, moved to the failed queue: {}", error
            );
        } else {
            self.queue.requeue(task_id).await?;
            metrics::counter!("tagger_jobs_requeued_total", &labels).increment(1);
            warn!(
                task_id,
                retry_count,
                max_retries = self.max_retries,
                "task failed, requeued: {}",
                error
            );
        }
        Ok(())
    }
}
