//! Download scheduler
//!
//! Runs a fixed pool of `max_threads` workers. Each worker claims the next
//! unclaimed segment in manifest order, fetches and decrypts it, then hands the
//! plaintext to the assembler task over a bounded channel. Since a worker holds
//! at most one segment at a time, at most `max_threads` fetches are in flight.
//!
//! Claims are gated by a window of `max_threads * queue_per_worker` permits that
//! the assembler returns as slots settle, so workers never run further than the
//! window ahead of the write position and the reorder buffer stays bounded.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::assembler::{run_assembler, Assembler, CompletedSegment, SegmentOutcome};
use super::error_handling::{AppResult, DownloadError};
use super::fetcher::SegmentFetcher;
use super::key_resolver::{decrypt, KeyResolver};
use super::models::{
    DownloadConfig, FailedSegment, FailurePolicy, JobResult, JobState, SegmentState,
};
use super::progress_tracker::ProgressState;
use crate::parsers::SegmentRef;

/// State shared by the workers of one run
struct RunShared {
    segments: Arc<[SegmentRef]>,
    cursor: AtomicUsize,
    failures: Mutex<Vec<FailedSegment>>,
    /// Slots a worker may claim beyond the assembler's write position
    window: Arc<Semaphore>,
    /// First error that ends the job under fail-fast
    fatal: Mutex<Option<DownloadError>>,
    /// Stops the pool; child of the caller's token
    halt: CancellationToken,
}

impl RunShared {
    fn set_fatal(&self, error: DownloadError) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(error);
        }
        self.halt.cancel();
    }
}

pub struct DownloadScheduler {
    config: Arc<DownloadConfig>,
    fetcher: Arc<SegmentFetcher>,
    resolver: Arc<KeyResolver>,
    progress: Arc<ProgressState>,
    queue_per_worker: usize,
}

impl DownloadScheduler {
    pub fn new(
        config: Arc<DownloadConfig>,
        fetcher: Arc<SegmentFetcher>,
        resolver: Arc<KeyResolver>,
        progress: Arc<ProgressState>,
        queue_per_worker: usize,
    ) -> Self {
        Self {
            config,
            fetcher,
            resolver,
            progress,
            queue_per_worker: queue_per_worker.max(1),
        }
    }

    /// Download, decrypt and assemble `segments` in order.
    ///
    /// `cancel` is the job's cancellation token; cancelling it stops new fetches,
    /// aborts in-flight ones and returns [`JobResult::Cancelled`].
    #[instrument(skip_all, fields(segments = segments.len(), output = %self.config.output_filename))]
    pub async fn run(&self, segments: Vec<SegmentRef>, cancel: CancellationToken) -> JobResult {
        let total = segments.len();
        self.progress.set_total(total);
        self.progress.set_state(JobState::Running);

        let assembler =
            match Assembler::create(self.config.output_path(), total, self.progress.clone()).await
            {
                Ok(assembler) => assembler,
                Err(err) => {
                    error!("Cannot open output: {}", err);
                    return JobResult::Failure {
                        reason: err,
                        partial_path: None,
                    };
                }
            };

        let workers = self.config.effective_threads().min(total.max(1));
        info!(
            "Starting {} workers for {} segments ({:?})",
            workers, total, self.config.failure_policy
        );

        let window = workers * self.queue_per_worker;
        let shared = Arc::new(RunShared {
            segments: segments.into(),
            cursor: AtomicUsize::new(0),
            failures: Mutex::new(Vec::new()),
            window: Arc::new(Semaphore::new(window)),
            fatal: Mutex::new(None),
            halt: cancel.child_token(),
        });

        let (tx, rx) = mpsc::channel(window);
        let assembler_task = tokio::spawn(run_assembler(assembler, rx, shared.window.clone()));

        let mut pool = JoinSet::new();
        for worker_id in 0..workers {
            let worker = Worker {
                id: worker_id,
                shared: shared.clone(),
                fetcher: self.fetcher.clone(),
                resolver: self.resolver.clone(),
                progress: self.progress.clone(),
                policy: self.config.failure_policy,
                tx: tx.clone(),
            };
            pool.spawn(worker.run());
        }
        drop(tx);

        while let Some(joined) = pool.join_next().await {
            if let Err(err) = joined {
                shared.set_fatal(DownloadError::config(format!("worker aborted: {err}")));
            }
        }

        let (assembler, written) = match assembler_task.await {
            Ok(pair) => pair,
            Err(err) => {
                return JobResult::Failure {
                    reason: DownloadError::config(format!("assembler task aborted: {err}")),
                    partial_path: None,
                }
            }
        };

        self.finish(assembler, written, &shared, &cancel).await
    }

    async fn finish(
        &self,
        assembler: Assembler,
        written: AppResult<()>,
        shared: &RunShared,
        cancel: &CancellationToken,
    ) -> JobResult {
        if let Err(err) = written {
            error!("Output write failed: {}", err);
            let partial = assembler.abandon().await;
            return JobResult::Failure {
                reason: err,
                partial_path: Some(partial),
            };
        }

        let fatal = shared.fatal.lock().take();
        if let Some(err) = fatal {
            error!("Job failed: {}", err);
            let partial = assembler.abandon().await;
            return JobResult::Failure {
                reason: err,
                partial_path: Some(partial),
            };
        }

        if !assembler.is_complete() {
            if !cancel.is_cancelled() {
                warn!("Workers stopped before every segment was settled");
            }
            let segments_written = assembler.segments_written();
            let partial = assembler.abandon().await;
            return JobResult::Cancelled {
                partial_path: Some(partial),
                segments_written,
            };
        }

        let mut failed_segments = std::mem::take(&mut *shared.failures.lock());
        failed_segments.sort_by_key(|f| f.index);

        match assembler.commit().await {
            Ok(output_path) if failed_segments.is_empty() => JobResult::Success { output_path },
            Ok(output_path) => {
                warn!(
                    "Completed with {} failed segments",
                    failed_segments.len()
                );
                JobResult::PartialSuccess {
                    output_path,
                    failed_segments,
                }
            }
            Err(err) => JobResult::Failure {
                reason: err,
                partial_path: None,
            },
        }
    }
}

struct Worker {
    id: usize,
    shared: Arc<RunShared>,
    fetcher: Arc<SegmentFetcher>,
    resolver: Arc<KeyResolver>,
    progress: Arc<ProgressState>,
    policy: FailurePolicy,
    tx: mpsc::Sender<CompletedSegment>,
}

impl Worker {
    async fn run(self) {
        loop {
            let permit = tokio::select! {
                biased;
                _ = self.shared.halt.cancelled() => break,
                permit = self.shared.window.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let position = self.shared.cursor.fetch_add(1, Ordering::SeqCst);
            let Some(segment) = self.shared.segments.get(position) else {
                break;
            };
            // returned by the assembler once this slot settles
            permit.forget();

            let outcome = match self.process(position, segment).await {
                Ok(data) => {
                    self.progress.mark(position, SegmentState::Ready);
                    SegmentOutcome::Ready(data)
                }
                Err(DownloadError::Cancelled) => {
                    self.progress.mark(position, SegmentState::Pending);
                    break;
                }
                Err(err) => {
                    warn!(
                        "Segment #{} ({}) failed: {}",
                        segment.index, segment.uri, err
                    );
                    let failure = FailedSegment {
                        index: segment.index,
                        sequence: segment.sequence,
                        uri: segment.uri.clone(),
                        error: err.clone(),
                    };
                    self.progress.record_failed(position, &failure);
                    match self.policy {
                        FailurePolicy::FailFast => {
                            self.shared.set_fatal(err);
                            break;
                        }
                        FailurePolicy::BestEffort => {
                            self.shared.failures.lock().push(failure);
                            SegmentOutcome::Skipped
                        }
                    }
                }
            };

            let completed = CompletedSegment { position, outcome };
            if self.tx.send(completed).await.is_err() {
                // assembler stopped after a write error
                self.shared.halt.cancel();
                break;
            }
        }
        debug!("Worker {} exiting", self.id);
    }

    async fn process(&self, position: usize, segment: &SegmentRef) -> AppResult<Bytes> {
        let halt = &self.shared.halt;

        self.progress.mark(position, SegmentState::Fetching);
        let data = self.fetcher.fetch(segment, halt).await?;

        let Some(material) = self.resolver.resolve(segment, halt).await? else {
            return Ok(data);
        };

        self.progress.mark(position, SegmentState::Decrypting);
        let plaintext = tokio::task::spawn_blocking(move || decrypt(&data, &material))
            .await
            .map_err(|e| DownloadError::decryption(format!("decrypt task failed: {e}")))??;
        Ok(Bytes::from(plaintext))
    }
}
