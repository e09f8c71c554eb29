//! Download Manager - job control surface
//!
//! Starts jobs on the tokio runtime, keeps a registry of them by id and exposes
//! cancellation, progress subscription and final results. Each job loads its
//! playlist (remote or local, following one multivariant level), selects the
//! segments inside the requested time range and hands them to the scheduler.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use url::Url;
use uuid::Uuid;

use super::assembler::select_segments;
use super::config::AppConfig;
use super::error_handling::{AppResult, DownloadError};
use super::fetcher::{HttpTransport, ReqwestTransport, SegmentFetcher};
use super::key_resolver::KeyResolver;
use super::models::{DownloadConfig, JobResult, JobState, PlaylistSource};
use super::progress_tracker::{ProgressSnapshot, ProgressState};
use super::scheduler::DownloadScheduler;
use crate::parsers::{parse_media_playlist, parse_playlist, select_variant, Manifest, Playlist};
use crate::utils::network::build_client;

/// Handle returned by [`DownloadManager::start`]
pub struct JobHandle {
    id: Uuid,
    cancel: CancellationToken,
    progress: watch::Receiver<ProgressSnapshot>,
    task: JoinHandle<JobResult>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Request cancellation; in-flight fetches are aborted
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn progress(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress.clone()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.progress.borrow().clone()
    }

    /// Invoke `callback` with the current snapshot and every published update
    pub fn subscribe<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(ProgressSnapshot) + Send + 'static,
    {
        forward_progress(self.progress.clone(), callback)
    }

    /// Wait for the job to reach a terminal state
    pub async fn wait(self) -> JobResult {
        match self.task.await {
            Ok(result) => result,
            Err(err) => {
                error!("Job {} task aborted: {}", self.id, err);
                JobResult::Failure {
                    reason: DownloadError::config(format!("job task aborted: {err}")),
                    partial_path: None,
                }
            }
        }
    }
}

struct JobEntry {
    cancel: CancellationToken,
    progress: watch::Receiver<ProgressSnapshot>,
    result: Arc<Mutex<Option<JobResult>>>,
    started_at: DateTime<Utc>,
}

/// Brief view of a registered job
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: Uuid,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub progress: ProgressSnapshot,
}

/// Owns the job registry; cheap to clone
#[derive(Clone)]
pub struct DownloadManager {
    settings: Arc<AppConfig>,
    /// Fixed transport; when unset a reqwest client is built per job
    transport: Option<Arc<dyn HttpTransport>>,
    jobs: Arc<DashMap<Uuid, JobEntry>>,
}

impl DownloadManager {
    pub fn new(settings: AppConfig) -> Self {
        Self {
            settings: Arc::new(settings),
            transport: None,
            jobs: Arc::new(DashMap::new()),
        }
    }

    /// Manager whose jobs all go through `transport`
    pub fn with_transport(settings: AppConfig, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport: Some(transport),
            ..Self::new(settings)
        }
    }

    pub fn settings(&self) -> &AppConfig {
        &self.settings
    }

    /// Validate `config` and start the job in the background
    #[instrument(skip_all, fields(source = %config.source.describe()))]
    pub fn start(&self, config: DownloadConfig) -> AppResult<JobHandle> {
        config.validate()?;
        let transport = self.transport_for(&config)?;

        let id = Uuid::new_v4();
        let progress = Arc::new(ProgressState::new(
            id,
            self.settings.engine.progress_interval(),
        ));
        let rx = progress.subscribe();
        let cancel = CancellationToken::new();
        let result_slot = Arc::new(Mutex::new(None));

        self.jobs.insert(
            id,
            JobEntry {
                cancel: cancel.clone(),
                progress: rx.clone(),
                result: result_slot.clone(),
                started_at: Utc::now(),
            },
        );

        info!(
            "Starting job {} -> {:?}",
            id,
            config.output_path()
        );

        let job = Job {
            settings: self.settings.clone(),
            transport,
            config: Arc::new(config),
            progress,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(
            async move {
                let result = job.run().await;
                job.progress.set_state(result.job_state());
                *result_slot.lock() = Some(result.clone());
                result
            }
            .instrument(info_span!("job", %id)),
        );

        Ok(JobHandle {
            id,
            cancel,
            progress: rx,
            task,
        })
    }

    /// Cancel a running job; false when the id is unknown
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.jobs.get(&job_id) {
            Some(entry) => {
                info!("Cancelling job {}", job_id);
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn subscribe<F>(&self, job_id: Uuid, callback: F) -> Option<JoinHandle<()>>
    where
        F: Fn(ProgressSnapshot) + Send + 'static,
    {
        let rx = self.jobs.get(&job_id)?.progress.clone();
        Some(forward_progress(rx, callback))
    }

    pub fn snapshot(&self, job_id: Uuid) -> Option<ProgressSnapshot> {
        self.jobs
            .get(&job_id)
            .map(|entry| entry.progress.borrow().clone())
    }

    /// Final result, once the job has finished
    pub fn result(&self, job_id: Uuid) -> Option<JobResult> {
        self.jobs.get(&job_id)?.result.lock().clone()
    }

    pub fn list(&self) -> Vec<JobSummary> {
        let mut jobs: Vec<JobSummary> = self
            .jobs
            .iter()
            .map(|entry| {
                let progress = entry.progress.borrow().clone();
                JobSummary {
                    job_id: *entry.key(),
                    state: progress.state,
                    started_at: entry.started_at,
                    progress,
                }
            })
            .collect();
        jobs.sort_by_key(|job| job.started_at);
        jobs
    }

    /// Drop finished jobs from the registry
    pub fn clear_finished(&self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, entry| entry.result.lock().is_none());
        before - self.jobs.len()
    }

    fn transport_for(&self, config: &DownloadConfig) -> AppResult<Arc<dyn HttpTransport>> {
        if let Some(transport) = &self.transport {
            return Ok(transport.clone());
        }
        let client = build_client(&self.settings.network, &config.headers, config.proxy.as_ref())?;
        Ok(Arc::new(ReqwestTransport::new(client)))
    }
}

fn forward_progress<F>(mut rx: watch::Receiver<ProgressSnapshot>, callback: F) -> JoinHandle<()>
where
    F: Fn(ProgressSnapshot) + Send + 'static,
{
    tokio::spawn(async move {
        let current = rx.borrow_and_update().clone();
        let mut finished = current.state.is_terminal();
        callback(current);

        while !finished && rx.changed().await.is_ok() {
            let snapshot = rx.borrow_and_update().clone();
            finished = snapshot.state.is_terminal();
            callback(snapshot);
        }
    })
}

/// Everything one job needs, moved into its task
struct Job {
    settings: Arc<AppConfig>,
    transport: Arc<dyn HttpTransport>,
    config: Arc<DownloadConfig>,
    progress: Arc<ProgressState>,
    cancel: CancellationToken,
}

impl Job {
    async fn run(&self) -> JobResult {
        let fetcher = Arc::new(SegmentFetcher::new(
            self.transport.clone(),
            self.settings.retry.policy(self.config.retry_count),
            self.settings.network.max_segment_bytes,
        ));

        let manifest = match self.load_manifest(&fetcher).await {
            Ok(manifest) => manifest,
            Err(DownloadError::Cancelled) => {
                return JobResult::Cancelled {
                    partial_path: None,
                    segments_written: 0,
                }
            }
            Err(err) => {
                error!("Cannot load playlist: {}", err);
                return JobResult::Failure {
                    reason: err,
                    partial_path: None,
                };
            }
        };

        if manifest.is_live {
            warn!("Playlist has no #EXT-X-ENDLIST; downloading the segments listed now");
        }
        info!(
            "Playlist has {} segments ({:.1}s, encrypted: {})",
            manifest.segments.len(),
            manifest.total_duration(),
            manifest.is_encrypted()
        );

        let segments = select_segments(&manifest, self.config.time_range.as_ref());
        if segments.is_empty() {
            return JobResult::Failure {
                reason: DownloadError::config("no segments to download in the selected range"),
                partial_path: None,
            };
        }
        debug!("Selected {} of {} segments", segments.len(), manifest.segments.len());

        let resolver = Arc::new(KeyResolver::new(fetcher.clone(), &self.config));
        let scheduler = DownloadScheduler::new(
            self.config.clone(),
            fetcher,
            resolver,
            self.progress.clone(),
            self.settings.engine.completion_queue_per_worker,
        );
        scheduler.run(segments, self.cancel.clone()).await
    }

    async fn load_manifest(&self, fetcher: &SegmentFetcher) -> AppResult<Manifest> {
        let base = self.config.base_url.as_ref();
        let playlist = match &self.config.source {
            PlaylistSource::Remote(url) => {
                let text = self.fetch_text(fetcher, url).await?;
                parse_playlist(&text, Some(url), base)?
            }
            PlaylistSource::Local(path) => {
                let text = tokio::fs::read_to_string(path).await.map_err(|e| {
                    DownloadError::config(format!("cannot read playlist {}: {e}", path.display()))
                })?;
                parse_playlist(&text, None, base)?
            }
        };

        match playlist {
            Playlist::Media(manifest) => Ok(manifest),
            Playlist::Multivariant(variants) => {
                let variant = select_variant(&variants)
                    .ok_or_else(|| DownloadError::playlist("multivariant playlist lists no variants"))?;
                info!(
                    "Following variant {} (bandwidth {}, {} offered)",
                    variant.uri,
                    variant.bandwidth,
                    variants.len()
                );
                let url = Url::parse(&variant.uri).map_err(|e| {
                    DownloadError::playlist(format!("invalid variant URI {}: {e}", variant.uri))
                })?;
                let text = self.fetch_text(fetcher, &url).await?;
                parse_media_playlist(&text, Some(&url), base)
            }
        }
    }

    async fn fetch_text(&self, fetcher: &SegmentFetcher, url: &Url) -> AppResult<String> {
        let body = fetcher
            .fetch_bytes(
                url.as_str(),
                None,
                self.settings.network.max_segment_bytes,
                &self.cancel,
            )
            .await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::{media_playlist, FakeTransport, Reply};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn remote(url: &str) -> PlaylistSource {
        PlaylistSource::Remote(Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn test_unknown_job_ids() {
        let manager = DownloadManager::new(AppConfig::default());
        let id = Uuid::new_v4();
        assert!(!manager.cancel(id));
        assert!(manager.snapshot(id).is_none());
        assert!(manager.result(id).is_none());
        assert!(manager.subscribe(id, |_| {}).is_none());
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_start() {
        let manager = DownloadManager::new(AppConfig::default());
        let mut config =
            DownloadConfig::new(remote("https://e.com/index.m3u8"), "/tmp", "out.mp4").unwrap();
        config.output_filename = "out.exe".into();
        assert!(matches!(
            manager.start(config),
            Err(DownloadError::Config { .. })
        ));
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_registry_tracks_finished_job() {
        let transport = Arc::new(FakeTransport::new());
        transport.always(
            "https://e.com/index.m3u8",
            Reply::body(media_playlist(&[("https://e.com/0.ts", 4.0)], None).as_bytes()),
        );
        transport.always("https://e.com/0.ts", Reply::body(b"segment"));

        let temp = tempdir().unwrap();
        let manager = DownloadManager::with_transport(AppConfig::default(), transport);
        let config =
            DownloadConfig::new(remote("https://e.com/index.m3u8"), temp.path(), "out.ts").unwrap();

        let handle = manager.start(config).unwrap();
        let id = handle.id();
        let result = handle.wait().await;
        assert_eq!(result.job_state(), JobState::Completed);

        assert_eq!(manager.result(id), Some(result));
        assert_eq!(manager.snapshot(id).unwrap().state, JobState::Completed);
        assert_eq!(manager.list().len(), 1);
        assert_eq!(manager.clear_finished(), 1);
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_missing_local_playlist_fails_job() {
        let temp = tempdir().unwrap();
        let manager =
            DownloadManager::with_transport(AppConfig::default(), Arc::new(FakeTransport::new()));
        let config = DownloadConfig::new(
            PlaylistSource::Local(PathBuf::from("/nonexistent/index.m3u8")),
            temp.path(),
            "out.mp4",
        )
        .unwrap();

        let result = manager.start(config).unwrap().wait().await;
        assert!(matches!(
            result,
            JobResult::Failure {
                reason: DownloadError::Config { .. },
                partial_path: None
            }
        ));
    }
}
