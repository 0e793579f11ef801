// Acquisition engine: drives one transfer from playlist to assembled output.
//
// Segments are fetched strictly in order. Per-segment failures are recorded and
// the loop carries on; the transfer fails after the loop if any were recorded.

use crate::assembly::{
    Assembler, AssemblyOutput, AssemblyRequest, DefaultAssembler, OutputFormat, SegmentArtifact,
};
use crate::config::{EngineConfig, create_client};
use crate::error::TransferError;
use crate::hls::artifacts::SegmentStore;
use crate::hls::control::TransferControl;
use crate::hls::decryption::Decryptor;
use crate::hls::fetcher::{SegmentDownloader, SegmentFetcher};
use crate::hls::key::{KeyMaterial, KeyResolver};
use crate::hls::playlist::{Segment, load_playlist};
use crate::hls::progress::ProgressTracker;
use crate::hls::retry::Attempted;
use crate::hls::state::{SegmentOutcome, SegmentResult, TransferState, TransferStatus};
use parking_lot::RwLock;
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Instrument, debug, error, info, info_span, warn};
use url::Url;

pub type SharedState = Arc<RwLock<TransferState>>;

/// Network and assembly collaborators of a transfer.
#[derive(Clone)]
pub struct TransferServices {
    pub playlists: Arc<dyn SegmentDownloader>,
    pub keys: Arc<dyn SegmentDownloader>,
    pub segments: Arc<dyn SegmentDownloader>,
    pub assembler: Arc<dyn Assembler>,
}

impl TransferServices {
    pub fn from_config(config: &EngineConfig) -> Result<Self, TransferError> {
        let client = create_client(&config.downloader)?;
        Ok(Self::with_client(client, config))
    }

    /// Fetchers share one connection pool but carry their own request timeouts.
    pub fn with_client(client: Client, config: &EngineConfig) -> Self {
        Self {
            playlists: Arc::new(SegmentFetcher::new(
                client.clone(),
                config.fetcher.playlist_timeout(),
            )),
            keys: Arc::new(SegmentFetcher::new(
                client.clone(),
                config.fetcher.key_timeout(),
            )),
            segments: Arc::new(SegmentFetcher::new(client, config.fetcher.segment_timeout())),
            assembler: Arc::new(DefaultAssembler::new(config.assembler.ffmpeg_path.clone())),
        }
    }

    pub fn with_assembler(mut self, assembler: Arc<dyn Assembler>) -> Self {
        self.assembler = assembler;
        self
    }
}

/// What to download and where to put it.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub task_id: String,
    pub url: Url,
    pub output_stem: String,
    pub format: OutputFormat,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
}

pub struct AcquisitionEngine {
    request: TransferRequest,
    config: Arc<EngineConfig>,
    services: TransferServices,
    state: SharedState,
    control: TransferControl,
    store: SegmentStore,
    decryptor: Decryptor,
}

impl AcquisitionEngine {
    pub fn new(
        request: TransferRequest,
        config: Arc<EngineConfig>,
        services: TransferServices,
        state: SharedState,
        control: TransferControl,
    ) -> Self {
        let store = SegmentStore::new(&request.work_dir);
        let decryptor = Decryptor::new(config.transfer.offload_decryption);
        Self {
            request,
            config,
            services,
            state,
            control,
            store,
            decryptor,
        }
    }

    /// Run the transfer to a terminal status.
    pub async fn run(self) -> TransferStatus {
        let span = info_span!("transfer", task_id = %self.request.task_id);
        self.execute().instrument(span).await
    }

    async fn execute(&self) -> TransferStatus {
        {
            let mut state = self.state.write();
            if !state.transition(TransferStatus::Downloading) {
                debug!(status = %state.status, "Transfer not startable");
                return state.status;
            }
        }
        info!(url = %self.request.url, format = %self.request.format, "Transfer started");

        match self.acquire().await {
            Ok(output) => self.finish_completed(output),
            Err(TransferError::Cancelled) => self.finish_cancelled().await,
            Err(e) => self.finish_failed(e),
        }
    }

    async fn acquire(&self) -> Result<AssemblyOutput, TransferError> {
        let token = self.control.token();
        let segment_policy = self.config.fetcher.segment_retry_policy();

        let playlist = load_playlist(
            self.services.playlists.as_ref(),
            &self.request.url,
            &segment_policy,
            token,
        )
        .await?;
        let total = playlist.total_segments();

        let key = KeyResolver::new(
            self.services.keys.clone(),
            self.config.fetcher.key_retry_policy(),
        )
        .resolve(playlist.key.as_ref(), &playlist.base_url, token)
        .await?;

        self.store.ensure_dir().await?;

        let mut tracker = ProgressTracker::new(total);
        self.state.write().progress = tracker.report();

        let mut artifacts = Vec::with_capacity(total);
        for segment in &playlist.segments {
            self.control.check_cancelled()?;
            self.pause_gate(&mut tracker).await?;

            let (outcome, bytes, retries) = match self.acquire_segment(segment, key.as_ref()).await
            {
                Ok(Attempted { value, retries }) => {
                    let bytes = value.bytes;
                    tracker.record_segment(bytes);
                    artifacts.push(value);
                    (SegmentOutcome::Succeeded, bytes, retries)
                }
                Err(Attempted {
                    value: TransferError::Cancelled,
                    ..
                }) => return Err(TransferError::Cancelled),
                Err(Attempted { value, retries }) => {
                    error!(
                        index = segment.index,
                        url = %segment.url,
                        retries,
                        error = %value,
                        "Segment failed"
                    );
                    (
                        SegmentOutcome::Failed {
                            reason: value.to_string(),
                        },
                        0,
                        retries,
                    )
                }
            };

            let report = tracker.report();
            {
                let mut state = self.state.write();
                state.record_segment(SegmentResult {
                    index: segment.index,
                    bytes,
                    outcome,
                    retries,
                });
                state.progress = report;
            }
            debug!(
                index = segment.index,
                bytes,
                retries,
                percent = report.percent,
                speed = report.speed,
                "Segment processed"
            );
        }

        let failed = total - artifacts.len();
        if failed > 0 {
            return Err(TransferError::SegmentsFailed { failed, total });
        }

        self.control.check_cancelled()?;
        self.pause_gate(&mut tracker).await?;

        tokio::fs::create_dir_all(&self.request.output_dir)
            .await
            .map_err(|e| {
                TransferError::filesystem("creating output directory", &self.request.output_dir, e)
            })?;
        let request = AssemblyRequest {
            segments: artifacts,
            work_dir: self.request.work_dir.clone(),
            output_dir: self.request.output_dir.clone(),
            output_stem: self.request.output_stem.clone(),
            format: self.request.format,
        };
        info!(segments = total, "Assembling output");
        let output = self.services.assembler.assemble(request, token).await?;

        if !self.config.transfer.keep_segments {
            let report = self.store.remove_all().await;
            if !report.is_clean() {
                warn!(details = %report.describe(), "Segments left behind after assembly");
            }
        }

        self.state.write().progress = tracker.complete();
        Ok(output)
    }

    async fn acquire_segment(
        &self,
        segment: &Segment,
        key: Option<&KeyMaterial>,
    ) -> Result<Attempted<SegmentArtifact>, Attempted<TransferError>> {
        let policy = self.config.fetcher.segment_retry_policy();
        let fetched = self
            .services
            .segments
            .fetch(&segment.url, &policy, self.control.token())
            .await?;
        let retries = fetched.retries;
        let failed = |value| Attempted { value, retries };

        let data = match key {
            Some(key) => self
                .decryptor
                .decrypt(fetched.value, &key.key, &key.iv)
                .await
                .map_err(failed)?,
            None => fetched.value,
        };

        let artifact = self
            .store
            .write(segment.index, &data)
            .await
            .map_err(failed)?;
        Ok(Attempted {
            value: artifact,
            retries,
        })
    }

    /// Park the loop while paused, keeping paused time out of the speed window.
    async fn pause_gate(&self, tracker: &mut ProgressTracker) -> Result<(), TransferError> {
        if !self.control.is_paused() {
            return Ok(());
        }
        info!("Transfer paused");
        tracker.pause();
        self.control
            .wait_while_paused(self.config.transfer.pause_poll_interval())
            .await?;
        tracker.resume();
        info!("Transfer resumed");
        Ok(())
    }

    fn finish_completed(&self, output: AssemblyOutput) -> TransferStatus {
        let mut state = self.state.write();
        info!(
            path = %output.path.display(),
            size = output.size_bytes,
            "Transfer completed"
        );
        state.output = Some(output);
        state.transition(TransferStatus::Completed);
        state.status
    }

    fn finish_failed(&self, err: TransferError) -> TransferStatus {
        let mut state = self.state.write();
        let failures = state.failures();
        error!(
            error = %err,
            failed_segments = ?failures.iter().map(|f| f.index).collect::<Vec<_>>(),
            "Transfer failed"
        );
        state.error = Some(err.to_string());
        state.transition(TransferStatus::Failed);
        state.status
    }

    /// Remove partial artifacts, then commit `cancelled` together with any
    /// cleanup failure.
    async fn finish_cancelled(&self) -> TransferStatus {
        let report = self.store.remove_all().await;
        if report.is_clean() {
            // Only succeeds when nothing else was left in the work directory.
            let _ = tokio::fs::remove_dir(&self.request.work_dir).await;
        }
        let mut state = self.state.write();
        if report.is_clean() {
            info!(removed = report.removed, "Transfer cancelled");
        } else {
            let message = report.describe();
            error!(error = %message, "Transfer cancelled but artifacts remain");
            state.error = Some(message);
            state.lingering_artifacts = report.lingering_paths();
        }
        state.transition(TransferStatus::Cancelled);
        state.status
    }
}
