//! Lifecycle wrapper around one [`AcquisitionEngine`].
//!
//! A [`DownloadTask`] owns the shared state cell and control signals of its
//! transfer. Readers only ever get [`TransferSnapshot`]s.

use crate::config::EngineConfig;
use crate::error::TransferError;
use crate::hls::control::TransferControl;
use crate::hls::engine::{AcquisitionEngine, SharedState, TransferRequest, TransferServices};
use crate::hls::state::{TransferSnapshot, TransferState, TransferStatus};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info};

pub struct DownloadTask {
    id: String,
    state: SharedState,
    control: TransferControl,
    /// Taken by the first `start`.
    engine: Mutex<Option<AcquisitionEngine>>,
    finished: watch::Sender<bool>,
    work_dir: std::path::PathBuf,
}

impl DownloadTask {
    pub fn new(
        request: TransferRequest,
        config: Arc<EngineConfig>,
        services: TransferServices,
    ) -> Arc<Self> {
        let state = Arc::new(RwLock::new(TransferState::new(
            request.task_id.clone(),
            request.url.as_str(),
            request.output_stem.clone(),
            request.format,
        )));
        let control = TransferControl::new();
        let id = request.task_id.clone();
        let work_dir = request.work_dir.clone();
        let engine = AcquisitionEngine::new(
            request,
            config,
            services,
            state.clone(),
            control.clone(),
        );
        let (finished, _) = watch::channel(false);
        Arc::new(Self {
            id,
            state,
            control,
            engine: Mutex::new(Some(engine)),
            finished,
            work_dir,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn status(&self) -> TransferStatus {
        self.state.read().status
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        self.state.read().snapshot()
    }

    fn invalid(&self, operation: &'static str) -> TransferError {
        TransferError::InvalidState {
            operation,
            status: self.status().to_string(),
        }
    }

    /// Spawn the transfer. With `permits`, it stays `pending` until a slot frees up.
    pub fn start(self: &Arc<Self>, permits: Option<Arc<Semaphore>>) -> Result<(), TransferError> {
        if self.status() != TransferStatus::Pending {
            return Err(self.invalid("start"));
        }
        let engine = self.engine.lock().take().ok_or_else(|| self.invalid("start"))?;

        let task = Arc::clone(self);
        tokio::spawn(async move {
            let token = task.control.token().clone();
            let _permit = match permits {
                Some(semaphore) => tokio::select! {
                    _ = token.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                },
                None => None,
            };
            let status = engine.run().await;
            debug!(task_id = %task.id, %status, "Transfer finished");
            task.finished.send_replace(true);
        });
        Ok(())
    }

    /// Start and drive the transfer to completion, without a concurrency limit.
    pub async fn run(self: &Arc<Self>) -> Result<TransferSnapshot, TransferError> {
        self.start(None)?;
        Ok(self.wait().await)
    }

    pub fn pause(&self) -> Result<(), TransferError> {
        let mut state = self.state.write();
        match state.status {
            TransferStatus::Paused => Ok(()),
            TransferStatus::Downloading => {
                state.transition(TransferStatus::Paused);
                self.control.pause();
                info!(task_id = %self.id, "Pause requested");
                Ok(())
            }
            status => Err(TransferError::InvalidState {
                operation: "pause",
                status: status.to_string(),
            }),
        }
    }

    pub fn resume(&self) -> Result<(), TransferError> {
        let mut state = self.state.write();
        match state.status {
            TransferStatus::Downloading => Ok(()),
            TransferStatus::Paused => {
                state.transition(TransferStatus::Downloading);
                self.control.resume();
                info!(task_id = %self.id, "Resume requested");
                Ok(())
            }
            status => Err(TransferError::InvalidState {
                operation: "resume",
                status: status.to_string(),
            }),
        }
    }

    /// Request cancellation.
    ///
    /// A pending transfer is cancelled on the spot. An active one is cancelled
    /// by its engine once it has removed the partial artifacts.
    pub fn cancel(&self) -> Result<(), TransferError> {
        let mut state = self.state.write();
        match state.status {
            TransferStatus::Pending => {
                state.transition(TransferStatus::Cancelled);
                self.control.cancel();
                // Never started: nobody else will signal completion.
                if self.engine.lock().take().is_some() {
                    self.finished.send_replace(true);
                }
                info!(task_id = %self.id, "Pending transfer cancelled");
                Ok(())
            }
            TransferStatus::Downloading | TransferStatus::Paused => {
                self.control.cancel();
                info!(task_id = %self.id, "Cancel requested");
                Ok(())
            }
            status => Err(TransferError::InvalidState {
                operation: "cancel",
                status: status.to_string(),
            }),
        }
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Wait until the transfer reaches a terminal status.
    pub async fn wait(&self) -> TransferSnapshot {
        let mut rx = self.finished.subscribe();
        // The sender lives as long as `self`, so this only returns once finished.
        let _ = rx.wait_for(|finished| *finished).await;
        self.snapshot()
    }
}
