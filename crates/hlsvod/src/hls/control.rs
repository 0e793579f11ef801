// Transfer control plane: one cancellation token plus an independent pause flag.

use crate::error::TransferError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cooperative pause/resume/cancel signals for a single transfer.
///
/// Cloning shares the same signals. `cancel()` and `resume()` wake a pending
/// [`TransferControl::wait_while_paused`] explicitly.
#[derive(Debug, Clone)]
pub struct TransferControl {
    token: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            token: CancellationToken::new(),
            paused: Arc::new(paused),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns `true` if the flag changed.
    pub fn pause(&self) -> bool {
        !self.paused.send_replace(true)
    }

    /// Returns `true` if the flag changed.
    pub fn resume(&self) -> bool {
        self.paused.send_replace(false)
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fails with [`TransferError::Cancelled`] once cancellation is requested.
    pub fn check_cancelled(&self) -> Result<(), TransferError> {
        if self.token.is_cancelled() {
            Err(TransferError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Block while paused. Returns immediately when not paused.
    ///
    /// Woken by `resume()` or `cancel()`; `poll_interval` only bounds how long a
    /// missed notification could go unnoticed.
    pub async fn wait_while_paused(&self, poll_interval: Duration) -> Result<(), TransferError> {
        let mut rx = self.paused.subscribe();
        loop {
            self.check_cancelled()?;
            if !*rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = self.token.cancelled() => return Err(TransferError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        debug!("Pause signal dropped, resuming");
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}
