// HLS Segment Fetcher: single-resource HTTP retrieval with retry, backoff and
// transient/permanent classification. Also used for playlists and keys.

use crate::error::TransferError;
use crate::hls::retry::{Attempted, RetryAction, RetryPolicy, retry_with_backoff};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

pub type FetchResult = Result<Attempted<Bytes>, Attempted<TransferError>>;

#[async_trait]
pub trait SegmentDownloader: Send + Sync {
    /// GET `url`, retrying transient failures under `policy`.
    ///
    /// Both outcomes report how many retries were consumed. Cancellation of
    /// `token` surfaces as [`TransferError::Cancelled`].
    async fn fetch(&self, url: &Url, policy: &RetryPolicy, token: &CancellationToken)
    -> FetchResult;
}

pub struct SegmentFetcher {
    http_client: Client,
    request_timeout: Duration,
}

impl SegmentFetcher {
    pub fn new(http_client: Client, request_timeout: Duration) -> Self {
        Self {
            http_client,
            request_timeout,
        }
    }

    async fn attempt(&self, url: &Url, token: &CancellationToken) -> RetryAction<Bytes> {
        let download_start = std::time::Instant::now();
        let send = self
            .http_client
            .get(url.clone())
            .timeout(self.request_timeout)
            .send();

        let response = tokio::select! {
            _ = token.cancelled() => return RetryAction::Fail(TransferError::Cancelled),
            response = send => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                let err = TransferError::from_transport(e, url.as_str());
                return if err.is_retryable() {
                    RetryAction::Retry(err)
                } else {
                    RetryAction::Fail(err)
                };
            }
        };

        let status = response.status();
        if status != StatusCode::OK {
            let err = TransferError::from_status(status, url.as_str());
            return if err.is_retryable() {
                RetryAction::Retry(err)
            } else {
                RetryAction::Fail(err)
            };
        }

        trace!(url = %url, http_version = ?response.version(), "Response headers received");

        let body = tokio::select! {
            _ = token.cancelled() => return RetryAction::Fail(TransferError::Cancelled),
            body = response.bytes() => body,
        };

        match body {
            Ok(bytes) => {
                debug!(
                    url = %url,
                    bytes = bytes.len(),
                    latency_ms = download_start.elapsed().as_millis() as u64,
                    "Fetched resource"
                );
                RetryAction::Success(bytes)
            }
            // A body cut short mid-transfer is a connection-level failure.
            Err(e) => RetryAction::Retry(TransferError::TransientFetch {
                url: url.to_string(),
                reason: format!("failed reading body: {e}"),
            }),
        }
    }
}

#[async_trait]
impl SegmentDownloader for SegmentFetcher {
    async fn fetch(
        &self,
        url: &Url,
        policy: &RetryPolicy,
        token: &CancellationToken,
    ) -> FetchResult {
        retry_with_backoff(policy, token, |attempt| async move {
            if attempt > 0 {
                debug!(url = %url, attempt, "Re-requesting");
            }
            self.attempt(url, token).await
        })
        .await
    }
}
