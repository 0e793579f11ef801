// HLS Key Resolution: fetches the AES-128 key once per transfer and derives the IV.

use crate::error::TransferError;
use crate::hls::fetcher::SegmentDownloader;
use crate::hls::playlist::{KeyDescriptor, resolve_uri};
use crate::hls::retry::RetryPolicy;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// Resolved key bytes and IV for a transfer.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub key: [u8; 16],
    pub iv: [u8; 16],
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &"<redacted>")
            .field("iv", &hex::encode(self.iv))
            .finish()
    }
}

/// Transfer-scoped key resolver. The first successful resolution is cached
/// for the lifetime of the resolver; it is never shared across transfers.
pub struct KeyResolver {
    downloader: Arc<dyn SegmentDownloader>,
    policy: RetryPolicy,
    cache: OnceCell<KeyMaterial>,
}

impl KeyResolver {
    pub fn new(downloader: Arc<dyn SegmentDownloader>, policy: RetryPolicy) -> Self {
        Self {
            downloader,
            policy,
            cache: OnceCell::new(),
        }
    }

    /// `Ok(None)` means the transfer is plaintext.
    ///
    /// Every failure other than cancellation is reported as
    /// [`TransferError::KeyFetch`], which is fatal to the transfer.
    pub async fn resolve(
        &self,
        descriptor: Option<&KeyDescriptor>,
        base_url: &Url,
        token: &CancellationToken,
    ) -> Result<Option<KeyMaterial>, TransferError> {
        let Some(descriptor) = descriptor else {
            return Ok(None);
        };
        let material = self
            .cache
            .get_or_try_init(|| self.fetch_material(descriptor, base_url, token))
            .await?;
        Ok(Some(material.clone()))
    }

    async fn fetch_material(
        &self,
        descriptor: &KeyDescriptor,
        base_url: &Url,
        token: &CancellationToken,
    ) -> Result<KeyMaterial, TransferError> {
        let iv = match descriptor.iv.as_deref() {
            Some(iv) => parse_iv(iv)?,
            None => [0u8; 16],
        };

        let key_url = resolve_uri(base_url, &descriptor.uri)
            .map_err(|e| TransferError::key_fetch(&descriptor.uri, e.to_string()))?;

        debug!(url = %key_url, "Fetching decryption key");
        let fetched = match self.downloader.fetch(&key_url, &self.policy, token).await {
            Ok(fetched) => fetched,
            Err(failed) => {
                return Err(match failed.value {
                    TransferError::Cancelled => TransferError::Cancelled,
                    other => TransferError::key_fetch(key_url.as_str(), other.to_string()),
                });
            }
        };

        let key: [u8; 16] = fetched.value.as_ref().try_into().map_err(|_| {
            TransferError::key_fetch(
                key_url.as_str(),
                format!("expected 16 key bytes, got {}", fetched.value.len()),
            )
        })?;

        info!(url = %key_url, retries = fetched.retries, "Decryption key resolved");
        Ok(KeyMaterial { key, iv })
    }
}

/// Parse a hex IV, with or without `0x`, left-padding short values with zeros.
pub fn parse_iv(iv: &str) -> Result<[u8; 16], TransferError> {
    let trimmed = iv.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.len() > 32 {
        return Err(TransferError::parse(format!(
            "IV `{iv}` is longer than 16 bytes"
        )));
    }
    let padded = format!("{digits:0>32}");
    let mut out = [0u8; 16];
    hex::decode_to_slice(&padded, &mut out)
        .map_err(|e| TransferError::parse(format!("invalid IV `{iv}`: {e}")))?;
    Ok(out)
}
