use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::assembly::OutputFormat;
use crate::error::TransferError;
use crate::hls::retry::{BackoffPolicy, RetryPolicy};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// HTTP client options shared by every transfer of an orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// User agent string
    pub user_agent: String,

    /// Extra headers merged over the defaults (custom values win)
    pub headers: BTreeMap<String, String>,

    /// Connection timeout in seconds (0 = reqwest default)
    pub connect_timeout_secs: u64,

    /// Whole-request timeout applied at the client level in seconds (0 = none).
    /// Segment and key requests carry their own shorter timeouts.
    pub timeout_secs: u64,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// Proxy URL applied to all schemes
    pub proxy: Option<String>,

    /// Validate TLS certificates. Turning this off maps to
    /// reqwest's `danger_accept_invalid_certs`.
    pub verify_tls: bool,

    /// Maximum idle keep-alive connections kept per host
    pub pool_max_idle_per_host: usize,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: BTreeMap::new(),
            connect_timeout_secs: 5,
            timeout_secs: 0,
            follow_redirects: true,
            proxy: None,
            verify_tls: true,
            pool_max_idle_per_host: 5,
        }
    }
}

impl DownloaderConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5,zh-CN;q=0.3,zh;q=0.2"),
        );
        default_headers
    }

    /// Default headers with the configured custom headers merged on top.
    pub fn header_map(&self) -> Result<HeaderMap, TransferError> {
        let mut headers = Self::get_default_headers();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                TransferError::Configuration {
                    reason: format!("invalid header name `{name}`: {e}"),
                }
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| TransferError::Configuration {
                reason: format!("invalid value for header `{name}`: {e}"),
            })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &DownloaderConfig) -> Result<Client, TransferError> {
    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .user_agent(&config.user_agent)
        .default_headers(config.header_map()?)
        .tcp_keepalive(Duration::from_secs(30))
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if config.timeout_secs > 0 {
        client_builder = client_builder.timeout(Duration::from_secs(config.timeout_secs));
    }

    if config.connect_timeout_secs > 0 {
        client_builder =
            client_builder.connect_timeout(Duration::from_secs(config.connect_timeout_secs));
    }

    if !config.verify_tls {
        warn!("TLS certificate verification is disabled");
        client_builder = client_builder.danger_accept_invalid_certs(true);
    }

    if let Some(proxy_url) = &config.proxy {
        let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| TransferError::Configuration {
            reason: format!("invalid proxy `{proxy_url}`: {e}"),
        })?;
        client_builder = client_builder.proxy(proxy);
        info!(proxy_url = %proxy_url, "Using explicitly configured proxy for downloads");
    } else {
        debug!("No explicit proxy configured");
    }

    client_builder.build().map_err(TransferError::from)
}

// --- Fetcher Configuration ---
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Retries after the first attempt for a single segment
    pub max_segment_retries: u32,
    pub segment_backoff: BackoffPolicy,
    /// Per-request timeout for segments. Keeps cancellation latency bounded.
    pub segment_timeout_secs: u64,
    pub max_key_retries: u32,
    pub key_backoff: BackoffPolicy,
    pub key_timeout_secs: u64,
    pub playlist_timeout_secs: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_segment_retries: 3,
            segment_backoff: BackoffPolicy::Exponential {
                base_delay_ms: 500,
                max_delay_ms: 8_000,
                jitter: true,
            },
            segment_timeout_secs: 30,
            max_key_retries: 2,
            key_backoff: BackoffPolicy::Fixed { delay_ms: 500 },
            key_timeout_secs: 10,
            playlist_timeout_secs: 15,
        }
    }
}

impl FetcherConfig {
    pub fn segment_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_segment_retries, self.segment_backoff.clone())
    }

    pub fn key_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_key_retries, self.key_backoff.clone())
    }

    pub fn segment_timeout(&self) -> Duration {
        Duration::from_secs(self.segment_timeout_secs)
    }

    pub fn key_timeout(&self) -> Duration {
        Duration::from_secs(self.key_timeout_secs)
    }

    pub fn playlist_timeout(&self) -> Duration {
        Duration::from_secs(self.playlist_timeout_secs)
    }
}

// --- Transfer Configuration ---
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Root under which every transfer gets `<work_root>/<task_id>`
    pub work_root: PathBuf,
    /// Where assembled files land (defaults to the transfer's work directory)
    pub output_dir: Option<PathBuf>,
    pub output_format: OutputFormat,
    /// Upper bound between re-checks of the pause flag while paused
    pub pause_poll_interval_ms: u64,
    /// Run AES decryption on the blocking thread pool
    pub offload_decryption: bool,
    /// Keep segment artifacts after a successful assembly
    pub keep_segments: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            work_root: PathBuf::from("temp"),
            output_dir: None,
            output_format: OutputFormat::Mp4,
            pause_poll_interval_ms: 100,
            offload_decryption: false,
            keep_segments: false,
        }
    }
}

impl TransferConfig {
    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerConfig {
    pub ffmpeg_path: String,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Maximum transfers running at once; the rest wait in `pending`
    pub max_concurrent_downloads: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Work directories untouched for longer than this are swept (0 = never)
    pub max_age_days: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self { max_age_days: 7 }
    }
}

impl CleanupConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_days * 24 * 60 * 60)
    }
}

// --- Top-Level Configuration ---
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub downloader: DownloaderConfig,
    pub fetcher: FetcherConfig,
    pub transfer: TransferConfig,
    pub assembler: AssemblerConfig,
    pub manager: ManagerConfig,
    pub cleanup: CleanupConfig,
}
