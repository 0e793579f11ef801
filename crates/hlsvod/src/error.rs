use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transfer cancelled")]
    Cancelled,

    #[error("playlist error: {reason}")]
    Parse { reason: String },

    #[error("key fetch failed for {url}: {reason}")]
    KeyFetch { url: String, reason: String },

    #[error("transient fetch error for {url}: {reason}")]
    TransientFetch { url: String, reason: String },

    #[error("permanent fetch error for {url}: {reason}")]
    PermanentFetch { url: String, reason: String },

    #[error("decryption error: {reason}")]
    Decrypt { reason: String },

    #[error("{failed} of {total} segments failed")]
    SegmentsFailed { failed: usize, total: usize },

    #[error("assembly failed: {reason}")]
    Assembly { reason: String },

    #[error("filesystem error during {operation} on {path}: {reason}")]
    Filesystem {
        operation: &'static str,
        path: String,
        reason: String,
    },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("cannot {operation} a transfer that is {status}")]
    InvalidState {
        operation: &'static str,
        status: String,
    },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("task not found: {id}")]
    NotFound { id: String },
}

impl TransferError {
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    pub fn key_fetch(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::KeyFetch {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn decrypt(reason: impl Into<String>) -> Self {
        Self::Decrypt {
            reason: reason.into(),
        }
    }

    pub fn assembly(reason: impl Into<String>) -> Self {
        Self::Assembly {
            reason: reason.into(),
        }
    }

    pub fn filesystem(
        operation: &'static str,
        path: impl AsRef<std::path::Path>,
        source: impl std::fmt::Display,
    ) -> Self {
        Self::Filesystem {
            operation,
            path: path.as_ref().display().to_string(),
            reason: source.to_string(),
        }
    }

    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Classify a non-success HTTP status for the given URL.
    ///
    /// 429 and 5xx are transient, every other non-200 status is permanent.
    pub fn from_status(status: StatusCode, url: impl Into<String>) -> Self {
        let url = url.into();
        let reason = format!("HTTP {status}");
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Self::TransientFetch { url, reason }
        } else {
            Self::PermanentFetch { url, reason }
        }
    }

    /// Classify a reqwest transport error for the given URL.
    pub fn from_transport(err: reqwest::Error, url: impl Into<String>) -> Self {
        let url = url.into();
        if is_retryable_reqwest_error(&err) {
            Self::TransientFetch {
                url,
                reason: err.to_string(),
            }
        } else {
            Self::PermanentFetch {
                url,
                reason: err.to_string(),
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientFetch { .. } => true,
            Self::Network { source } => is_retryable_reqwest_error(source),
            Self::Cancelled
            | Self::Parse { .. }
            | Self::KeyFetch { .. }
            | Self::PermanentFetch { .. }
            | Self::Decrypt { .. }
            | Self::SegmentsFailed { .. }
            | Self::Assembly { .. }
            | Self::Filesystem { .. }
            | Self::InvalidUrl { .. }
            | Self::InvalidState { .. }
            | Self::Configuration { .. }
            | Self::NotFound { .. } => false,
        }
    }

    /// Errors that end the whole transfer rather than a single segment.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Parse { .. }
            | Self::KeyFetch { .. }
            | Self::SegmentsFailed { .. }
            | Self::Assembly { .. }
            | Self::Configuration { .. } => true,
            Self::TransientFetch { .. }
            | Self::PermanentFetch { .. }
            | Self::Decrypt { .. }
            | Self::Filesystem { .. }
            | Self::Network { .. }
            | Self::InvalidUrl { .. } => false,
            Self::Cancelled | Self::InvalidState { .. } | Self::NotFound { .. } => false,
        }
    }
}

/// Connection-level reqwest errors that are worth retrying.
///
/// Redirect and builder errors are not.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}
