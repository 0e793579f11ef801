//! Shared fixtures: an in-process HLS origin and a recording assembler.

#![allow(dead_code)]

use aes::Aes128;
use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use cipher::block_padding::Pkcs7;
use cipher::{BlockEncryptMut, KeyIvInit};
use hlsvod_engine::hls::{BackoffPolicy, TransferServices};
use hlsvod_engine::{
    Assembler, AssemblyOutput, AssemblyRequest, ConcatAssembler, EngineConfig, OutputFormat,
    TransferError,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const KEY: [u8; 16] = *b"0123456789abcdef";
pub const IV: [u8; 16] = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
];
pub const IV_HEX: &str = "0x000102030405060708090a0b0c0d0e0f";

/// What the origin serves and what it has seen.
#[derive(Default)]
pub struct OriginState {
    pub playlist: Mutex<String>,
    /// Playlists served by file name, taking precedence over `playlist`.
    pub named_playlists: Mutex<HashMap<String, String>>,
    pub key: Mutex<Option<Vec<u8>>>,
    pub key_status: Mutex<Option<StatusCode>>,
    pub segments: Mutex<Vec<Vec<u8>>>,
    /// Statuses served for a segment before its body, consumed front to back.
    pub scripted: Mutex<HashMap<usize, VecDeque<StatusCode>>>,
    /// Segments whose response waits for the matching notify.
    pub holds: Mutex<HashMap<usize, Arc<Notify>>>,
    /// Request paths in arrival order.
    pub requests: Mutex<Vec<String>>,
    pub segment_delay: Mutex<Duration>,
}

impl OriginState {
    pub fn segment_requests(&self) -> Vec<usize> {
        self.requests
            .lock()
            .iter()
            .filter_map(|p| segment_index(p))
            .collect()
    }

    pub fn key_requests(&self) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|p| p.ends_with("key.bin"))
            .count()
    }

    pub fn script(&self, index: usize, statuses: &[StatusCode]) {
        self.scripted
            .lock()
            .insert(index, statuses.iter().copied().collect());
    }

    pub fn hold(&self, index: usize) -> Arc<Notify> {
        self.holds
            .lock()
            .entry(index)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }
}

fn segment_index(path: &str) -> Option<usize> {
    path.rsplit('/')
        .next()?
        .strip_prefix("seg")?
        .strip_suffix(".ts")?
        .parse()
        .ok()
}

async fn serve_origin(State(origin): State<Arc<OriginState>>, uri: Uri) -> Response {
    let path = uri.path().to_string();
    origin.requests.lock().push(path.clone());

    if path.ends_with(".m3u8") {
        let name = path.rsplit('/').next().unwrap_or_default();
        let named = origin.named_playlists.lock().get(name).cloned();
        let body = named.unwrap_or_else(|| origin.playlist.lock().clone());
        return (StatusCode::OK, body).into_response();
    }
    if path.ends_with("key.bin") {
        if let Some(status) = *origin.key_status.lock() {
            return status.into_response();
        }
        return match origin.key.lock().clone() {
            Some(key) => (StatusCode::OK, key).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        };
    }
    let Some(index) = segment_index(&path) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let scripted = origin
        .scripted
        .lock()
        .get_mut(&index)
        .and_then(|queue| queue.pop_front());
    if let Some(status) = scripted {
        return status.into_response();
    }

    let hold = origin.holds.lock().get(&index).cloned();
    if let Some(notify) = hold {
        notify.notified().await;
    }
    let delay = *origin.segment_delay.lock();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    match origin.segments.lock().get(index).cloned() {
        Some(body) => (StatusCode::OK, body).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub struct Origin {
    pub base: Url,
    pub state: Arc<OriginState>,
}

impl Origin {
    pub async fn start() -> Self {
        let state = Arc::new(OriginState::default());
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind origin");
        let addr = listener.local_addr().expect("Failed to read origin address");
        let app = Router::new()
            .fallback(serve_origin)
            .with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("Origin server failed");
        });
        Self {
            base: Url::parse(&format!("http://{addr}/vod/")).expect("Invalid origin URL"),
            state,
        }
    }

    pub fn playlist_url(&self) -> String {
        self.base.join("index.m3u8").expect("Invalid playlist URL").to_string()
    }

    /// Serve `segments` as a plaintext VOD playlist.
    pub fn with_plain(&self, segments: Vec<Vec<u8>>) -> &Self {
        *self.state.playlist.lock() = media_playlist(segments.len(), None);
        *self.state.segments.lock() = segments;
        self
    }

    /// Serve `plaintexts` AES-128-CBC encrypted under [`KEY`]/[`IV`].
    pub fn with_encrypted(&self, plaintexts: &[Vec<u8>]) -> &Self {
        let key_line = format!("#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\",IV={IV_HEX}\n");
        *self.state.playlist.lock() = media_playlist(plaintexts.len(), Some(&key_line));
        *self.state.key.lock() = Some(KEY.to_vec());
        *self.state.segments.lock() = plaintexts.iter().map(|p| encrypt(p, &KEY, &IV)).collect();
        self
    }
}

pub fn media_playlist(count: usize, key_line: Option<&str>) -> String {
    let mut text = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n");
    if let Some(line) = key_line {
        text.push_str(line);
    }
    for i in 0..count {
        text.push_str(&format!("#EXTINF:4.0,\nseg{i}.ts\n"));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

pub fn encrypt(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
    let cipher = cbc::Encryptor::<Aes128>::new_from_slices(key, iv).expect("Invalid key/iv");
    let padded_len = (plaintext.len() / 16 + 1) * 16;
    let mut buffer = vec![0u8; padded_len];
    buffer[..plaintext.len()].copy_from_slice(plaintext);
    cipher
        .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
        .expect("Encryption failed")
        .to_vec()
}

pub fn segment_bytes(index: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i + index * 31) % 251) as u8).collect()
}

/// One assembler call: indices and the bytes on disk at handoff time.
#[derive(Debug, Clone)]
pub struct RecordedHandoff {
    pub indices: Vec<usize>,
    pub contents: Vec<Vec<u8>>,
    pub paths: Vec<PathBuf>,
}

/// Records every handoff, then concatenates (or fails on demand).
#[derive(Default)]
pub struct RecordingAssembler {
    pub calls: Mutex<Vec<RecordedHandoff>>,
    pub fail: bool,
}

impl RecordingAssembler {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Assembler for RecordingAssembler {
    async fn assemble(
        &self,
        request: AssemblyRequest,
        token: &CancellationToken,
    ) -> Result<AssemblyOutput, TransferError> {
        let handoff = RecordedHandoff {
            indices: request.segments.iter().map(|s| s.index).collect(),
            contents: request
                .segments
                .iter()
                .map(|s| std::fs::read(&s.path).expect("Segment missing at handoff"))
                .collect(),
            paths: request.segments.iter().map(|s| s.path.clone()).collect(),
        };
        self.calls.lock().push(handoff);
        if self.fail {
            return Err(TransferError::assembly("remuxer exited with status 1"));
        }
        ConcatAssembler.assemble(request, token).await
    }
}

pub fn test_config(work_root: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.transfer.work_root = work_root.to_path_buf();
    config.transfer.output_format = OutputFormat::Ts;
    config.transfer.pause_poll_interval_ms = 50;
    config.fetcher.max_segment_retries = 3;
    config.fetcher.segment_backoff = BackoffPolicy::Fixed { delay_ms: 10 };
    config.fetcher.key_backoff = BackoffPolicy::Fixed { delay_ms: 10 };
    config.fetcher.segment_timeout_secs = 10;
    config
}

pub fn services(config: &EngineConfig, assembler: Arc<RecordingAssembler>) -> TransferServices {
    TransferServices::with_client(reqwest::Client::new(), config).with_assembler(assembler)
}

/// Poll `condition` every 10 ms, panicking after 10 s.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "Timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
