// HLS Playlist: maps the m3u8-rs grammar into the transfer's immutable descriptor.

use crate::error::TransferError;
use crate::hls::fetcher::SegmentDownloader;
use crate::hls::retry::RetryPolicy;
use m3u8_rs::{KeyMethod, MasterPlaylist, MediaPlaylist, Playlist, parse_playlist_res};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// One media segment, in playlist order.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub index: usize,
    pub url: Url,
    pub duration: f32,
}

/// The single `EXT-X-KEY` honored for a transfer (method is always AES-128).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDescriptor {
    /// Key URI as written in the playlist, possibly relative.
    pub uri: String,
    /// Hex IV as written in the playlist, `0x` prefix allowed.
    pub iv: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlaylistDescriptor {
    /// URL the media playlist was fetched from; relative URIs resolve against it.
    pub base_url: Url,
    pub segments: Vec<Segment>,
    pub key: Option<KeyDescriptor>,
}

impl PlaylistDescriptor {
    pub fn total_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }
}

/// What a single playlist document turned out to be.
#[derive(Debug)]
pub enum ParsedPlaylist {
    Media(PlaylistDescriptor),
    /// A master playlist; the URL is its highest-bandwidth variant.
    Master(Url),
}

/// Resolve a possibly relative URI against `base`.
pub fn resolve_uri(base: &Url, uri: &str) -> Result<Url, TransferError> {
    base.join(uri.trim())
        .map_err(|e| TransferError::parse(format!("cannot resolve `{uri}` against {base}: {e}")))
}

/// Interpret one playlist document fetched from `url`.
pub fn parse_playlist(bytes: &[u8], url: &Url) -> Result<ParsedPlaylist, TransferError> {
    match parse_playlist_res(bytes) {
        Ok(Playlist::MediaPlaylist(pl)) => describe_media(pl, url).map(ParsedPlaylist::Media),
        Ok(Playlist::MasterPlaylist(pl)) => select_variant(&pl, url).map(ParsedPlaylist::Master),
        Err(e) => Err(TransferError::parse(format!(
            "failed to parse playlist {url}: {e}"
        ))),
    }
}

fn select_variant(master: &MasterPlaylist, url: &Url) -> Result<Url, TransferError> {
    let variant = master
        .variants
        .iter()
        .filter(|v| !v.is_i_frame)
        .max_by_key(|v| v.bandwidth)
        .ok_or_else(|| TransferError::parse(format!("master playlist {url} has no variants")))?;
    debug!(
        bandwidth = variant.bandwidth,
        variants = master.variants.len(),
        "Selected highest-bandwidth variant"
    );
    resolve_uri(url, &variant.uri)
}

fn describe_media(playlist: MediaPlaylist, url: &Url) -> Result<PlaylistDescriptor, TransferError> {
    if playlist.segments.is_empty() {
        return Err(TransferError::parse(format!(
            "playlist {url} contains no media segments"
        )));
    }
    if !playlist.end_list {
        warn!(url = %url, "Playlist has no EXT-X-ENDLIST, downloading the current snapshot only");
    }

    let mut key = None;
    if let Some(first) = playlist.segments.iter().find_map(|s| s.key.as_ref()) {
        key = match &first.method {
            KeyMethod::None => None,
            KeyMethod::AES128 => {
                let uri = first.uri.clone().ok_or_else(|| {
                    TransferError::parse("EXT-X-KEY with METHOD=AES-128 has no URI")
                })?;
                Some(KeyDescriptor {
                    uri,
                    iv: first.iv.clone(),
                })
            }
            other => {
                return Err(TransferError::parse(format!(
                    "unsupported encryption method {other:?}"
                )));
            }
        };
    }

    let segments = playlist
        .segments
        .iter()
        .enumerate()
        .map(|(index, segment)| {
            if segment.byte_range.is_some() {
                debug!(index, "Ignoring EXT-X-BYTERANGE, fetching the whole resource");
            }
            Ok(Segment {
                index,
                url: resolve_uri(url, &segment.uri)?,
                duration: segment.duration,
            })
        })
        .collect::<Result<Vec<_>, TransferError>>()?;

    Ok(PlaylistDescriptor {
        base_url: url.clone(),
        segments,
        key,
    })
}

/// Fetch and interpret the playlist at `url`, following a master playlist once.
pub async fn load_playlist(
    downloader: &dyn SegmentDownloader,
    url: &Url,
    policy: &RetryPolicy,
    token: &CancellationToken,
) -> Result<PlaylistDescriptor, TransferError> {
    let mut current = url.clone();
    // One hop from master to media; a master pointing at another master is rejected.
    for _ in 0..2 {
        let bytes = downloader
            .fetch(&current, policy, token)
            .await
            .map_err(|failed| failed.value)?
            .value;
        match parse_playlist(&bytes, &current)? {
            ParsedPlaylist::Media(descriptor) => {
                info!(
                    url = %current,
                    segments = descriptor.total_segments(),
                    encrypted = descriptor.is_encrypted(),
                    "Playlist loaded"
                );
                return Ok(descriptor);
            }
            ParsedPlaylist::Master(variant) => {
                debug!(master = %current, variant = %variant, "Following master playlist");
                current = variant;
            }
        }
    }
    Err(TransferError::parse(format!(
        "variant playlist {current} is itself a master playlist"
    )))
}
