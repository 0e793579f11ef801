//! Assembly of ordered segment artifacts into one output file.
//!
//! [`ConcatAssembler`] byte-concatenates MPEG-TS segments; [`FfmpegAssembler`]
//! remuxes them into MP4/MKV with ffmpeg's concat demuxer.

use crate::error::TransferError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CONCAT_LIST: &str = "segments.txt";
const STDERR_TAIL_LINES: usize = 20;

/// Container of the assembled output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Ts,
    #[default]
    Mp4,
    Mkv,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ts => "ts",
            Self::Mp4 => "mp4",
            Self::Mkv => "mkv",
        }
    }

    /// Whether producing this container needs a remux step.
    pub fn needs_remux(&self) -> bool {
        !matches!(self, Self::Ts)
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ts" => Ok(Self::Ts),
            "mp4" => Ok(Self::Mp4),
            "mkv" => Ok(Self::Mkv),
            other => Err(TransferError::Configuration {
                reason: format!("unsupported output format `{other}` (expected ts, mp4 or mkv)"),
            }),
        }
    }
}

/// A decrypted segment on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentArtifact {
    pub index: usize,
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct AssemblyRequest {
    /// Ordered by index, contiguous from zero.
    pub segments: Vec<SegmentArtifact>,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    pub output_stem: String,
    pub format: OutputFormat,
}

impl AssemblyRequest {
    pub fn output_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}.{}", self.output_stem, self.format.as_str()))
    }
}

/// Result handed back directly to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssemblyOutput {
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[async_trait]
pub trait Assembler: Send + Sync {
    async fn assemble(
        &self,
        request: AssemblyRequest,
        token: &CancellationToken,
    ) -> Result<AssemblyOutput, TransferError>;
}

async fn output_metadata(path: &Path) -> Result<AssemblyOutput, TransferError> {
    let meta = tokio::fs::metadata(path).await.map_err(|e| {
        TransferError::assembly(format!("output {} missing: {e}", path.display()))
    })?;
    if meta.len() == 0 {
        return Err(TransferError::assembly(format!(
            "output {} is empty",
            path.display()
        )));
    }
    Ok(AssemblyOutput {
        path: path.to_path_buf(),
        size_bytes: meta.len(),
    })
}

/// Byte-concatenates segments in order.
#[derive(Debug, Default, Clone)]
pub struct ConcatAssembler;

impl ConcatAssembler {
    async fn concat(
        request: &AssemblyRequest,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<(), TransferError> {
        let mut out = tokio::fs::File::create(output).await.map_err(|e| {
            TransferError::assembly(format!("cannot create {}: {e}", output.display()))
        })?;
        for segment in &request.segments {
            if token.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let mut input = tokio::fs::File::open(&segment.path).await.map_err(|e| {
                TransferError::assembly(format!(
                    "cannot open segment {}: {e}",
                    segment.path.display()
                ))
            })?;
            tokio::io::copy(&mut input, &mut out).await.map_err(|e| {
                TransferError::assembly(format!("copying segment {}: {e}", segment.index))
            })?;
        }
        out.flush()
            .await
            .map_err(|e| TransferError::assembly(format!("flushing output: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl Assembler for ConcatAssembler {
    async fn assemble(
        &self,
        request: AssemblyRequest,
        token: &CancellationToken,
    ) -> Result<AssemblyOutput, TransferError> {
        if request.segments.is_empty() {
            return Err(TransferError::assembly("no segments to assemble"));
        }
        let output = request.output_path();
        if let Err(e) = Self::concat(&request, &output, token).await {
            let _ = tokio::fs::remove_file(&output).await;
            return Err(e);
        }
        let result = output_metadata(&output).await?;
        info!(
            path = %result.path.display(),
            size = result.size_bytes,
            segments = request.segments.len(),
            "Concatenated segments"
        );
        Ok(result)
    }
}

/// Remuxes segments with `ffmpeg -f concat -c copy`.
#[derive(Debug, Clone)]
pub struct FfmpegAssembler {
    binary_path: String,
}

impl FfmpegAssembler {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    /// Concat-demuxer list: one `file '<path>'` line per segment, relative to
    /// `work_dir` where possible since ffmpeg runs there.
    pub fn concat_list(work_dir: &Path, segments: &[SegmentArtifact]) -> String {
        let mut list = String::new();
        for segment in segments {
            let name = segment
                .path
                .strip_prefix(work_dir)
                .unwrap_or(&segment.path)
                .to_string_lossy()
                .replace('\\', "/");
            // Single quotes inside the name are closed, escaped and reopened.
            list.push_str(&format!("file '{}'\n", name.replace('\'', r"'\''")));
        }
        list
    }

    pub fn build_args(output: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-f".to_string(),
            "concat".to_string(),
            "-safe".to_string(),
            "0".to_string(),
            "-i".to_string(),
            CONCAT_LIST.to_string(),
            "-c".to_string(),
            "copy".to_string(),
            output.to_string_lossy().into_owned(),
        ]
    }

    async fn run(
        &self,
        request: &AssemblyRequest,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<(), TransferError> {
        let args = Self::build_args(output);
        debug!(binary = %self.binary_path, ?args, "Starting ffmpeg remux");

        let mut child = Command::new(&self.binary_path)
            .args(&args)
            .current_dir(&request.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TransferError::assembly(format!("failed to spawn {}: {e}", self.binary_path))
            })?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransferError::assembly("failed to capture ffmpeg stderr"))?;
        let tail_reader = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let status = tokio::select! {
            _ = token.cancelled() => {
                let _ = child.kill().await;
                return Err(TransferError::Cancelled);
            }
            status = child.wait() => status.map_err(|e| {
                TransferError::assembly(format!("waiting for ffmpeg: {e}"))
            })?,
        };

        let tail = tail_reader.await.unwrap_or_default();
        if !status.success() {
            return Err(TransferError::assembly(format!(
                "ffmpeg exited with {status}: {tail}"
            )));
        }
        Ok(())
    }
}

impl Default for FfmpegAssembler {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl Assembler for FfmpegAssembler {
    async fn assemble(
        &self,
        request: AssemblyRequest,
        token: &CancellationToken,
    ) -> Result<AssemblyOutput, TransferError> {
        if request.segments.is_empty() {
            return Err(TransferError::assembly("no segments to assemble"));
        }
        let list_path = request.work_dir.join(CONCAT_LIST);
        tokio::fs::write(&list_path, Self::concat_list(&request.work_dir, &request.segments))
            .await
            .map_err(|e| {
                TransferError::assembly(format!("writing {}: {e}", list_path.display()))
            })?;

        let output = request.output_path();
        let output = if output.is_absolute() {
            output
        } else {
            std::path::absolute(&output).map_err(|e| {
                TransferError::assembly(format!("resolving {}: {e}", output.display()))
            })?
        };

        let result = self.run(&request, &output, token).await;
        if let Err(e) = tokio::fs::remove_file(&list_path).await {
            warn!(path = %list_path.display(), error = %e, "Failed to remove concat list");
        }
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&output).await;
            return Err(e);
        }

        let result = output_metadata(&output).await?;
        info!(
            path = %result.path.display(),
            size = result.size_bytes,
            format = %request.format,
            "Remuxed segments"
        );
        Ok(result)
    }
}

/// Picks [`ConcatAssembler`] for `ts` and [`FfmpegAssembler`] otherwise.
#[derive(Debug, Clone, Default)]
pub struct DefaultAssembler {
    concat: ConcatAssembler,
    ffmpeg: FfmpegAssembler,
}

impl DefaultAssembler {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            concat: ConcatAssembler,
            ffmpeg: FfmpegAssembler::new(ffmpeg_path),
        }
    }
}

#[async_trait]
impl Assembler for DefaultAssembler {
    async fn assemble(
        &self,
        request: AssemblyRequest,
        token: &CancellationToken,
    ) -> Result<AssemblyOutput, TransferError> {
        if request.format.needs_remux() {
            self.ffmpeg.assemble(request, token).await
        } else {
            self.concat.assemble(request, token).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn artifacts(dir: &Path, parts: &[&[u8]]) -> Vec<SegmentArtifact> {
        parts
            .iter()
            .enumerate()
            .map(|(index, data)| {
                let path = dir.join(format!("segment_{index:05}.ts"));
                std::fs::write(&path, data).unwrap();
                SegmentArtifact {
                    index,
                    path,
                    bytes: data.len() as u64,
                }
            })
            .collect()
    }

    fn request(dir: &Path, segments: Vec<SegmentArtifact>, format: OutputFormat) -> AssemblyRequest {
        AssemblyRequest {
            segments,
            work_dir: dir.to_path_buf(),
            output_dir: dir.to_path_buf(),
            output_stem: "movie".to_string(),
            format,
        }
    }

    #[test]
    fn format_parsing() {
        assert_eq!("MP4".parse::<OutputFormat>().unwrap(), OutputFormat::Mp4);
        assert_eq!("ts".parse::<OutputFormat>().unwrap(), OutputFormat::Ts);
        assert!("avi".parse::<OutputFormat>().is_err());
        assert!(!OutputFormat::Ts.needs_remux());
        assert!(OutputFormat::Mkv.needs_remux());
    }

    #[tokio::test]
    async fn concat_preserves_order() {
        let tmp = TempDir::new().unwrap();
        let segments = artifacts(tmp.path(), &[b"one-", b"two-", b"three"]);
        let token = CancellationToken::new();
        let output = ConcatAssembler
            .assemble(request(tmp.path(), segments, OutputFormat::Ts), &token)
            .await
            .unwrap();
        assert_eq!(output.path, tmp.path().join("movie.ts"));
        assert_eq!(std::fs::read(&output.path).unwrap(), b"one-two-three");
        assert_eq!(output.size_bytes, 13);
    }

    #[tokio::test]
    async fn concat_of_nothing_is_an_assembly_error() {
        let tmp = TempDir::new().unwrap();
        let token = CancellationToken::new();
        let err = ConcatAssembler
            .assemble(request(tmp.path(), Vec::new(), OutputFormat::Ts), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Assembly { .. }));
    }

    #[tokio::test]
    async fn concat_missing_segment_removes_partial_output() {
        let tmp = TempDir::new().unwrap();
        let mut segments = artifacts(tmp.path(), &[b"a", b"b"]);
        std::fs::remove_file(&segments[1].path).unwrap();
        segments[1].bytes = 0;
        let token = CancellationToken::new();
        let err = ConcatAssembler
            .assemble(request(tmp.path(), segments, OutputFormat::Ts), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Assembly { .. }));
        assert!(!tmp.path().join("movie.ts").exists());
    }

    #[test]
    fn concat_list_uses_work_dir_relative_paths() {
        let segments = vec![
            SegmentArtifact {
                index: 0,
                path: PathBuf::from("/w/segments/segment_00000.ts"),
                bytes: 1,
            },
            SegmentArtifact {
                index: 1,
                path: PathBuf::from("/w/it's.ts"),
                bytes: 1,
            },
            SegmentArtifact {
                index: 2,
                path: PathBuf::from("/elsewhere/segment_00002.ts"),
                bytes: 1,
            },
        ];
        assert_eq!(
            FfmpegAssembler::concat_list(Path::new("/w"), &segments),
            "file 'segments/segment_00000.ts'\nfile 'it'\\''s.ts'\nfile '/elsewhere/segment_00002.ts'\n"
        );
    }

    #[test]
    fn ffmpeg_args_copy_streams() {
        let args = FfmpegAssembler::build_args(Path::new("/out/movie.mp4"));
        assert_eq!(
            args,
            [
                "-y", "-hide_banner", "-f", "concat", "-safe", "0", "-i", "segments.txt", "-c",
                "copy", "/out/movie.mp4"
            ]
        );
    }

    #[tokio::test]
    async fn missing_ffmpeg_binary_is_an_assembly_error_and_cleans_list() {
        let tmp = TempDir::new().unwrap();
        let segments = artifacts(tmp.path(), &[b"a"]);
        let token = CancellationToken::new();
        let err = FfmpegAssembler::new("/nonexistent/ffmpeg-binary")
            .assemble(request(tmp.path(), segments, OutputFormat::Mp4), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Assembly { .. }));
        assert!(!tmp.path().join(CONCAT_LIST).exists());
        // Segments are left for diagnosis.
        assert!(tmp.path().join("segment_00000.ts").exists());
    }

    #[tokio::test]
    async fn default_assembler_concatenates_ts_without_ffmpeg() {
        let tmp = TempDir::new().unwrap();
        let segments = artifacts(tmp.path(), &[b"x", b"y"]);
        let token = CancellationToken::new();
        let output = DefaultAssembler::new("/nonexistent/ffmpeg-binary")
            .assemble(request(tmp.path(), segments, OutputFormat::Ts), &token)
            .await
            .unwrap();
        assert_eq!(std::fs::read(output.path).unwrap(), b"xy");
    }
}
