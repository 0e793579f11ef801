//! HLS VOD acquisition engine.
//!
//! Fetches an M3U8 playlist, resolves its AES-128 key, downloads and decrypts
//! every segment in order under pause/resume/cancel control, and hands the
//! ordered segment set to an [`assembly::Assembler`].

pub mod assembly;
pub mod cleaner;
pub mod config;
pub mod error;
pub mod hls;
pub mod manager;
pub mod task;

pub use assembly::{
    Assembler, AssemblyOutput, AssemblyRequest, ConcatAssembler, DefaultAssembler,
    FfmpegAssembler, OutputFormat, SegmentArtifact,
};
pub use cleaner::{SweepReport, sweep_stale_work_dirs};
pub use config::{
    AssemblerConfig, CleanupConfig, DownloaderConfig, EngineConfig, FetcherConfig,
    ManagerConfig, TransferConfig, create_client,
};
pub use error::TransferError;
pub use hls::{TransferSnapshot, TransferStatus};
pub use manager::DownloadManager;
pub use task::DownloadTask;
