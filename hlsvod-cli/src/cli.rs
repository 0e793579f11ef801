use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use hlsvod_engine::OutputFormat;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "hlsvod", author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file (defaults to <config dir>/hlsvod/config.toml)
    #[arg(long, global = true, env = "HLSVOD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download one or more HLS VOD playlists
    Download(DownloadArgs),

    /// Remove stale transfer work directories
    Sweep {
        /// Override the configured maximum age in days (0 disables the sweep)
        #[arg(long)]
        max_age_days: Option<u64>,

        /// Override the work root
        #[arg(long)]
        work_dir: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct DownloadArgs {
    /// Playlist URLs (media or master)
    #[arg(required = true, num_args = 1..)]
    pub urls: Vec<String>,

    /// Output file name without extension; numbered when several URLs are given
    #[arg(short, long)]
    pub output: Option<String>,

    /// Output container
    #[arg(short, long, value_enum)]
    pub format: Option<FormatArg>,

    /// Directory holding per-transfer work directories
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Directory the assembled files are written to
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub insecure: bool,

    /// Retries per segment after the first attempt
    #[arg(long)]
    pub retries: Option<u32>,

    /// Maximum transfers running at once
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Keep segment files after a successful assembly
    #[arg(long)]
    pub keep_segments: bool,

    /// Path to the ffmpeg binary used for mp4/mkv output
    #[arg(long)]
    pub ffmpeg: Option<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatArg {
    Ts,
    Mp4,
    Mkv,
}

impl From<FormatArg> for OutputFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Ts => OutputFormat::Ts,
            FormatArg::Mp4 => OutputFormat::Mp4,
            FormatArg::Mkv => OutputFormat::Mkv,
        }
    }
}
