use crate::cli::DownloadArgs;
use crate::error::{AppError, Result};
use hlsvod_engine::EngineConfig;
use std::path::{Path, PathBuf};
use tracing::debug;

/// `<config dir>/hlsvod/config.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("hlsvod").join("config.toml"))
}

/// Load the engine configuration.
///
/// An explicit `path` must exist. The default location is optional and falls
/// back to built-in defaults.
pub fn load(path: Option<&Path>) -> Result<EngineConfig> {
    let (path, required) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => match default_config_path() {
            Some(path) => (path, false),
            None => return Ok(EngineConfig::default()),
        },
    };

    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(EngineConfig::default());
        }
        Err(e) => {
            return Err(AppError::Config {
                path: path.display().to_string(),
                reason: e.to_string(),
            });
        }
    };

    let config = toml::from_str(&text).map_err(|e| AppError::Config {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    debug!(path = %path.display(), "Loaded config file");
    Ok(config)
}

/// Command line flags win over the file.
pub fn apply_download_overrides(config: &mut EngineConfig, args: &DownloadArgs) {
    if let Some(work_dir) = &args.work_dir {
        config.transfer.work_root = work_dir.clone();
    }
    if let Some(output_dir) = &args.output_dir {
        config.transfer.output_dir = Some(output_dir.clone());
    }
    if let Some(format) = args.format {
        config.transfer.output_format = format.into();
    }
    if args.insecure {
        config.downloader.verify_tls = false;
    }
    if let Some(retries) = args.retries {
        config.fetcher.max_segment_retries = retries;
    }
    if let Some(concurrency) = args.concurrency {
        config.manager.max_concurrent_downloads = concurrency.max(1);
    }
    if args.keep_segments {
        config.transfer.keep_segments = true;
    }
    if let Some(ffmpeg) = &args.ffmpeg {
        config.assembler.ffmpeg_path = ffmpeg.clone();
    }
}

pub fn show(config: &EngineConfig) -> Result<String> {
    toml::to_string_pretty(config).map_err(|e| AppError::InvalidInput(e.to_string()))
}
