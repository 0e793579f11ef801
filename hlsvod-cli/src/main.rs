mod cli;
mod commands;
mod config;
mod error;
mod output;

use crate::{
    cli::{Args, Commands},
    error::Result,
};
use clap::Parser;
use std::process;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args).await {
        error!("Application error: {}", e);
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut engine_config = config::load(args.config.as_deref())?;

    match args.command {
        Commands::Download(download) => {
            config::apply_download_overrides(&mut engine_config, &download);
            commands::download(engine_config, download).await?;
        }
        Commands::Sweep {
            max_age_days,
            work_dir,
        } => {
            commands::sweep(engine_config, max_age_days, work_dir).await?;
        }
        Commands::Config => {
            println!("{}", config::show(&engine_config)?);
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = log_filter(verbose, quiet, std::env::var(EnvFilter::DEFAULT_ENV).ok());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_level(verbose)
                .with_writer(std::io::stderr),
        )
        .init();
}

/// `-q`/`-v` win; otherwise `RUST_LOG` as given, falling back to `info`.
fn log_filter(verbose: bool, quiet: bool, env: Option<String>) -> EnvFilter {
    if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        env.and_then(|directives| EnvFilter::try_new(directives).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}
