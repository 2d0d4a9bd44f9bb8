use clap::Parser;
use stagehand::{Config, PhaseToggles, Pipeline, run_with_shutdown};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_LOG_FILTER: &str = "stagehand=info";

/// Bounded-parallel orchestrator for extraction, download and post-processing workers
#[derive(Debug, Parser)]
#[command(name = "stagehand", version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "stagehand.json")]
    config: PathBuf,

    /// Write a default configuration to the config path and exit
    #[arg(long)]
    generate_config: bool,

    /// Only post-process (skip extraction and download)
    #[arg(long)]
    only_postprocess: bool,

    /// Skip unarchiving existing archives
    #[arg(long)]
    no_unarchive: bool,

    /// Skip page extraction
    #[arg(long)]
    no_extract: bool,

    /// Skip downloading
    #[arg(long)]
    no_download: bool,

    /// Skip post-processing
    #[arg(long)]
    no_postprocess: bool,

    /// Skip re-archiving and copying to the repository
    #[arg(long)]
    no_rearchive: bool,
}

impl Args {
    fn toggles(&self) -> PhaseToggles {
        let base = if self.only_postprocess {
            PhaseToggles::only_postprocess()
        } else {
            PhaseToggles::default()
        };
        PhaseToggles {
            skip_unarchive: base.skip_unarchive || self.no_unarchive,
            skip_extract: base.skip_extract || self.no_extract,
            skip_download: base.skip_download || self.no_download,
            skip_postprocess: base.skip_postprocess || self.no_postprocess,
            skip_rearchive: base.skip_rearchive || self.no_rearchive,
        }
    }
}

fn init_logging(log_folder: &Path) -> stagehand::Result<WorkerGuard> {
    std::fs::create_dir_all(log_folder)?;
    let file_appender = tracing_appender::rolling::never(log_folder, "stagehand.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(true))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()
        .map_err(|e| stagehand::Error::Other(format!("failed to set global subscriber: {e}")))?;
    Ok(guard)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.generate_config {
        return match Config::write_default(&args.config) {
            Ok(()) => {
                println!("default configuration written to {}", args.config.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _guard = match init_logging(&config.log_folder) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let toggles = args.toggles();
    let cancel = CancellationToken::new();
    let pipeline = Pipeline::new(config, cancel.clone());

    match run_with_shutdown(pipeline.run(toggles), cancel).await {
        Ok(summary) => {
            for phase in &summary.phases {
                tracing::info!(
                    phase = %phase.name,
                    total = phase.total,
                    succeeded = phase.succeeded,
                    failed = phase.failed,
                    "phase summary"
                );
            }
            if summary.archive_chain_ok == Some(false) {
                tracing::warn!("archiving did not fully succeed");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn only_postprocess_combines_with_other_flags() {
        let args = Args::parse_from(["stagehand", "--only-postprocess", "--no-rearchive"]);
        let toggles = args.toggles();
        assert!(toggles.skip_extract);
        assert!(toggles.skip_download);
        assert!(!toggles.skip_postprocess);
        assert!(toggles.skip_rearchive);
        assert!(!toggles.skip_unarchive);
        assert_eq!(args.config, PathBuf::from("stagehand.json"));
    }
}
