//! # stagehand
//!
//! Orchestrator for a pipeline of external worker processes.
//!
//! A run reads a list of member ids, asks an extractor for per-member data,
//! splits each member into pages and drives the pages through extraction,
//! download and post-processing with bounded parallelism per phase. Workers
//! report back over two ZeroMQ ROUTER endpoints: a Communication endpoint for
//! handshakes and progress, and a Task Request endpoint for brokered sub-work
//! (ffmpeg) and batched downloader input.
//!
//! ## Quick Start
//!
//! ```no_run
//! use stagehand::{Config, Pipeline, PhaseToggles, run_with_shutdown};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("stagehand.json".as_ref())?;
//!     let cancel = CancellationToken::new();
//!     let pipeline = Pipeline::new(config, cancel.clone());
//!
//!     let summary = run_with_shutdown(pipeline.run(PhaseToggles::default()), cancel).await?;
//!     println!("{} pages processed", summary.pages);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Sub-work (ffmpeg) broker
pub mod broker;
/// Configuration types
pub mod config;
/// Per-run orchestration context
pub mod context;
/// Batching downloader-input queue
pub mod download_queue;
/// Error types
pub mod error;
/// ZeroMQ control plane
pub mod ipc;
/// Phase scheduler
pub mod pipeline;
/// External process invocation
pub mod process;
/// Core types
pub mod types;

pub use broker::{FfmpegRunner, SubworkRunner, TaskBroker, TaskState};
pub use config::Config;
pub use context::OrchestrationContext;
pub use download_queue::{AppendSink, DownloadQueue, FileAppendSink, FlushReport};
pub use error::{Error, PipelineError, ProtocolError, Result};
pub use pipeline::Pipeline;
pub use process::{CommandSpec, ProcessLauncher, TokioProcessLauncher};
pub use types::{
    ItemOutcome, Member, MemberId, Page, PhaseReport, PhaseToggles, RunSummary, TaskId,
};

use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Drive `work` to completion, cancelling `cancel` on a termination signal
///
/// The work future keeps running after the signal so it can wind down
/// through its own cancellation checks and report what it finished.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown<F, T>(work: F, cancel: CancellationToken) -> T
where
    F: Future<Output = T>,
{
    tokio::pin!(work);
    tokio::select! {
        output = &mut work => return output,
        _ = wait_for_signal() => {
            tracing::warn!("shutdown requested, cancelling outstanding work");
            cancel.cancel();
        }
    }
    work.await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
