//! kobo-imgs-rs — keeps a local mirror of KoBoToolbox image attachments.
//!
//! Each run lists the selected assets, finds their image fields, fetches
//! submissions, decides per (submission, field) whether the local image
//! should be kept or retired, and then downloads, confirms, or retires
//! files. Per-field manifests make re-runs incremental.

#![warn(clippy::all)]

mod cli;
mod config;
mod kobo;
mod pipeline;
mod progress;
pub mod retry;
mod shutdown;
mod store;
mod sync;
mod types;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use kobo::{Fetcher, KoboApi};
use pipeline::layout::OutputLayout;
use pipeline::{Pipeline, PipelineOutcome};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    let config = config::Config::from_cli(cli)?;
    tracing::debug!(?config, "Resolved configuration");
    tracing::info!(
        api = %config.api_server_url,
        output = %config.output_dir.display(),
        "Starting kobo-imgs-rs"
    );

    let client = reqwest::Client::builder()
        .connect_timeout(config.request_timeout)
        .user_agent(concat!("kobo-imgs-rs/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let fetcher = Fetcher::new(
        Arc::new(client),
        config.token.clone(),
        config.max_request_retries,
        config.connection_timeout,
    );
    let api = KoboApi::new(fetcher, &config.api_server_url, &config.media_server_url);

    let layout = OutputLayout::create(&config.output_dir).await?;
    let shutdown_token = shutdown::install_signal_handler()?;

    let outcome = Pipeline::new(&api, &config, layout, shutdown_token)
        .run()
        .await?;

    match outcome {
        PipelineOutcome::Completed(summary) => {
            if summary.interrupted() {
                tracing::info!("Shutdown requested, stopped before all images were processed");
            }
            if summary.totals.errors > 0 {
                tracing::warn!(
                    "{} image(s) could not be synchronized; see the log and the stage 5 snapshot",
                    summary.totals.errors
                );
            }
        }
        PipelineOutcome::Stopped { stage, reason } => {
            tracing::info!("Stopping after stage {}: {}", stage, reason);
        }
        PipelineOutcome::Interrupted { stage } => {
            tracing::info!("Shutdown requested, stopped after stage {}", stage);
        }
    }

    Ok(())
}
