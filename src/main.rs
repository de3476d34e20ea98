mod backfill_planner;
mod chunk_loader;
mod config;
mod db;
mod dimension_cache;
mod error;
mod fetcher;
mod fingerprint;
mod orchestrator;
mod processing_log;
mod quality;
mod reference_loader;
mod schema;
mod shutdown;
mod transformer;
mod types;

use anyhow::{Context, Result};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use config::Config;
use error::PipelineError;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    let _log_guard = init_tracing(&config)?;
    config.print_summary();

    let signal = shutdown::install();

    match orchestrator::run(&config, signal).await {
        Ok(outcome) => std::process::exit(outcome.exit_code),
        Err(e) => {
            let exit_code = e.downcast_ref::<PipelineError>().map(|pe| pe.exit_code()).unwrap_or(1);
            tracing::error!("Pipeline failed: {:#}", e);
            std::process::exit(exit_code);
        }
    }
}

/// Install the console subscriber plus a per-run file sink under
/// `log_dir/<backfill_label>/`. The returned guard must stay alive for
/// the process lifetime: dropping it early stops the file appender from
/// flushing.
fn init_tracing(config: &Config) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = config.log_file_dir();
    std::fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let file_appender = tracing_appender::rolling::never(&log_dir, "run.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(non_blocking.and(std::io::stdout))
        .init();

    Ok(guard)
}
