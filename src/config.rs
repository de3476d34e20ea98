use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use crate::backfill_planner::BackfillSpec;
use crate::error::PipelineError;

const MIN_CHUNK_SIZE: usize = 1_000;
const MAX_CHUNK_SIZE: usize = 1_000_000;

#[derive(Parser, Debug, Clone)]
#[command(name = "tlc-taxi-pipeline")]
#[command(about = "Resumable, chunked backfill pipeline for TLC Yellow Taxi trip records into PostgreSQL/PostGIS")]
pub struct Config {
    /// PostgreSQL host
    #[arg(long, env = "DATABASE_HOST", default_value = "localhost")]
    pub database_host: String,

    /// PostgreSQL port
    #[arg(long, env = "DATABASE_PORT", default_value = "5432")]
    pub database_port: u16,

    /// PostgreSQL database name
    #[arg(long, env = "DATABASE_NAME", default_value = "taxi")]
    pub database_name: String,

    /// PostgreSQL user
    #[arg(long, env = "DATABASE_USER", default_value = "postgres")]
    pub database_user: String,

    /// PostgreSQL password
    #[arg(long, env = "DATABASE_PASSWORD", default_value = "postgres")]
    pub database_password: String,

    /// Rows per chunk when streaming a monthly parquet file (1,000-1,000,000)
    #[arg(long, env = "CHUNK_SIZE", default_value = "100000")]
    pub chunk_size: usize,

    /// Backfill spec: "" | comma-separated YYYY-MM list | last_6_months | last_12_months | all
    #[arg(long, env = "BACKFILL_SPEC", default_value = "")]
    pub backfill_spec: String,

    /// Whether to run the trip loader after schema/reference bootstrap
    #[arg(long, env = "INIT_LOAD_ALL_DATA", default_value = "true")]
    pub init_load_all_data: bool,

    /// Root directory for the local parquet and zone caches
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Root directory for run logs
    #[arg(long, env = "LOG_DIR", default_value = "./logs")]
    pub log_dir: PathBuf,
}

impl Config {
    /// Load configuration from environment and CLI arguments.
    pub fn load() -> Result<Self> {
        // Load .env file if present (ignore if not found)
        let _ = dotenvy::dotenv();

        let config = Self::parse();

        if config.chunk_size < MIN_CHUNK_SIZE || config.chunk_size > MAX_CHUNK_SIZE {
            return Err(PipelineError::Config(format!(
                "chunk_size {} out of range [{}, {}]",
                config.chunk_size, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            ))
            .into());
        }

        // Parsing validates the spec string; the parsed value is recomputed
        // by whoever plans months, so we only keep the validation side effect.
        BackfillSpec::parse(&config.backfill_spec)
            .map_err(|e| PipelineError::Config(e.to_string()))?;

        Ok(config)
    }

    /// The backfill spec, parsed from the raw CLI/env string.
    pub fn backfill_spec(&self) -> Result<BackfillSpec> {
        BackfillSpec::parse(&self.backfill_spec).map_err(|e| PipelineError::Config(e.to_string()).into())
    }

    /// Run logs land under `log_dir/<backfill_label>/`, one file per run.
    pub fn log_file_dir(&self) -> PathBuf {
        let label = if self.backfill_spec.is_empty() {
            "empty".to_string()
        } else {
            self.backfill_spec.replace(['/', ' '], "_")
        };
        self.log_dir.join(label)
    }

    /// Print configuration summary.
    pub fn print_summary(&self) {
        tracing::info!("Configuration:");
        tracing::info!("  Database: {}@{}:{}/{}", self.database_user, self.database_host, self.database_port, self.database_name);
        tracing::info!("  Chunk Size: {}", self.chunk_size);
        tracing::info!("  Backfill Spec: {:?}", self.backfill_spec);
        tracing::info!("  Init Load All Data: {}", self.init_load_all_data);
        tracing::info!("  Data Dir: {:?}", self.data_dir);
        tracing::info!("  Log Dir: {:?}", self.log_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            database_host: "localhost".to_string(),
            database_port: 5432,
            database_name: "taxi".to_string(),
            database_user: "postgres".to_string(),
            database_password: "postgres".to_string(),
            chunk_size: 100_000,
            backfill_spec: "2024-01".to_string(),
            init_load_all_data: true,
            data_dir: PathBuf::from("./data"),
            log_dir: PathBuf::from("./logs"),
        }
    }

    #[test]
    fn chunk_size_within_bounds_is_fine() {
        let config = base_config();
        assert!(config.chunk_size >= MIN_CHUNK_SIZE && config.chunk_size <= MAX_CHUNK_SIZE);
    }

    #[test]
    fn log_file_dir_sanitizes_backfill_label() {
        let mut config = base_config();
        config.backfill_spec = "2024-01,2024-02".to_string();
        assert_eq!(config.log_file_dir(), PathBuf::from("./logs/2024-01,2024-02"));
    }

    #[test]
    fn log_file_dir_uses_empty_label_for_empty_spec() {
        let mut config = base_config();
        config.backfill_spec = "".to_string();
        assert_eq!(config.log_file_dir(), PathBuf::from("./logs/empty"));
    }

    #[test]
    fn backfill_spec_parses_from_raw_string() {
        let config = base_config();
        assert!(config.backfill_spec().is_ok());
    }
}
