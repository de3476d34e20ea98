use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use sqlx::PgPool;
use std::time::Instant;

use crate::config::Config;
use crate::shutdown::{ShutdownSignal, SHUTDOWN_EXIT_CODE};
use crate::types::{format_year_month, MonthDisposition, PlannedMonth, QualityRecord};
use crate::{backfill_planner, chunk_loader, db, dimension_cache, fetcher, processing_log, quality, reference_loader, schema, transformer};

/// Top-level run outcome: a process exit code plus the run summary that
/// was logged along the way.
pub struct RunOutcome {
    pub exit_code: i32,
}

/// Bootstrap the database, load reference data, build the dimension
/// cache, plan the backfill, and drive the per-month normalized and
/// dimensional loads. Mirrors the single top-to-bottom sequence a
/// resumable batch job runs every time it starts: nothing here depends
/// on in-memory state from a previous process.
pub async fn run(config: &Config, signal: ShutdownSignal) -> Result<RunOutcome> {
    let session_id = uuid_like_session_id();
    let pool = db::create_pool(config).await?;
    db::test_connection(&pool).await?;

    schema::bootstrap(&pool).await?;
    db::verify_postgis(&pool).await?;

    tokio::fs::create_dir_all(&config.data_dir).await.ok();
    let zone_lookup_csv = fetcher::fetch_zone_lookup(&config.data_dir).await?;
    reference_loader::load_zone_lookup(&pool, &zone_lookup_csv).await?;
    let zone_shapefile_dir = fetcher::fetch_zone_shapefile(&config.data_dir).await?;
    reference_loader::load_zone_shapes(&pool, &zone_shapefile_dir).await?;

    backfill_sync_dim_locations(&pool).await?;

    let cache = dimension_cache::build(&pool).await?;

    if !config.init_load_all_data {
        tracing::info!("init_load_all_data is false, skipping trip data backfill");
        return Ok(RunOutcome { exit_code: 0 });
    }

    let backfill_spec = config.backfill_spec()?;
    let today = chrono::Utc::now().date_naive();
    let plan = backfill_planner::plan(&backfill_spec, &config.data_dir, &pool, today).await?;

    let runnable: Vec<&PlannedMonth> = plan
        .iter()
        .filter(|m| !matches!(m.disposition, MonthDisposition::Skip { .. }))
        .collect();

    tracing::info!(
        total_planned = plan.len(),
        runnable = runnable.len(),
        "backfill plan resolved"
    );

    schema::ensure_partitions_for_range(&pool, &runnable.iter().map(|m| (m.year, m.month)).collect::<Vec<_>>()).await?;

    let started = Instant::now();
    let pb = ProgressBar::new(runnable.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} months ({per_sec}) ETA: {eta}")
            .unwrap()
            .progress_chars("=>-"),
    );

    let mut all_records: Vec<QualityRecord> = Vec::new();
    let mut months_completed = 0u64;
    let mut interrupted = false;

    for planned in runnable {
        if signal.is_requested() {
            tracing::warn!("Shutdown requested, stopping before starting the next month");
            interrupted = true;
            break;
        }

        let label = format_year_month(planned.year, planned.month);
        let source_file = format!("yellow_tripdata_{label}.parquet");

        processing_log::mark_in_progress(&pool, planned.year, planned.month, &source_file, &config.backfill_spec).await?;

        match run_month(&pool, &cache, config, planned.year, planned.month, &source_file, &session_id, &signal).await {
            Ok((records, rows_loaded, was_interrupted)) => {
                all_records.extend(records);
                if was_interrupted {
                    processing_log::checkpoint_partial(&pool, planned.year, planned.month, rows_loaded).await?;
                    interrupted = true;
                } else {
                    processing_log::mark_completed(&pool, planned.year, planned.month, rows_loaded).await?;
                    months_completed += 1;
                }
            }
            Err(e) => {
                tracing::error!(month = %label, error = %e, "month failed");
                processing_log::mark_failed(&pool, planned.year, planned.month).await?;
            }
        }

        pb.inc(1);
        if interrupted {
            break;
        }
    }

    pb.finish_with_message("backfill run complete");

    log_run_summary(&all_records, months_completed, started.elapsed());

    if interrupted {
        Ok(RunOutcome { exit_code: SHUTDOWN_EXIT_CODE })
    } else {
        Ok(RunOutcome { exit_code: 0 })
    }
}

/// Run the normalized load then the dimensional load for one month,
/// checking the shutdown signal between the two stages. Returns the
/// quality records produced, the row count loaded so far (for a partial
/// checkpoint), and whether the signal fired mid-month.
async fn run_month(
    pool: &PgPool,
    cache: &dimension_cache::DimensionCache,
    config: &Config,
    year: i32,
    month: u32,
    source_file: &str,
    session_id: &str,
    signal: &ShutdownSignal,
) -> Result<(Vec<QualityRecord>, i64, bool)> {
    let path = fetcher::fetch_month(&config.data_dir, year, month).await?;

    let normalized_records = chunk_loader::load_month(pool, &path, source_file, config.chunk_size, session_id).await?;
    let rows_loaded: i64 = normalized_records.iter().map(|r| r.rows_inserted).sum();

    if signal.is_requested() {
        return Ok((normalized_records, rows_loaded, true));
    }

    let dimensional_records = transformer::load_month(pool, cache, year, month, source_file, session_id).await?;

    let mut records = normalized_records;
    records.extend(dimensional_records);

    if let Some(level) = quality::worst_quality_level(pool, source_file).await? {
        tracing::info!(month = %format_year_month(year, month), quality_level = %level, "month quality summary");
    }

    Ok((records, rows_loaded, signal.is_requested()))
}

/// Refresh `dim_locations` from `taxi_zone_lookup`, computing the
/// derived flags the dimension cache and transformer rely on.
async fn backfill_sync_dim_locations(pool: &PgPool) -> Result<()> {
    let zones: Vec<(i32, String, String, String)> =
        sqlx::query_as("SELECT locationid, borough, zone, service_zone FROM taxi_zone_lookup")
            .fetch_all(pool)
            .await?;

    for (locationid, borough, zone, service_zone) in zones {
        let is_airport = dimension_cache::is_airport_zone(&zone);
        let is_manhattan = dimension_cache::is_manhattan_borough(&borough);
        let is_business_district = is_manhattan && !is_airport;
        let zone_type = if is_airport {
            "airport"
        } else if is_manhattan {
            "manhattan"
        } else {
            "standard"
        };

        sqlx::query(
            r#"
            INSERT INTO dim_locations (locationid, borough, zone, service_zone, is_airport, is_manhattan, is_business_district, zone_type)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (locationid) DO UPDATE SET
                borough = EXCLUDED.borough,
                zone = EXCLUDED.zone,
                service_zone = EXCLUDED.service_zone,
                is_airport = EXCLUDED.is_airport,
                is_manhattan = EXCLUDED.is_manhattan,
                is_business_district = EXCLUDED.is_business_district,
                zone_type = EXCLUDED.zone_type
            "#,
        )
        .bind(locationid)
        .bind(&borough)
        .bind(&zone)
        .bind(&service_zone)
        .bind(is_airport)
        .bind(is_manhattan)
        .bind(is_business_district)
        .bind(zone_type)
        .execute(pool)
        .await?;
    }

    Ok(())
}

fn log_run_summary(records: &[QualityRecord], months_completed: u64, elapsed: std::time::Duration) {
    let attempted: i64 = records.iter().map(|r| r.rows_attempted).sum();
    let inserted: i64 = records.iter().map(|r| r.rows_inserted).sum();
    let duplicates: i64 = records.iter().map(|r| r.rows_duplicates).sum();
    let invalid: i64 = records.iter().map(|r| r.rows_invalid).sum();

    tracing::info!("=== Backfill Summary ===");
    tracing::info!("Months completed: {}", months_completed);
    tracing::info!("Rows attempted: {}", attempted);
    tracing::info!("Rows inserted: {}", inserted);
    tracing::info!("Rows duplicate: {}", duplicates);
    tracing::info!("Rows invalid: {}", invalid);
    tracing::info!("Elapsed: {:.2}s", elapsed.as_secs_f64());
}

/// A process-local session identifier for correlating quality records
/// from one run, without pulling in a UUID crate for a value that's
/// never parsed back.
fn uuid_like_session_id() -> String {
    let pid = std::process::id();
    format!("session-{pid}-{}", chrono::Utc::now().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_stable_in_shape() {
        let id = uuid_like_session_id();
        assert!(id.starts_with("session-"));
    }
}
