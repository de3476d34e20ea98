use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;

use crate::types::ProcessingLogRow;

/// Fetch the `data_processing_log` row for (year, month), if any.
pub async fn get(pool: &PgPool, year: i32, month: i32) -> Result<Option<ProcessingLogRow>> {
    let row = sqlx::query_as::<_, ProcessingLogRow>(
        r#"
        SELECT data_year, data_month, source_file, records_loaded,
               started_at, completed_at, backfill_label, status, attempt_count
        FROM data_processing_log
        WHERE data_year = $1 AND data_month = $2
        "#,
    )
    .bind(year)
    .bind(month)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Insert or reopen a (year, month) row as `in_progress`, bumping
/// `attempt_count` on retry. Unique on (data_year, data_month).
pub async fn mark_in_progress(
    pool: &PgPool,
    year: i32,
    month: i32,
    source_file: &str,
    backfill_label: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO data_processing_log
            (data_year, data_month, source_file, records_loaded, started_at, completed_at, backfill_label, status, attempt_count)
        VALUES ($1, $2, $3, 0, $4, NULL, $5, 'in_progress', 1)
        ON CONFLICT (data_year, data_month) DO UPDATE SET
            source_file = EXCLUDED.source_file,
            started_at = EXCLUDED.started_at,
            completed_at = NULL,
            backfill_label = EXCLUDED.backfill_label,
            status = 'in_progress',
            attempt_count = data_processing_log.attempt_count + 1
        "#,
    )
    .bind(year)
    .bind(month)
    .bind(source_file)
    .bind(Utc::now())
    .bind(backfill_label)
    .execute(pool)
    .await?;

    Ok(())
}

/// Mark (year, month) completed with the total records loaded.
pub async fn mark_completed(pool: &PgPool, year: i32, month: i32, records_loaded: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE data_processing_log
        SET status = 'completed', records_loaded = $3, completed_at = $4
        WHERE data_year = $1 AND data_month = $2
        "#,
    )
    .bind(year)
    .bind(month)
    .bind(records_loaded)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Mark (year, month) failed on a terminal per-month error (NETWORK, NOTFOUND).
pub async fn mark_failed(pool: &PgPool, year: i32, month: i32) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE data_processing_log
        SET status = 'failed'
        WHERE data_year = $1 AND data_month = $2
        "#,
    )
    .bind(year)
    .bind(month)
    .execute(pool)
    .await?;

    Ok(())
}

/// Leave (year, month) `in_progress` with its current partial record count,
/// for a graceful-shutdown resume point.
pub async fn checkpoint_partial(pool: &PgPool, year: i32, month: i32, records_loaded: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE data_processing_log
        SET records_loaded = $3
        WHERE data_year = $1 AND data_month = $2
        "#,
    )
    .bind(year)
    .bind(month)
    .bind(records_loaded)
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_log_row_status_roundtrips_through_db_strings() {
        use crate::types::ProcessingStatus;
        assert_eq!(ProcessingStatus::from_db_str("completed"), Some(ProcessingStatus::Completed));
        assert_eq!(ProcessingStatus::from_db_str("bogus"), None);
    }
}
