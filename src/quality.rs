use anyhow::Result;
use sqlx::PgPool;

use crate::types::QualityRecord;

/// Persist one chunk's raw outcome counts. `quality_level` is never
/// written here: the table derives it from these counts via a generated
/// column, so two writers computing it differently can never disagree.
pub async fn record(pool: &PgPool, record: &QualityRecord) -> Result<()> {
    debug_assert!(record.is_consistent(), "quality record counts are inconsistent");

    sqlx::query(
        r#"
        INSERT INTO data_quality_monitor (
            monitored_at, source_file, operation, target_table, chunk_number, session_id,
            rows_attempted, rows_inserted, rows_updated, rows_deleted, rows_duplicates,
            rows_invalid, rows_skipped, duration_ms,
            violation_null, violation_constraint, violation_data_type,
            violation_business_rule, violation_referential_integrity
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        "#,
    )
    .bind(record.monitored_at)
    .bind(&record.source_file)
    .bind(record.operation.as_db_str())
    .bind(&record.target_table)
    .bind(record.chunk_number as i64)
    .bind(&record.session_id)
    .bind(record.rows_attempted)
    .bind(record.rows_inserted)
    .bind(record.rows_updated)
    .bind(record.rows_deleted)
    .bind(record.rows_duplicates)
    .bind(record.rows_invalid)
    .bind(record.rows_skipped)
    .bind(record.duration_ms)
    .bind(record.violation_null)
    .bind(record.violation_constraint)
    .bind(record.violation_data_type)
    .bind(record.violation_business_rule)
    .bind(record.violation_referential_integrity)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch the worst (lowest) `quality_level` seen for `source_file`, for
/// the end-of-month summary log line.
pub async fn worst_quality_level(pool: &PgPool, source_file: &str) -> Result<Option<String>> {
    let level: Option<String> = sqlx::query_scalar(
        r#"
        SELECT quality_level FROM data_quality_monitor
        WHERE source_file = $1
        ORDER BY CASE quality_level
            WHEN 'CRITICAL' THEN 0
            WHEN 'POOR' THEN 1
            WHEN 'ACCEPTABLE' THEN 2
            WHEN 'GOOD' THEN 3
            WHEN 'EXCELLENT' THEN 4
            ELSE 5
        END
        LIMIT 1
        "#,
    )
    .bind(source_file)
    .fetch_optional(pool)
    .await?;

    Ok(level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperationKind;
    use chrono::Utc;

    #[test]
    fn consistent_record_passes_debug_assert_precondition() {
        let record = QualityRecord {
            monitored_at: Utc::now(),
            source_file: "x.parquet".into(),
            operation: OperationKind::NormalizedLoad,
            target_table: "yellow_taxi_trips".into(),
            chunk_number: 1,
            session_id: "s".into(),
            rows_attempted: 100,
            rows_inserted: 90,
            rows_updated: 0,
            rows_deleted: 0,
            rows_duplicates: 5,
            rows_invalid: 5,
            rows_skipped: 0,
            duration_ms: 10,
            violation_null: 0,
            violation_constraint: 0,
            violation_data_type: 0,
            violation_business_rule: 0,
            violation_referential_integrity: 0,
        };
        assert!(record.is_consistent());
    }
}
