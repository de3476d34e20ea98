use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The 20 domain columns of a trip, in the exact order used for
/// fingerprinting (`fingerprint::CANONICAL_COLUMNS`) and for the
/// `yellow_taxi_trips` table. `row_hash` is not itself a domain column:
/// it is derived from these.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TripRow {
    pub vendor_id: Option<i32>,
    pub pickup_datetime: DateTime<Utc>,
    pub dropoff_datetime: DateTime<Utc>,
    pub passenger_count: Option<i32>,
    pub trip_distance: Option<f64>,
    pub rate_code_id: Option<i32>,
    pub store_and_fwd_flag: Option<String>,
    pub pickup_location_id: Option<i32>,
    pub dropoff_location_id: Option<i32>,
    pub payment_type: Option<i32>,
    pub fare_amount: Option<Decimal>,
    pub extra: Option<Decimal>,
    pub mta_tax: Option<Decimal>,
    pub tip_amount: Option<Decimal>,
    pub tolls_amount: Option<Decimal>,
    pub improvement_surcharge: Option<Decimal>,
    pub total_amount: Option<Decimal>,
    pub congestion_surcharge: Option<Decimal>,
    pub airport_fee: Option<Decimal>,
    pub cbd_congestion_fee: Option<Decimal>,
}

/// A row rejected during ingestion, carrying every `TripRow` field
/// (all nullable here, since the row may have failed precisely because
/// one of them didn't parse) plus forensic context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidTripRow {
    pub id: i64,
    pub failed_at: DateTime<Utc>,
    pub error_type: ErrorCategory,
    pub error_message: String,
    pub source_file: String,
    pub chunk_number: u64,
    pub row_number_in_chunk: usize,
    pub raw_data: JsonValue,
}

/// Error category tag stored alongside an invalid row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    PrimaryKeyViolation,
    ConstraintViolation,
    TypeError,
    ReferentialIntegrity,
    Other,
}

impl ErrorCategory {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ErrorCategory::PrimaryKeyViolation => "primary_key_violation",
            ErrorCategory::ConstraintViolation => "constraint_violation",
            ErrorCategory::TypeError => "type_error",
            ErrorCategory::ReferentialIntegrity => "referential_integrity",
            ErrorCategory::Other => "other",
        }
    }
}

/// `taxi_zone_lookup` row (263 after null cleanup).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ZoneLookup {
    pub locationid: i32,
    pub borough: String,
    pub zone: String,
    pub service_zone: String,
}

/// `taxi_zone_shapes` row. `geometry_wkb` is the EPSG:2263 multipolygon
/// encoded as well-known binary, ready for `ST_GeomFromWKB($1, 2263)`.
#[derive(Debug, Clone)]
pub struct ZoneShape {
    pub objectid: i32,
    pub locationid: i32,
    pub zone: String,
    pub borough: String,
    pub shape_leng: f64,
    pub shape_area: f64,
    pub geometry_wkb: Vec<u8>,
}

/// One dimension-cache entry for a location: surrogate key plus the
/// flags the transformer needs without a second join.
#[derive(Debug, Clone)]
pub struct LocationDimEntry {
    pub location_key: i32,
    pub borough: String,
    pub zone: String,
    pub is_airport: bool,
    pub is_manhattan: bool,
}

/// One row per (year, month) attempted; unique on (data_year, data_month).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcessingLogRow {
    pub data_year: i32,
    pub data_month: i32,
    pub source_file: String,
    pub records_loaded: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub backfill_label: String,
    pub status: String,
    pub attempt_count: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    InProgress,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ProcessingStatus::InProgress => "in_progress",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(ProcessingStatus::InProgress),
            "completed" => Some(ProcessingStatus::Completed),
            "failed" => Some(ProcessingStatus::Failed),
            _ => None,
        }
    }
}

/// Operation kind a `QualityRecord` was produced by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    NormalizedLoad,
    DimensionalLoad,
}

impl OperationKind {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            OperationKind::NormalizedLoad => "normalized_load",
            OperationKind::DimensionalLoad => "dimensional_load",
        }
    }
}

/// Per-chunk quality accounting record. `quality_level` is intentionally
/// absent here: the store derives it via a generated column, not the
/// writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityRecord {
    pub monitored_at: DateTime<Utc>,
    pub source_file: String,
    pub operation: OperationKind,
    pub target_table: String,
    pub chunk_number: u64,
    pub session_id: String,
    pub rows_attempted: i64,
    pub rows_inserted: i64,
    pub rows_updated: i64,
    pub rows_deleted: i64,
    pub rows_duplicates: i64,
    pub rows_invalid: i64,
    pub rows_skipped: i64,
    pub duration_ms: i64,
    pub violation_null: i64,
    pub violation_constraint: i64,
    pub violation_data_type: i64,
    pub violation_business_rule: i64,
    pub violation_referential_integrity: i64,
}

impl QualityRecord {
    /// Attempted bounds the sum of the three disjoint outcome counts.
    pub fn is_consistent(&self) -> bool {
        self.rows_inserted + self.rows_duplicates + self.rows_invalid <= self.rows_attempted
    }
}

/// A single planned (year, month) unit of work plus how the planner
/// classified it against `ProcessingLog`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedMonth {
    pub year: i32,
    pub month: u32,
    pub disposition: MonthDisposition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonthDisposition {
    New,
    Retry { attempt_count: i32 },
    Skip { records_loaded: i64 },
}

/// `YYYY-MM` formatting shared by the planner, fetcher, and logs.
pub fn format_year_month(year: i32, month: u32) -> String {
    format!("{year:04}-{month:02}")
}

/// `YYYYMMDD` integer date key joining to `dim_date`.
pub fn date_key(date: NaiveDate) -> i32 {
    date.format("%Y%m%d").to_string().parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_quality_record(attempted: i64, inserted: i64, duplicates: i64, invalid: i64) -> QualityRecord {
        QualityRecord {
            monitored_at: Utc::now(),
            source_file: "x.parquet".into(),
            operation: OperationKind::NormalizedLoad,
            target_table: "yellow_taxi_trips".into(),
            chunk_number: 1,
            session_id: "s".into(),
            rows_attempted: attempted,
            rows_inserted: inserted,
            rows_updated: 0,
            rows_deleted: 0,
            rows_duplicates: duplicates,
            rows_invalid: invalid,
            rows_skipped: 0,
            duration_ms: 10,
            violation_null: 0,
            violation_constraint: 0,
            violation_data_type: 0,
            violation_business_rule: 0,
            violation_referential_integrity: 0,
        }
    }

    #[test]
    fn quality_record_consistency_holds_when_sum_within_attempted() {
        assert!(sample_quality_record(100, 90, 5, 5).is_consistent());
    }

    #[test]
    fn quality_record_consistency_fails_when_sum_exceeds_attempted() {
        assert!(!sample_quality_record(10, 9, 5, 5).is_consistent());
    }

    #[test]
    fn date_key_formats_as_yyyymmdd() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        assert_eq!(date_key(d), 20240105);
    }

    #[test]
    fn format_year_month_pads_month() {
        assert_eq!(format_year_month(2024, 1), "2024-01");
    }
}
