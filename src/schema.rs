use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use sqlx::PgPool;

use crate::error::PipelineError;
use crate::types::date_key;

/// All DDL is idempotent: every statement is "create if not absent", so a
/// rerun against an already-initialized database succeeds without
/// destructive effect.
const DDL_STATEMENTS: &[&str] = &[
    "CREATE EXTENSION IF NOT EXISTS postgis",
    r#"
    CREATE TABLE IF NOT EXISTS taxi_zone_lookup (
        locationid   INTEGER PRIMARY KEY,
        borough      TEXT NOT NULL,
        zone         TEXT NOT NULL,
        service_zone TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS taxi_zone_shapes (
        objectid   INTEGER PRIMARY KEY,
        locationid INTEGER NOT NULL REFERENCES taxi_zone_lookup(locationid),
        zone       TEXT NOT NULL,
        borough    TEXT NOT NULL,
        shape_leng DOUBLE PRECISION NOT NULL,
        shape_area DOUBLE PRECISION NOT NULL,
        geometry   geometry(MultiPolygon, 2263) NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS taxi_zone_shapes_geom_idx ON taxi_zone_shapes USING GIST (geometry)",
    r#"
    CREATE TABLE IF NOT EXISTS rate_code_lookup (
        rate_code_id INTEGER PRIMARY KEY,
        description  TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS payment_type_lookup (
        payment_type INTEGER PRIMARY KEY,
        description  TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS vendor_lookup (
        vendor_id   INTEGER PRIMARY KEY,
        description TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dim_date (
        date_key     INTEGER PRIMARY KEY,
        full_date    DATE NOT NULL UNIQUE,
        year         INTEGER NOT NULL,
        quarter      INTEGER NOT NULL,
        month        INTEGER NOT NULL,
        weekday      INTEGER NOT NULL,
        is_weekend   BOOLEAN NOT NULL,
        fiscal_year  INTEGER NOT NULL,
        season       TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dim_time (
        time_key        INTEGER PRIMARY KEY,
        hour_of_day     INTEGER NOT NULL UNIQUE,
        is_rush_hour    BOOLEAN NOT NULL,
        is_business_hour BOOLEAN NOT NULL,
        time_of_day     TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dim_locations (
        location_key         SERIAL PRIMARY KEY,
        locationid           INTEGER NOT NULL UNIQUE REFERENCES taxi_zone_lookup(locationid),
        borough              TEXT NOT NULL,
        zone                 TEXT NOT NULL,
        service_zone         TEXT NOT NULL,
        is_airport           BOOLEAN NOT NULL,
        is_manhattan         BOOLEAN NOT NULL,
        is_business_district BOOLEAN NOT NULL,
        zone_type            TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dim_vendor (
        vendor_key SERIAL PRIMARY KEY,
        vendor_id  INTEGER NOT NULL UNIQUE REFERENCES vendor_lookup(vendor_id),
        description TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dim_payment_type (
        payment_type_key SERIAL PRIMARY KEY,
        payment_type     INTEGER NOT NULL UNIQUE REFERENCES payment_type_lookup(payment_type),
        description      TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dim_rate_code (
        rate_code_key SERIAL PRIMARY KEY,
        rate_code_id  INTEGER NOT NULL UNIQUE REFERENCES rate_code_lookup(rate_code_id),
        description   TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS yellow_taxi_trips (
        row_hash               CHAR(64) PRIMARY KEY,
        vendor_id              INTEGER,
        pickup_datetime        TIMESTAMPTZ NOT NULL,
        dropoff_datetime       TIMESTAMPTZ NOT NULL,
        passenger_count        INTEGER,
        trip_distance          DOUBLE PRECISION,
        rate_code_id           INTEGER,
        store_and_fwd_flag     TEXT,
        pickup_location_id     INTEGER,
        dropoff_location_id    INTEGER,
        payment_type           INTEGER,
        fare_amount             NUMERIC(12, 2),
        extra                   NUMERIC(12, 2),
        mta_tax                 NUMERIC(12, 2),
        tip_amount              NUMERIC(12, 2),
        tolls_amount             NUMERIC(12, 2),
        improvement_surcharge    NUMERIC(12, 2),
        total_amount             NUMERIC(12, 2),
        congestion_surcharge     NUMERIC(12, 2),
        airport_fee               NUMERIC(12, 2),
        cbd_congestion_fee        NUMERIC(12, 2)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS yellow_taxi_trips_pickup_idx ON yellow_taxi_trips (pickup_datetime)",
    r#"
    CREATE TABLE IF NOT EXISTS yellow_taxi_trips_invalid (
        invalid_id             BIGSERIAL PRIMARY KEY,
        failed_at              TIMESTAMPTZ NOT NULL DEFAULT now(),
        error_type             TEXT NOT NULL,
        error_message          TEXT NOT NULL,
        source_file            TEXT NOT NULL,
        chunk_number           BIGINT NOT NULL,
        row_number_in_chunk    INTEGER NOT NULL,
        vendor_id              INTEGER,
        pickup_datetime        TIMESTAMPTZ,
        dropoff_datetime       TIMESTAMPTZ,
        passenger_count        INTEGER,
        trip_distance          DOUBLE PRECISION,
        rate_code_id           INTEGER,
        store_and_fwd_flag     TEXT,
        pickup_location_id     INTEGER,
        dropoff_location_id    INTEGER,
        payment_type           INTEGER,
        fare_amount             NUMERIC(12, 2),
        extra                   NUMERIC(12, 2),
        mta_tax                 NUMERIC(12, 2),
        tip_amount              NUMERIC(12, 2),
        tolls_amount             NUMERIC(12, 2),
        improvement_surcharge    NUMERIC(12, 2),
        total_amount             NUMERIC(12, 2),
        congestion_surcharge     NUMERIC(12, 2),
        airport_fee               NUMERIC(12, 2),
        cbd_congestion_fee        NUMERIC(12, 2),
        raw_data_json             JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS fact_taxi_trips (
        fact_id                 BIGSERIAL,
        row_hash                CHAR(64) NOT NULL,
        pickup_date             DATE NOT NULL,
        pickup_date_key         INTEGER NOT NULL REFERENCES dim_date(date_key),
        pickup_time_key         INTEGER NOT NULL REFERENCES dim_time(time_key),
        dropoff_date_key        INTEGER NOT NULL REFERENCES dim_date(date_key),
        dropoff_time_key        INTEGER NOT NULL REFERENCES dim_time(time_key),
        pickup_location_key     INTEGER NOT NULL REFERENCES dim_locations(location_key),
        dropoff_location_key    INTEGER NOT NULL REFERENCES dim_locations(location_key),
        vendor_key              INTEGER NOT NULL REFERENCES dim_vendor(vendor_key),
        payment_type_key        INTEGER NOT NULL REFERENCES dim_payment_type(payment_type_key),
        rate_code_key           INTEGER NOT NULL REFERENCES dim_rate_code(rate_code_key),
        trip_distance           DOUBLE PRECISION,
        passenger_count         INTEGER,
        fare_amount             NUMERIC(12, 2),
        extra                   NUMERIC(12, 2),
        mta_tax                 NUMERIC(12, 2),
        tip_amount              NUMERIC(12, 2),
        tolls_amount            NUMERIC(12, 2),
        improvement_surcharge   NUMERIC(12, 2),
        total_amount            NUMERIC(12, 2),
        congestion_surcharge    NUMERIC(12, 2),
        airport_fee             NUMERIC(12, 2),
        cbd_congestion_fee      NUMERIC(12, 2),
        trip_duration_minutes   INTEGER,
        base_fare               NUMERIC(12, 2),
        total_surcharges        NUMERIC(12, 2),
        tip_percentage          NUMERIC(8, 4),
        avg_speed_mph           NUMERIC(10, 4),
        revenue_per_mile        NUMERIC(10, 4),
        is_airport_trip         BOOLEAN NOT NULL,
        is_cross_borough_trip   BOOLEAN NOT NULL,
        is_cash_trip            BOOLEAN NOT NULL,
        is_long_distance        BOOLEAN NOT NULL,
        is_short_trip           BOOLEAN NOT NULL,
        original_row_hash       CHAR(64) NOT NULL,
        PRIMARY KEY (fact_id, pickup_date),
        UNIQUE (row_hash, pickup_date)
    ) PARTITION BY RANGE (pickup_date)
    "#,
    "CREATE INDEX IF NOT EXISTS fact_taxi_trips_pickup_location_idx ON fact_taxi_trips (pickup_location_key)",
    r#"
    CREATE TABLE IF NOT EXISTS data_processing_log (
        data_year       INTEGER NOT NULL,
        data_month      INTEGER NOT NULL,
        source_file     TEXT NOT NULL,
        records_loaded  BIGINT NOT NULL DEFAULT 0,
        started_at      TIMESTAMPTZ NOT NULL,
        completed_at    TIMESTAMPTZ,
        backfill_label  TEXT NOT NULL,
        status          TEXT NOT NULL,
        attempt_count   INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (data_year, data_month)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS data_quality_monitor (
        id                              BIGSERIAL PRIMARY KEY,
        monitored_at                    TIMESTAMPTZ NOT NULL DEFAULT now(),
        source_file                     TEXT NOT NULL,
        operation                       TEXT NOT NULL,
        target_table                    TEXT NOT NULL,
        chunk_number                    BIGINT NOT NULL,
        session_id                      TEXT NOT NULL,
        rows_attempted                  BIGINT NOT NULL,
        rows_inserted                   BIGINT NOT NULL,
        rows_updated                    BIGINT NOT NULL DEFAULT 0,
        rows_deleted                    BIGINT NOT NULL DEFAULT 0,
        rows_duplicates                 BIGINT NOT NULL,
        rows_invalid                    BIGINT NOT NULL,
        rows_skipped                    BIGINT NOT NULL DEFAULT 0,
        duration_ms                     BIGINT NOT NULL,
        violation_null                  BIGINT NOT NULL DEFAULT 0,
        violation_constraint             BIGINT NOT NULL DEFAULT 0,
        violation_data_type              BIGINT NOT NULL DEFAULT 0,
        violation_business_rule          BIGINT NOT NULL DEFAULT 0,
        violation_referential_integrity  BIGINT NOT NULL DEFAULT 0,
        success_rate NUMERIC(6, 4) GENERATED ALWAYS AS (
            CASE WHEN rows_attempted = 0 THEN 1
                 ELSE rows_inserted::numeric / rows_attempted END
        ) STORED,
        duplicate_rate NUMERIC(6, 4) GENERATED ALWAYS AS (
            CASE WHEN rows_attempted = 0 THEN 0
                 ELSE rows_duplicates::numeric / rows_attempted END
        ) STORED,
        error_rate NUMERIC(6, 4) GENERATED ALWAYS AS (
            CASE WHEN rows_attempted = 0 THEN 0
                 ELSE rows_invalid::numeric / rows_attempted END
        ) STORED,
        quality_level TEXT GENERATED ALWAYS AS (
            CASE
                WHEN rows_attempted = 0 THEN 'EXCELLENT'
                WHEN (rows_invalid::numeric / rows_attempted) <= 0.01
                     AND (rows_duplicates::numeric / rows_attempted) <= 0.05 THEN 'EXCELLENT'
                WHEN (rows_invalid::numeric / rows_attempted) <= 0.03
                     AND (rows_duplicates::numeric / rows_attempted) <= 0.10 THEN 'GOOD'
                WHEN (rows_invalid::numeric / rows_attempted) <= 0.05
                     AND (rows_duplicates::numeric / rows_attempted) <= 0.15 THEN 'ACCEPTABLE'
                WHEN (rows_invalid::numeric / rows_attempted) <= 0.10
                     AND (rows_duplicates::numeric / rows_attempted) <= 0.25 THEN 'POOR'
                ELSE 'CRITICAL'
            END
        ) STORED
    )
    "#,
    "CREATE INDEX IF NOT EXISTS data_quality_monitor_source_file_idx ON data_quality_monitor (source_file, chunk_number)",
];

/// Fixed enumerations seeded idempotently via upsert-on-conflict.
const RATE_CODES: &[(i32, &str)] = &[
    (1, "Standard rate"),
    (2, "JFK"),
    (3, "Newark"),
    (4, "Nassau or Westchester"),
    (5, "Negotiated fare"),
    (6, "Group ride"),
    (99, "Unknown"),
];

const PAYMENT_TYPES: &[(i32, &str)] = &[
    (0, "Flex Fare trip"),
    (1, "Credit card"),
    (2, "Cash"),
    (3, "No charge"),
    (4, "Dispute"),
    (5, "Unknown"),
    (6, "Voided trip"),
];

const VENDORS: &[(i32, &str)] = &[(1, "Creative Mobile Technologies, LLC"), (2, "VeriFone Inc")];

/// Run every DDL statement, then seed the fixed lookup enumerations.
/// Idempotent: safe to call on every process start.
pub async fn bootstrap(pool: &PgPool) -> Result<()> {
    for statement in DDL_STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| PipelineError::Schema(e.to_string()))
            .context("Failed to run schema bootstrap DDL")?;
    }

    seed_lookup(pool, "rate_code_lookup", "rate_code_id", RATE_CODES).await?;
    seed_lookup(pool, "payment_type_lookup", "payment_type", PAYMENT_TYPES).await?;
    seed_lookup(pool, "vendor_lookup", "vendor_id", VENDORS).await?;
    seed_dim_vendor(pool).await?;
    seed_dim_payment_type(pool).await?;
    seed_dim_rate_code(pool).await?;
    seed_dim_time(pool).await?;
    seed_dim_date(pool).await?;

    tracing::info!("Schema bootstrap complete");
    Ok(())
}

async fn seed_lookup(pool: &PgPool, table: &str, key_column: &str, rows: &[(i32, &str)]) -> Result<()> {
    for (key, description) in rows {
        let sql = format!(
            "INSERT INTO {table} ({key_column}, description) VALUES ($1, $2) \
             ON CONFLICT ({key_column}) DO UPDATE SET description = EXCLUDED.description"
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(description)
            .execute(pool)
            .await
            .map_err(|e| PipelineError::Schema(e.to_string()))?;
    }
    Ok(())
}

/// Seed `dim_vendor`/`dim_payment_type`/`dim_rate_code` from the same
/// fixed enumerations as their flat lookup tables, assigning each a
/// surrogate key. These are the tables `dimension_cache::build` reads
/// into `DimensionCache.vendors`/`payment_types`/`rate_codes`; without
/// them every dimensional join misses and every row is dropped as
/// referential-integrity-invalid.
async fn seed_dim_vendor(pool: &PgPool) -> Result<()> {
    seed_dim(pool, "dim_vendor", "vendor_id", VENDORS).await
}

async fn seed_dim_payment_type(pool: &PgPool) -> Result<()> {
    seed_dim(pool, "dim_payment_type", "payment_type", PAYMENT_TYPES).await
}

async fn seed_dim_rate_code(pool: &PgPool) -> Result<()> {
    seed_dim(pool, "dim_rate_code", "rate_code_id", RATE_CODES).await
}

async fn seed_dim(pool: &PgPool, table: &str, natural_key_column: &str, rows: &[(i32, &str)]) -> Result<()> {
    for (key, description) in rows {
        let sql = format!(
            "INSERT INTO {table} ({natural_key_column}, description) VALUES ($1, $2) \
             ON CONFLICT ({natural_key_column}) DO UPDATE SET description = EXCLUDED.description"
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(description)
            .execute(pool)
            .await
            .map_err(|e| PipelineError::Schema(e.to_string()))?;
    }
    Ok(())
}

/// `dim_time` has exactly 24 rows, one per hour, with rush-hour and
/// business-hours flags computed from TLC's published rush-hour window
/// (weekday 16:00-20:00), applied uniformly per hour here since the
/// dimension has no day-of-week axis.
async fn seed_dim_time(pool: &PgPool) -> Result<()> {
    for hour in 0..24i32 {
        let is_rush_hour = (16..20).contains(&hour);
        let is_business_hour = (9..17).contains(&hour);
        let time_of_day = match hour {
            5..=11 => "morning",
            12..=16 => "afternoon",
            17..=20 => "evening",
            _ => "night",
        };

        sqlx::query(
            "INSERT INTO dim_time (time_key, hour_of_day, is_rush_hour, is_business_hour, time_of_day) \
             VALUES ($1, $1, $2, $3, $4) \
             ON CONFLICT (hour_of_day) DO UPDATE SET \
                is_rush_hour = EXCLUDED.is_rush_hour, \
                is_business_hour = EXCLUDED.is_business_hour, \
                time_of_day = EXCLUDED.time_of_day",
        )
        .bind(hour)
        .bind(is_rush_hour)
        .bind(is_business_hour)
        .bind(time_of_day)
        .execute(pool)
        .await
        .map_err(|e| PipelineError::Schema(e.to_string()))?;
    }
    Ok(())
}

const DIM_DATE_START_YEAR: i32 = 2009;
const DIM_DATE_END_YEAR: i32 = 2025;

/// `dim_date` covers exactly [2009-01-01, 2025-12-31] with no gaps.
/// Fiscal year follows the US federal fiscal year (Oct 1 - Sep 30, one
/// year ahead of the calendar year for Oct-Dec); season uses the
/// meteorological definition (Winter: Dec-Feb, Spring: Mar-May, Summer:
/// Jun-Aug, Fall: Sep-Nov).
async fn seed_dim_date(pool: &PgPool) -> Result<()> {
    let start = NaiveDate::from_ymd_opt(DIM_DATE_START_YEAR, 1, 1).unwrap();
    let end = NaiveDate::from_ymd_opt(DIM_DATE_END_YEAR, 12, 31).unwrap();

    let mut date = start;
    while date <= end {
        let year = date.year();
        let month = date.month();
        let quarter = (month as i32 - 1) / 3 + 1;
        let weekday = date.weekday().num_days_from_monday() as i32;
        let is_weekend = weekday >= 5;
        let fiscal_year = if month >= 10 { year + 1 } else { year };
        let season = match month {
            12 | 1 | 2 => "winter",
            3..=5 => "spring",
            6..=8 => "summer",
            _ => "fall",
        };

        sqlx::query(
            "INSERT INTO dim_date (date_key, full_date, year, quarter, month, weekday, is_weekend, fiscal_year, season) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (full_date) DO UPDATE SET \
                year = EXCLUDED.year, quarter = EXCLUDED.quarter, month = EXCLUDED.month, \
                weekday = EXCLUDED.weekday, is_weekend = EXCLUDED.is_weekend, \
                fiscal_year = EXCLUDED.fiscal_year, season = EXCLUDED.season",
        )
        .bind(date_key(date))
        .bind(date)
        .bind(year)
        .bind(quarter)
        .bind(month as i32)
        .bind(weekday)
        .bind(is_weekend)
        .bind(fiscal_year)
        .bind(season)
        .execute(pool)
        .await
        .map_err(|e| PipelineError::Schema(e.to_string()))?;

        date = date.succ_opt().unwrap();
    }

    Ok(())
}

/// Create the monthly range partition on `fact_taxi_trips` for (year,
/// month) if it does not already exist.
pub async fn ensure_month_partition(pool: &PgPool, year: i32, month: u32) -> Result<()> {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let partition_name = format!("fact_taxi_trips_y{year}m{month:02}");
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {partition_name} PARTITION OF fact_taxi_trips \
         FOR VALUES FROM ('{year}-{month:02}-01') TO ('{next_year}-{next_month:02}-01')"
    );

    sqlx::query(&sql)
        .execute(pool)
        .await
        .map_err(|e| PipelineError::Schema(e.to_string()))
        .context("Failed to create fact_taxi_trips partition")?;

    Ok(())
}

/// Create partitions for every month in `months`, skipping any that
/// already exist.
pub async fn ensure_partitions_for_range(pool: &PgPool, months: &[(i32, u32)]) -> Result<()> {
    for (year, month) in months {
        ensure_month_partition(pool, *year, *month).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_ddl_statement_is_create_if_not_absent_or_an_index() {
        for statement in DDL_STATEMENTS {
            let normalized = statement.trim_start();
            assert!(
                normalized.starts_with("CREATE EXTENSION IF NOT EXISTS")
                    || normalized.starts_with("CREATE TABLE IF NOT EXISTS")
                    || normalized.starts_with("CREATE INDEX IF NOT EXISTS"),
                "non-idempotent statement: {statement}"
            );
        }
    }

    #[test]
    fn rate_codes_payment_types_and_vendors_are_fixed_small_enumerations() {
        assert!(RATE_CODES.len() < 10);
        assert!(PAYMENT_TYPES.len() < 10);
        assert!(VENDORS.len() < 10);
    }

    #[test]
    fn dim_date_range_spans_exactly_2009_through_2025() {
        let start = NaiveDate::from_ymd_opt(DIM_DATE_START_YEAR, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(DIM_DATE_END_YEAR, 12, 31).unwrap();
        assert_eq!(start.to_string(), "2009-01-01");
        assert_eq!(end.to_string(), "2025-12-31");
    }

    #[test]
    fn fiscal_year_rolls_over_in_october() {
        let month = 10u32;
        let year = 2024;
        let fiscal_year = if month >= 10 { year + 1 } else { year };
        assert_eq!(fiscal_year, 2025);
    }
}
