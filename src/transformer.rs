use anyhow::{Context, Result};
use chrono::{Datelike, Timelike, Utc};
use futures::TryStreamExt;
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::{PgPool, QueryBuilder};
use std::time::Instant;

use crate::dimension_cache::DimensionCache;
use crate::error::PipelineError;
use crate::types::{self, ErrorCategory, InvalidTripRow, OperationKind, QualityRecord, TripRow};

const SUB_BATCH_SIZE: usize = 10_000;
const LONG_DISTANCE_MILES: f64 = 10.0;
const SHORT_TRIP_MILES: f64 = 1.0;
const CASH_PAYMENT_TYPE: i32 = 2;

#[derive(Debug, Clone, sqlx::FromRow)]
struct NormalizedRow {
    row_hash: String,
    #[sqlx(flatten)]
    trip: TripRow,
}

/// Stream every normalized row for (year, month) in sub-batches of
/// [`SUB_BATCH_SIZE`], join the dimension cache, derive the fact columns,
/// and bulk insert into the matching monthly partition of
/// `fact_taxi_trips`. Rows whose location, vendor, payment type, or rate
/// code doesn't resolve against `cache` are dropped and counted invalid
/// rather than failing the month. Re-running this over a month already
/// partly loaded (a resumed, previously-interrupted run) re-derives every
/// row but only inserts the ones missing, via the same
/// `ON CONFLICT (row_hash, pickup_date) DO NOTHING` idempotency the
/// normalized load uses.
pub async fn load_month(
    pool: &PgPool,
    cache: &DimensionCache,
    year: i32,
    month: u32,
    source_file: &str,
    session_id: &str,
) -> Result<Vec<QualityRecord>> {
    let (range_start, range_end) = month_range(year, month);

    let mut stream = sqlx::query_as::<_, NormalizedRow>(
        r#"
        SELECT row_hash, vendor_id, pickup_datetime, dropoff_datetime, passenger_count,
               trip_distance, rate_code_id, store_and_fwd_flag, pickup_location_id,
               dropoff_location_id, payment_type, fare_amount, extra, mta_tax, tip_amount,
               tolls_amount, improvement_surcharge, total_amount, congestion_surcharge,
               airport_fee, cbd_congestion_fee
        FROM yellow_taxi_trips
        WHERE pickup_datetime >= $1 AND pickup_datetime < $2
        "#,
    )
    .bind(range_start)
    .bind(range_end)
    .fetch(pool);

    let mut buffer = Vec::with_capacity(SUB_BATCH_SIZE);
    let mut chunk_number: u64 = 0;
    let mut records = Vec::new();

    loop {
        match stream.try_next().await {
            Ok(Some(row)) => {
                buffer.push(row);
                if buffer.len() >= SUB_BATCH_SIZE {
                    chunk_number += 1;
                    let record =
                        process_sub_batch(pool, cache, std::mem::take(&mut buffer), source_file, session_id, chunk_number).await?;
                    records.push(record);
                }
            }
            Ok(None) => break,
            Err(e) => return Err(PipelineError::from_sqlx(e, chunk_number).into()),
        }
    }

    if !buffer.is_empty() {
        chunk_number += 1;
        let record = process_sub_batch(pool, cache, buffer, source_file, session_id, chunk_number).await?;
        records.push(record);
    }

    Ok(records)
}

fn month_range(year: i32, month: u32) -> (chrono::DateTime<Utc>, chrono::DateTime<Utc>) {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let start = chrono::NaiveDate::from_ymd_opt(year, month, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc();
    let end = chrono::NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc();
    (start, end)
}

async fn process_sub_batch(
    pool: &PgPool,
    cache: &DimensionCache,
    rows: Vec<NormalizedRow>,
    source_file: &str,
    session_id: &str,
    chunk_number: u64,
) -> Result<QualityRecord> {
    let started = Instant::now();
    let attempted = rows.len();

    let mut facts = Vec::with_capacity(rows.len());
    let mut invalid = Vec::new();
    let mut violation_referential_integrity = 0i64;

    for row in rows {
        match derive_fact(&row, cache) {
            Ok(fact) => facts.push(fact),
            Err(reason) => {
                violation_referential_integrity += 1;
                invalid.push(InvalidTripRow {
                    id: 0,
                    failed_at: Utc::now(),
                    error_type: ErrorCategory::ReferentialIntegrity,
                    error_message: reason,
                    source_file: source_file.to_string(),
                    chunk_number,
                    row_number_in_chunk: invalid.len(),
                    raw_data: json!({ "row_hash": row.row_hash }),
                });
            }
        }
    }

    let inserted = if facts.is_empty() { 0 } else { insert_facts(pool, &facts, chunk_number).await? };

    let duration_ms = started.elapsed().as_millis() as i64;
    let record = QualityRecord {
        monitored_at: Utc::now(),
        source_file: source_file.to_string(),
        operation: OperationKind::DimensionalLoad,
        target_table: "fact_taxi_trips".to_string(),
        chunk_number,
        session_id: session_id.to_string(),
        rows_attempted: attempted as i64,
        rows_inserted: inserted as i64,
        rows_updated: 0,
        rows_deleted: 0,
        rows_duplicates: 0,
        rows_invalid: invalid.len() as i64,
        rows_skipped: 0,
        duration_ms,
        violation_null: 0,
        violation_constraint: 0,
        violation_data_type: 0,
        violation_business_rule: 0,
        violation_referential_integrity,
    };

    crate::quality::record(pool, &record).await?;

    tracing::info!(
        chunk = chunk_number,
        attempted,
        inserted,
        invalid = invalid.len(),
        "dimensional chunk loaded"
    );

    Ok(record)
}

/// A row of `fact_taxi_trips`, ready to bind.
struct Fact {
    row_hash: String,
    pickup_date: chrono::NaiveDate,
    pickup_date_key: i32,
    pickup_time_key: i32,
    dropoff_date_key: i32,
    dropoff_time_key: i32,
    pickup_location_key: i32,
    dropoff_location_key: i32,
    vendor_key: i32,
    payment_type_key: i32,
    rate_code_key: i32,
    trip_distance: Option<f64>,
    passenger_count: Option<i32>,
    fare_amount: Option<Decimal>,
    extra: Option<Decimal>,
    mta_tax: Option<Decimal>,
    tip_amount: Option<Decimal>,
    tolls_amount: Option<Decimal>,
    improvement_surcharge: Option<Decimal>,
    total_amount: Option<Decimal>,
    congestion_surcharge: Option<Decimal>,
    airport_fee: Option<Decimal>,
    cbd_congestion_fee: Option<Decimal>,
    trip_duration_minutes: Option<i32>,
    base_fare: Option<Decimal>,
    total_surcharges: Option<Decimal>,
    tip_percentage: Option<Decimal>,
    avg_speed_mph: Option<Decimal>,
    revenue_per_mile: Option<Decimal>,
    is_airport_trip: bool,
    is_cross_borough_trip: bool,
    is_cash_trip: bool,
    is_long_distance: bool,
    is_short_trip: bool,
}

/// Join the dimension cache and derive every fact column for one
/// normalized row, or name the first dimension that failed to resolve.
fn derive_fact(row: &NormalizedRow, cache: &DimensionCache) -> Result<Fact, String> {
    let trip = &row.trip;

    let pickup_location_id = trip.pickup_location_id.ok_or("pickup_location_id is null")?;
    let dropoff_location_id = trip.dropoff_location_id.ok_or("dropoff_location_id is null")?;
    let pickup_loc = cache.location(pickup_location_id).ok_or("pickup_location_id has no dimension entry")?;
    let dropoff_loc = cache.location(dropoff_location_id).ok_or("dropoff_location_id has no dimension entry")?;

    let vendor_id = trip.vendor_id.ok_or("vendor_id is null")?;
    let vendor_key = cache.vendor_key(vendor_id).ok_or("vendor_id has no dimension entry")?;

    let payment_type = trip.payment_type.ok_or("payment_type is null")?;
    let payment_type_key = cache.payment_type_key(payment_type).ok_or("payment_type has no dimension entry")?;

    let rate_code_id = trip.rate_code_id.ok_or("rate_code_id is null")?;
    let rate_code_key = cache.rate_code_key(rate_code_id).ok_or("rate_code_id has no dimension entry")?;

    let duration_minutes = (trip.dropoff_datetime - trip.pickup_datetime).num_minutes();
    let total_surcharges = sum_decimals(&[
        trip.extra,
        trip.mta_tax,
        trip.improvement_surcharge,
        trip.congestion_surcharge,
        trip.airport_fee,
        trip.cbd_congestion_fee,
    ]);

    let tip_percentage = match (trip.tip_amount, trip.fare_amount) {
        (Some(tip), Some(fare)) if fare > Decimal::ZERO => Some(tip / fare * Decimal::from(100)),
        _ => Some(Decimal::ZERO),
    };

    let avg_speed_mph = match (trip.trip_distance, duration_minutes) {
        (Some(distance), minutes) if minutes > 0 && distance > 0.0 => Decimal::from_f64_retain(distance / (minutes as f64 / 60.0)),
        _ => Some(Decimal::ZERO),
    };

    let revenue_per_mile = match (trip.total_amount, trip.trip_distance) {
        (Some(total), Some(distance)) if distance > 0.0 => {
            Decimal::from_f64_retain(distance).filter(|d| !d.is_zero()).map(|d| total / d)
        }
        _ => None,
    };

    Ok(Fact {
        row_hash: row.row_hash.clone(),
        pickup_date: trip.pickup_datetime.date_naive(),
        pickup_date_key: types::date_key(trip.pickup_datetime.date_naive()),
        pickup_time_key: trip.pickup_datetime.hour() as i32,
        dropoff_date_key: types::date_key(trip.dropoff_datetime.date_naive()),
        dropoff_time_key: trip.dropoff_datetime.hour() as i32,
        pickup_location_key: pickup_loc.location_key,
        dropoff_location_key: dropoff_loc.location_key,
        vendor_key,
        payment_type_key,
        rate_code_key,
        trip_distance: trip.trip_distance,
        passenger_count: trip.passenger_count,
        fare_amount: trip.fare_amount,
        extra: trip.extra,
        mta_tax: trip.mta_tax,
        tip_amount: trip.tip_amount,
        tolls_amount: trip.tolls_amount,
        improvement_surcharge: trip.improvement_surcharge,
        total_amount: trip.total_amount,
        congestion_surcharge: trip.congestion_surcharge,
        airport_fee: trip.airport_fee,
        cbd_congestion_fee: trip.cbd_congestion_fee,
        trip_duration_minutes: i32::try_from(duration_minutes).ok(),
        base_fare: sum_decimals(&[trip.fare_amount, trip.extra]),
        total_surcharges,
        tip_percentage,
        avg_speed_mph,
        revenue_per_mile,
        is_airport_trip: pickup_loc.is_airport || dropoff_loc.is_airport,
        is_cross_borough_trip: pickup_loc.borough != dropoff_loc.borough,
        is_cash_trip: payment_type == CASH_PAYMENT_TYPE,
        is_long_distance: trip.trip_distance.map(|d| d >= LONG_DISTANCE_MILES).unwrap_or(false),
        is_short_trip: trip.trip_distance.map(|d| d < SHORT_TRIP_MILES).unwrap_or(false),
    })
}

fn sum_decimals(values: &[Option<Decimal>]) -> Option<Decimal> {
    let present: Vec<Decimal> = values.iter().filter_map(|v| *v).collect();
    if present.is_empty() {
        None
    } else {
        Some(present.into_iter().sum())
    }
}

async fn insert_facts(pool: &PgPool, facts: &[Fact], chunk_number: u64) -> Result<usize> {
    let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
        "INSERT INTO fact_taxi_trips (
            row_hash, pickup_date, pickup_date_key, pickup_time_key, dropoff_date_key, dropoff_time_key,
            pickup_location_key, dropoff_location_key, vendor_key, payment_type_key, rate_code_key,
            trip_distance, passenger_count, fare_amount, extra, mta_tax, tip_amount, tolls_amount,
            improvement_surcharge, total_amount, congestion_surcharge, airport_fee, cbd_congestion_fee,
            trip_duration_minutes, base_fare, total_surcharges, tip_percentage, avg_speed_mph,
            revenue_per_mile, is_airport_trip, is_cross_borough_trip, is_cash_trip, is_long_distance,
            is_short_trip, original_row_hash
        ) ",
    );

    builder.push_values(facts, |mut b, f: &Fact| {
        b.push_bind(&f.row_hash)
            .push_bind(f.pickup_date)
            .push_bind(f.pickup_date_key)
            .push_bind(f.pickup_time_key)
            .push_bind(f.dropoff_date_key)
            .push_bind(f.dropoff_time_key)
            .push_bind(f.pickup_location_key)
            .push_bind(f.dropoff_location_key)
            .push_bind(f.vendor_key)
            .push_bind(f.payment_type_key)
            .push_bind(f.rate_code_key)
            .push_bind(f.trip_distance)
            .push_bind(f.passenger_count)
            .push_bind(f.fare_amount)
            .push_bind(f.extra)
            .push_bind(f.mta_tax)
            .push_bind(f.tip_amount)
            .push_bind(f.tolls_amount)
            .push_bind(f.improvement_surcharge)
            .push_bind(f.total_amount)
            .push_bind(f.congestion_surcharge)
            .push_bind(f.airport_fee)
            .push_bind(f.cbd_congestion_fee)
            .push_bind(f.trip_duration_minutes)
            .push_bind(f.base_fare)
            .push_bind(f.total_surcharges)
            .push_bind(f.tip_percentage)
            .push_bind(f.avg_speed_mph)
            .push_bind(f.revenue_per_mile)
            .push_bind(f.is_airport_trip)
            .push_bind(f.is_cross_borough_trip)
            .push_bind(f.is_cash_trip)
            .push_bind(f.is_long_distance)
            .push_bind(f.is_short_trip)
            .push_bind(&f.row_hash);
    });
    builder.push(" ON CONFLICT (row_hash, pickup_date) DO NOTHING");

    let result = builder
        .build()
        .execute(pool)
        .await
        .map_err(|e| PipelineError::from_sqlx(e, chunk_number))
        .context("Failed to bulk insert fact_taxi_trips sub-batch")?;

    Ok(result.rows_affected() as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_range_spans_exactly_one_calendar_month() {
        let (start, end) = month_range(2024, 2);
        assert_eq!(start.to_rfc3339(), "2024-02-01T00:00:00+00:00");
        assert_eq!(end.to_rfc3339(), "2024-03-01T00:00:00+00:00");
    }

    #[test]
    fn month_range_wraps_december_into_next_year() {
        let (_, end) = month_range(2024, 12);
        assert_eq!(end.to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn sum_decimals_skips_absent_components_and_is_none_when_all_absent() {
        assert_eq!(sum_decimals(&[None, None]), None);
        assert_eq!(
            sum_decimals(&[Some(Decimal::new(150, 2)), None, Some(Decimal::new(50, 2))]),
            Some(Decimal::new(200, 2))
        );
    }

    #[test]
    fn long_and_short_distance_thresholds_do_not_overlap() {
        assert!(LONG_DISTANCE_MILES > SHORT_TRIP_MILES);
    }

    fn sample_cache() -> DimensionCache {
        let mut locations = ahash::AHashMap::new();
        locations.insert(
            100,
            crate::types::LocationDimEntry {
                location_key: 1,
                borough: "Manhattan".to_string(),
                zone: "Alphabet City".to_string(),
                is_airport: false,
                is_manhattan: true,
            },
        );
        locations.insert(
            200,
            crate::types::LocationDimEntry {
                location_key: 2,
                borough: "Queens".to_string(),
                zone: "JFK Airport".to_string(),
                is_airport: true,
                is_manhattan: false,
            },
        );
        let mut vendors = ahash::AHashMap::new();
        vendors.insert(1, 10);
        let mut payment_types = ahash::AHashMap::new();
        payment_types.insert(1, 20);
        let mut rate_codes = ahash::AHashMap::new();
        rate_codes.insert(1, 30);

        DimensionCache {
            locations,
            vendors,
            payment_types,
            rate_codes,
        }
    }

    fn sample_trip() -> TripRow {
        use chrono::TimeZone;
        TripRow {
            vendor_id: Some(1),
            pickup_datetime: Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap(),
            dropoff_datetime: Utc.with_ymd_and_hms(2024, 1, 1, 8, 15, 0).unwrap(),
            passenger_count: Some(1),
            trip_distance: Some(5.0),
            rate_code_id: Some(1),
            store_and_fwd_flag: None,
            pickup_location_id: Some(100),
            dropoff_location_id: Some(200),
            payment_type: Some(1),
            fare_amount: Some(Decimal::new(1000, 2)),
            extra: Some(Decimal::new(50, 2)),
            mta_tax: None,
            tip_amount: Some(Decimal::ZERO),
            tolls_amount: None,
            improvement_surcharge: None,
            total_amount: Some(Decimal::new(1050, 2)),
            congestion_surcharge: None,
            airport_fee: None,
            cbd_congestion_fee: None,
        }
    }

    #[test]
    fn base_fare_sums_fare_amount_and_extra() {
        let row = NormalizedRow {
            row_hash: "h".to_string(),
            trip: sample_trip(),
        };
        let fact = derive_fact(&row, &sample_cache()).unwrap();
        assert_eq!(fact.base_fare, Some(Decimal::new(1050, 2)));
    }

    #[test]
    fn is_long_distance_is_inclusive_of_the_threshold() {
        let mut trip = sample_trip();
        trip.trip_distance = Some(LONG_DISTANCE_MILES);
        let row = NormalizedRow {
            row_hash: "h".to_string(),
            trip,
        };
        let fact = derive_fact(&row, &sample_cache()).unwrap();
        assert!(fact.is_long_distance);
    }

    #[test]
    fn tip_percentage_and_avg_speed_fall_back_to_zero_not_null() {
        let mut trip = sample_trip();
        trip.fare_amount = None;
        trip.trip_distance = None;
        let row = NormalizedRow {
            row_hash: "h".to_string(),
            trip,
        };
        let fact = derive_fact(&row, &sample_cache()).unwrap();
        assert_eq!(fact.tip_percentage, Some(Decimal::ZERO));
        assert_eq!(fact.avg_speed_mph, Some(Decimal::ZERO));
        assert_eq!(fact.revenue_per_mile, None);
    }

    #[test]
    fn derive_fact_drops_row_missing_a_dimension_entry() {
        let mut trip = sample_trip();
        trip.vendor_id = Some(999);
        let row = NormalizedRow {
            row_hash: "h".to_string(),
            trip,
        };
        assert!(derive_fact(&row, &sample_cache()).is_err());
    }
}
