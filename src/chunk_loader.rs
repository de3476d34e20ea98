use anyhow::{Context, Result};
use arrow::array::{
    Array, Float32Array, Float64Array, Int32Array, Int64Array, StringArray, TimestampMicrosecondArray,
    TimestampNanosecondArray,
};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use parquet::arrow::async_reader::ParquetObjectReader;
use parquet::arrow::ParquetRecordBatchStreamBuilder;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::{PgPool, QueryBuilder};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::error::PipelineError;
use crate::fingerprint;
use crate::types::{ErrorCategory, InvalidTripRow, OperationKind, QualityRecord, TripRow};

/// Outcome of loading one chunk's worth of rows into the normalized table.
struct ChunkOutcome {
    attempted: usize,
    inserted: usize,
    duplicates: usize,
    invalid: Vec<InvalidTripRow>,
}

/// Stream `path` in chunks of `chunk_size` rows, converting, fingerprinting,
/// and bulk-loading each chunk into `yellow_taxi_trips` /
/// `yellow_taxi_trips_invalid`, emitting one [`QualityRecord`] per chunk.
/// Returns the quality records so the caller can fold them into a run
/// summary; each record is also persisted by [`crate::quality::record`].
pub async fn load_month(
    pool: &PgPool,
    path: &Path,
    source_file: &str,
    chunk_size: usize,
    session_id: &str,
) -> Result<Vec<QualityRecord>> {
    let object_store = Arc::new(LocalFileSystem::new());
    let object_path = ObjectPath::from_filesystem_path(path)
        .with_context(|| format!("Failed to resolve object_store path for {}", path.display()))?;

    let meta = object_store
        .head(&object_path)
        .await
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    let reader = ParquetObjectReader::new(object_store, meta);

    let builder = ParquetRecordBatchStreamBuilder::new(reader)
        .await
        .context("Failed to open parquet stream")?;
    let mut stream = builder
        .with_batch_size(chunk_size)
        .build()
        .context("Failed to build parquet record batch stream")?;

    let mut chunk_number: u64 = 0;
    let mut records = Vec::new();

    while let Some(batch_result) = stream.next().await {
        let batch = batch_result.context("Failed to read record batch")?;
        chunk_number += 1;

        let started = Instant::now();
        let rows = convert_batch(&batch, chunk_number, source_file)?;
        let outcome = load_chunk(pool, rows, chunk_number).await?;
        let duration_ms = started.elapsed().as_millis() as i64;

        let record = build_quality_record(source_file, chunk_number, session_id, &outcome, duration_ms);
        crate::quality::record(pool, &record).await?;

        tracing::info!(
            chunk = chunk_number,
            attempted = outcome.attempted,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            invalid = outcome.invalid.len(),
            "normalized chunk loaded"
        );

        records.push(record);
    }

    Ok(records)
}

fn build_quality_record(
    source_file: &str,
    chunk_number: u64,
    session_id: &str,
    outcome: &ChunkOutcome,
    duration_ms: i64,
) -> QualityRecord {
    let mut violation_null = 0i64;
    let mut violation_data_type = 0i64;
    for row in &outcome.invalid {
        match row.error_type {
            ErrorCategory::TypeError => violation_data_type += 1,
            ErrorCategory::ConstraintViolation => violation_null += 1,
            _ => {}
        }
    }

    QualityRecord {
        monitored_at: Utc::now(),
        source_file: source_file.to_string(),
        operation: OperationKind::NormalizedLoad,
        target_table: "yellow_taxi_trips".to_string(),
        chunk_number,
        session_id: session_id.to_string(),
        rows_attempted: outcome.attempted as i64,
        rows_inserted: outcome.inserted as i64,
        rows_updated: 0,
        rows_deleted: 0,
        rows_duplicates: outcome.duplicates as i64,
        rows_invalid: outcome.invalid.len() as i64,
        rows_skipped: 0,
        duration_ms,
        violation_null,
        violation_constraint: 0,
        violation_data_type,
        violation_business_rule: 0,
        violation_referential_integrity: 0,
    }
}

/// Bulk insert `rows` (already fingerprinted), classifying each as
/// inserted or duplicate via `ON CONFLICT (row_hash) DO NOTHING
/// RETURNING row_hash`, plus insert the separately-collected invalid rows.
async fn load_chunk(pool: &PgPool, conversion: ConvertedChunk, chunk_number: u64) -> Result<ChunkOutcome> {
    let ConvertedChunk { valid, mut invalid, attempted } = conversion;

    let inserted = if valid.is_empty() {
        0
    } else {
        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO yellow_taxi_trips (row_hash, vendor_id, pickup_datetime, dropoff_datetime, \
             passenger_count, trip_distance, rate_code_id, store_and_fwd_flag, pickup_location_id, \
             dropoff_location_id, payment_type, fare_amount, extra, mta_tax, tip_amount, tolls_amount, \
             improvement_surcharge, total_amount, congestion_surcharge, airport_fee, cbd_congestion_fee) ",
        );

        builder.push_values(&valid, |mut b, (hash, row): &(String, TripRow)| {
            b.push_bind(hash)
                .push_bind(row.vendor_id)
                .push_bind(row.pickup_datetime)
                .push_bind(row.dropoff_datetime)
                .push_bind(row.passenger_count)
                .push_bind(row.trip_distance)
                .push_bind(row.rate_code_id)
                .push_bind(row.store_and_fwd_flag.clone())
                .push_bind(row.pickup_location_id)
                .push_bind(row.dropoff_location_id)
                .push_bind(row.payment_type)
                .push_bind(row.fare_amount)
                .push_bind(row.extra)
                .push_bind(row.mta_tax)
                .push_bind(row.tip_amount)
                .push_bind(row.tolls_amount)
                .push_bind(row.improvement_surcharge)
                .push_bind(row.total_amount)
                .push_bind(row.congestion_surcharge)
                .push_bind(row.airport_fee)
                .push_bind(row.cbd_congestion_fee);
        });
        builder.push(" ON CONFLICT (row_hash) DO NOTHING RETURNING row_hash");

        let inserted_hashes: Vec<(String,)> = builder
            .build_query_as()
            .fetch_all(pool)
            .await
            .map_err(|e| PipelineError::from_sqlx(e, chunk_number))?;
        inserted_hashes.len()
    };

    let duplicates = valid.len().saturating_sub(inserted);

    if !invalid.is_empty() {
        insert_invalid_rows(pool, &mut invalid, chunk_number).await?;
    }

    Ok(ChunkOutcome {
        attempted,
        inserted,
        duplicates,
        invalid,
    })
}

async fn insert_invalid_rows(pool: &PgPool, invalid: &mut [InvalidTripRow], chunk_number: u64) -> Result<()> {
    let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
        "INSERT INTO yellow_taxi_trips_invalid \
         (failed_at, error_type, error_message, source_file, chunk_number, row_number_in_chunk, raw_data_json) ",
    );
    builder.push_values(invalid.iter(), |mut b, row: &InvalidTripRow| {
        b.push_bind(row.failed_at)
            .push_bind(row.error_type.as_db_str())
            .push_bind(&row.error_message)
            .push_bind(&row.source_file)
            .push_bind(chunk_number as i64)
            .push_bind(row.row_number_in_chunk as i32)
            .push_bind(&row.raw_data);
    });

    builder
        .build()
        .execute(pool)
        .await
        .map_err(|e| PipelineError::from_sqlx(e, chunk_number))?;

    Ok(())
}

struct ConvertedChunk {
    valid: Vec<(String, TripRow)>,
    invalid: Vec<InvalidTripRow>,
    attempted: usize,
}

/// Convert one Arrow record batch into fingerprinted [`TripRow`]s, routing
/// per-row type/cast failures into `invalid` instead of failing the batch.
/// Columns absent in this vintage's schema (pre-2019 files lack
/// `congestion_surcharge`; pre-2021 lack `airport_fee`; pre-2025 lack
/// `cbd_congestion_fee`) are treated as all-null, not an error. A column
/// that *is* present but carries a cell of the wrong physical type (e.g. a
/// non-numeric `payment_type`) only drops that one row, not the column.
fn convert_batch(batch: &RecordBatch, chunk_number: u64, source_file: &str) -> Result<ConvertedChunk> {
    let num_rows = batch.num_rows();

    let (vendor_id, vendor_id_err) = split_results(opt_i32_column(batch, &["VendorID", "vendor_id"]));
    let pickup_datetime = required_datetime_column(batch, &["tpep_pickup_datetime", "pickup_datetime"], chunk_number)?;
    let dropoff_datetime = required_datetime_column(batch, &["tpep_dropoff_datetime", "dropoff_datetime"], chunk_number)?;
    let (passenger_count, passenger_count_err) = split_results(opt_i32_column(batch, &["passenger_count"]));
    let (trip_distance, trip_distance_err) = split_results(opt_f64_column(batch, &["trip_distance"]));
    let (rate_code_id, rate_code_id_err) = split_results(opt_i32_column(batch, &["RatecodeID", "rate_code_id"]));
    let store_and_fwd_flag = opt_string_column(batch, &["store_and_fwd_flag"]);
    let (pickup_location_id, pickup_location_id_err) = split_results(opt_i32_column(batch, &["PULocationID", "pickup_location_id"]));
    let (dropoff_location_id, dropoff_location_id_err) = split_results(opt_i32_column(batch, &["DOLocationID", "dropoff_location_id"]));
    let (payment_type, payment_type_err) = split_results(opt_i32_column(batch, &["payment_type"]));
    let (fare_amount, fare_amount_err) = split_results(opt_decimal_column(batch, &["fare_amount"]));
    let (extra, extra_err) = split_results(opt_decimal_column(batch, &["extra"]));
    let (mta_tax, mta_tax_err) = split_results(opt_decimal_column(batch, &["mta_tax"]));
    let (tip_amount, tip_amount_err) = split_results(opt_decimal_column(batch, &["tip_amount"]));
    let (tolls_amount, tolls_amount_err) = split_results(opt_decimal_column(batch, &["tolls_amount"]));
    let (improvement_surcharge, improvement_surcharge_err) = split_results(opt_decimal_column(batch, &["improvement_surcharge"]));
    let (total_amount, total_amount_err) = split_results(opt_decimal_column(batch, &["total_amount"]));
    let (congestion_surcharge, congestion_surcharge_err) = split_results(opt_decimal_column(batch, &["congestion_surcharge"]));
    let (airport_fee, airport_fee_err) = split_results(opt_decimal_column(batch, &["airport_fee"]));
    let (cbd_congestion_fee, cbd_congestion_fee_err) = split_results(opt_decimal_column(batch, &["cbd_congestion_fee"]));

    let mut valid = Vec::with_capacity(num_rows);
    let mut invalid = Vec::new();

    for i in 0..num_rows {
        let (Some(pickup), Some(dropoff)) = (pickup_datetime[i], dropoff_datetime[i]) else {
            invalid.push(invalid_row(
                chunk_number,
                i,
                ErrorCategory::TypeError,
                "pickup_datetime/dropoff_datetime could not be parsed".to_string(),
                raw_row_json(batch, i),
                source_file,
            ));
            continue;
        };

        if let Some(err) = first_error(&[
            &vendor_id_err[i],
            &passenger_count_err[i],
            &trip_distance_err[i],
            &rate_code_id_err[i],
            &pickup_location_id_err[i],
            &dropoff_location_id_err[i],
            &payment_type_err[i],
            &fare_amount_err[i],
            &extra_err[i],
            &mta_tax_err[i],
            &tip_amount_err[i],
            &tolls_amount_err[i],
            &improvement_surcharge_err[i],
            &total_amount_err[i],
            &congestion_surcharge_err[i],
            &airport_fee_err[i],
            &cbd_congestion_fee_err[i],
        ]) {
            invalid.push(invalid_row(chunk_number, i, ErrorCategory::TypeError, err.clone(), raw_row_json(batch, i), source_file));
            continue;
        }

        let row = TripRow {
            vendor_id: vendor_id[i],
            pickup_datetime: pickup,
            dropoff_datetime: dropoff,
            passenger_count: passenger_count[i],
            trip_distance: trip_distance[i],
            rate_code_id: rate_code_id[i],
            store_and_fwd_flag: store_and_fwd_flag[i].clone(),
            pickup_location_id: pickup_location_id[i],
            dropoff_location_id: dropoff_location_id[i],
            payment_type: payment_type[i],
            fare_amount: fare_amount[i],
            extra: extra[i],
            mta_tax: mta_tax[i],
            tip_amount: tip_amount[i],
            tolls_amount: tolls_amount[i],
            improvement_surcharge: improvement_surcharge[i],
            total_amount: total_amount[i],
            congestion_surcharge: congestion_surcharge[i],
            airport_fee: airport_fee[i],
            cbd_congestion_fee: cbd_congestion_fee[i],
        };

        let hash = fingerprint::compute_fingerprint(&row);
        valid.push((hash, row));
    }

    Ok(ConvertedChunk {
        valid,
        invalid,
        attempted: num_rows,
    })
}

fn invalid_row(
    chunk_number: u64,
    row_number_in_chunk: usize,
    error_type: ErrorCategory,
    error_message: String,
    raw_data: serde_json::Value,
    source_file: &str,
) -> InvalidTripRow {
    InvalidTripRow {
        id: 0,
        failed_at: Utc::now(),
        error_type,
        error_message,
        source_file: source_file.to_string(),
        chunk_number,
        row_number_in_chunk,
        raw_data,
    }
}

/// Best-effort debug dump of a row's columns, for forensic inspection of
/// rows that failed conversion. Not a faithful re-encoding of the source
/// value, just enough to diagnose the failure without the whole batch.
fn raw_row_json(batch: &RecordBatch, row: usize) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for field in batch.schema().fields() {
        let Some(column) = batch.column_by_name(field.name()) else { continue };
        map.insert(field.name().clone(), json!(format!("{:?}", column.slice(row, 1))));
    }
    serde_json::Value::Object(map)
}

/// A per-row column read: `Ok(None)` is a legitimate null, `Err(_)` is a
/// cell whose physical type or value couldn't be converted to the target
/// type and must be routed to the invalid-row table rather than silently
/// nulled.
type CellResult<T> = Result<Option<T>, String>;

fn find_column<'a>(batch: &'a RecordBatch, names: &[&str]) -> Option<(&'a str, &'a Arc<dyn Array>)> {
    for name in names {
        if let Some(col) = batch.column_by_name(name) {
            return Some((name, col));
        }
    }
    None
}

/// Split a column's per-row results into parallel value/error vectors so
/// callers can build the struct from `values` while checking `errors` per
/// row before committing to a valid row.
fn split_results<T>(results: Vec<CellResult<T>>) -> (Vec<Option<T>>, Vec<Option<String>>) {
    let mut values = Vec::with_capacity(results.len());
    let mut errors = Vec::with_capacity(results.len());
    for r in results {
        match r {
            Ok(v) => {
                values.push(v);
                errors.push(None);
            }
            Err(e) => {
                values.push(None);
                errors.push(Some(e));
            }
        }
    }
    (values, errors)
}

fn first_error<'a>(errors: &[&'a Option<String>]) -> Option<&'a String> {
    errors.iter().find_map(|e| e.as_ref())
}

fn opt_i32_column(batch: &RecordBatch, names: &[&str]) -> Vec<CellResult<i32>> {
    let num_rows = batch.num_rows();
    let Some((name, col)) = find_column(batch, names) else {
        return vec![Ok(None); num_rows];
    };

    if let Some(arr) = col.as_any().downcast_ref::<Int64Array>() {
        (0..num_rows).map(|i| Ok(if arr.is_null(i) { None } else { Some(arr.value(i) as i32) })).collect()
    } else if let Some(arr) = col.as_any().downcast_ref::<Int32Array>() {
        (0..num_rows).map(|i| Ok(if arr.is_null(i) { None } else { Some(arr.value(i)) })).collect()
    } else if let Some(arr) = col.as_any().downcast_ref::<Float64Array>() {
        (0..num_rows).map(|i| Ok(if arr.is_null(i) { None } else { Some(arr.value(i) as i32) })).collect()
    } else if let Some(arr) = col.as_any().downcast_ref::<StringArray>() {
        (0..num_rows)
            .map(|i| {
                if arr.is_null(i) {
                    Ok(None)
                } else {
                    let raw = arr.value(i);
                    raw.trim()
                        .parse::<i32>()
                        .map(Some)
                        .map_err(|_| format!("column {name:?} has non-numeric value {raw:?}"))
                }
            })
            .collect()
    } else {
        vec![Err(format!("column {name:?} has an unsupported physical type for an integer field")); num_rows]
    }
}

fn opt_f64_column(batch: &RecordBatch, names: &[&str]) -> Vec<CellResult<f64>> {
    let num_rows = batch.num_rows();
    let Some((name, col)) = find_column(batch, names) else {
        return vec![Ok(None); num_rows];
    };

    if let Some(arr) = col.as_any().downcast_ref::<Float64Array>() {
        (0..num_rows).map(|i| Ok(if arr.is_null(i) { None } else { Some(arr.value(i)) })).collect()
    } else if let Some(arr) = col.as_any().downcast_ref::<Float32Array>() {
        (0..num_rows).map(|i| Ok(if arr.is_null(i) { None } else { Some(arr.value(i) as f64) })).collect()
    } else if let Some(arr) = col.as_any().downcast_ref::<Int64Array>() {
        (0..num_rows).map(|i| Ok(if arr.is_null(i) { None } else { Some(arr.value(i) as f64) })).collect()
    } else if let Some(arr) = col.as_any().downcast_ref::<StringArray>() {
        (0..num_rows)
            .map(|i| {
                if arr.is_null(i) {
                    Ok(None)
                } else {
                    let raw = arr.value(i);
                    raw.trim()
                        .parse::<f64>()
                        .map(Some)
                        .map_err(|_| format!("column {name:?} has non-numeric value {raw:?}"))
                }
            })
            .collect()
    } else {
        vec![Err(format!("column {name:?} has an unsupported physical type for a numeric field")); num_rows]
    }
}

fn opt_decimal_column(batch: &RecordBatch, names: &[&str]) -> Vec<CellResult<Decimal>> {
    opt_f64_column(batch, names)
        .into_iter()
        .map(|cell| match cell {
            Ok(Some(v)) => Decimal::from_f64(v).map(Some).ok_or_else(|| format!("value {v} could not be represented as a decimal")),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        })
        .collect()
}

fn opt_string_column(batch: &RecordBatch, names: &[&str]) -> Vec<Option<String>> {
    let num_rows = batch.num_rows();
    let Some((_, col)) = find_column(batch, names) else {
        return vec![None; num_rows];
    };
    let Some(arr) = col.as_any().downcast_ref::<StringArray>() else {
        return vec![None; num_rows];
    };
    (0..num_rows)
        .map(|i| if arr.is_null(i) { None } else { Some(arr.value(i).to_string()) })
        .collect()
}

fn required_datetime_column(batch: &RecordBatch, names: &[&str], chunk_number: u64) -> Result<Vec<Option<DateTime<Utc>>>> {
    let num_rows = batch.num_rows();
    let Some((_, col)) = find_column(batch, names) else {
        return Err(PipelineError::ChunkType {
            chunk: chunk_number,
            row: 0,
            column: names[0].to_string(),
            message: "required timestamp column missing from this vintage's schema".to_string(),
        }
        .into());
    };

    if let Some(arr) = col.as_any().downcast_ref::<TimestampMicrosecondArray>() {
        Ok((0..num_rows)
            .map(|i| if arr.is_null(i) { None } else { DateTime::from_timestamp_micros(arr.value(i)) })
            .collect())
    } else if let Some(arr) = col.as_any().downcast_ref::<TimestampNanosecondArray>() {
        Ok((0..num_rows)
            .map(|i| if arr.is_null(i) { None } else { Some(DateTime::from_timestamp_nanos(arr.value(i))) })
            .collect())
    } else {
        Err(PipelineError::ChunkType {
            chunk: chunk_number,
            row: 0,
            column: names[0].to_string(),
            message: "timestamp column has an unsupported physical type".to_string(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opt_i32_column_returns_all_none_for_missing_column() {
        let batch = RecordBatch::new_empty(Arc::new(arrow::datatypes::Schema::empty()));
        assert_eq!(opt_i32_column(&batch, &["nonexistent"]), Vec::<CellResult<i32>>::new());
    }

    #[test]
    fn opt_decimal_column_converts_from_float_column() {
        let schema = Arc::new(arrow::datatypes::Schema::new(vec![arrow::datatypes::Field::new(
            "fare_amount",
            arrow::datatypes::DataType::Float64,
            true,
        )]));
        let array: Arc<dyn Array> = Arc::new(Float64Array::from(vec![Some(12.5), None]));
        let batch = RecordBatch::try_new(schema, vec![array]).unwrap();
        let values = opt_decimal_column(&batch, &["fare_amount"]);
        assert_eq!(values[0], Ok(Decimal::from_f64(12.5)));
        assert_eq!(values[1], Ok(None));
    }

    #[test]
    fn opt_i32_column_routes_only_the_offending_cell_to_an_error() {
        let schema = Arc::new(arrow::datatypes::Schema::new(vec![arrow::datatypes::Field::new(
            "payment_type",
            arrow::datatypes::DataType::Utf8,
            true,
        )]));
        let array: Arc<dyn Array> = Arc::new(StringArray::from(vec![Some("1"), Some("CRD"), None]));
        let batch = RecordBatch::try_new(schema, vec![array]).unwrap();
        let values = opt_i32_column(&batch, &["payment_type"]);

        assert_eq!(values[0], Ok(Some(1)));
        assert!(values[1].is_err());
        assert_eq!(values[2], Ok(None));
    }

    #[test]
    fn convert_batch_drops_only_the_row_with_a_bad_payment_type() {
        let schema = Arc::new(arrow::datatypes::Schema::new(vec![
            arrow::datatypes::Field::new(
                "tpep_pickup_datetime",
                arrow::datatypes::DataType::Timestamp(arrow::datatypes::TimeUnit::Microsecond, None),
                true,
            ),
            arrow::datatypes::Field::new(
                "tpep_dropoff_datetime",
                arrow::datatypes::DataType::Timestamp(arrow::datatypes::TimeUnit::Microsecond, None),
                true,
            ),
            arrow::datatypes::Field::new("payment_type", arrow::datatypes::DataType::Utf8, true),
        ]));

        let pickup: Arc<dyn Array> = Arc::new(TimestampMicrosecondArray::from(vec![0i64, 0i64]));
        let dropoff: Arc<dyn Array> = Arc::new(TimestampMicrosecondArray::from(vec![60_000_000i64, 60_000_000i64]));
        let payment_type: Arc<dyn Array> = Arc::new(StringArray::from(vec![Some("1"), Some("CRD")]));

        let batch = RecordBatch::try_new(schema, vec![pickup, dropoff, payment_type]).unwrap();

        let converted = convert_batch(&batch, 1, "yellow_tripdata_2024-01.parquet").unwrap();

        assert_eq!(converted.valid.len(), 1);
        assert_eq!(converted.invalid.len(), 1);
        assert_eq!(converted.invalid[0].error_type, ErrorCategory::TypeError);
        assert_eq!(converted.invalid[0].row_number_in_chunk, 1);
    }
}
