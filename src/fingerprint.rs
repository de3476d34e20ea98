use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

use crate::types::TripRow;

/// The canonical column set for fingerprinting, lowercased and sorted by
/// name. This is exactly the target schema's domain columns (the
/// superset across source vintages), so a row missing an optional column
/// in an older file still fingerprints identically to the same logical
/// row in a vintage that has it: the missing value canonicalizes to the
/// same empty string either way.
pub const CANONICAL_COLUMNS: &[&str] = &[
    "airport_fee",
    "cbd_congestion_fee",
    "congestion_surcharge",
    "dropoff_datetime",
    "dropoff_location_id",
    "extra",
    "fare_amount",
    "improvement_surcharge",
    "mta_tax",
    "passenger_count",
    "payment_type",
    "pickup_datetime",
    "pickup_location_id",
    "rate_code_id",
    "store_and_fwd_flag",
    "tip_amount",
    "tolls_amount",
    "total_amount",
    "trip_distance",
    "vendor_id",
];

fn canonical_opt_i32(v: Option<i32>) -> String {
    v.map(|n| n.to_string()).unwrap_or_default()
}

fn canonical_opt_string(v: &Option<String>) -> String {
    v.clone().unwrap_or_default()
}

/// Fixed 10 fractional digits, never scientific notation. This format is
/// pinned forever: changing it would change every historical fingerprint.
fn canonical_opt_f64(v: Option<f64>) -> String {
    match v {
        Some(n) => format!("{n:.10}"),
        None => String::new(),
    }
}

fn canonical_opt_decimal(v: &Option<Decimal>) -> String {
    match v {
        Some(d) => format!("{d:.10}"),
        None => String::new(),
    }
}

/// ISO-8601, seconds precision. Pinned forever alongside the float
/// precision above.
fn canonical_datetime(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Ordered (column, canonical value) pairs for `row`, matching
/// [`CANONICAL_COLUMNS`].
fn canonical_fields(row: &TripRow) -> [(&'static str, String); 20] {
    [
        ("airport_fee", canonical_opt_decimal(&row.airport_fee)),
        ("cbd_congestion_fee", canonical_opt_decimal(&row.cbd_congestion_fee)),
        ("congestion_surcharge", canonical_opt_decimal(&row.congestion_surcharge)),
        ("dropoff_datetime", canonical_datetime(row.dropoff_datetime)),
        ("dropoff_location_id", canonical_opt_i32(row.dropoff_location_id)),
        ("extra", canonical_opt_decimal(&row.extra)),
        ("fare_amount", canonical_opt_decimal(&row.fare_amount)),
        ("improvement_surcharge", canonical_opt_decimal(&row.improvement_surcharge)),
        ("mta_tax", canonical_opt_decimal(&row.mta_tax)),
        ("passenger_count", canonical_opt_i32(row.passenger_count)),
        ("payment_type", canonical_opt_i32(row.payment_type)),
        ("pickup_datetime", canonical_datetime(row.pickup_datetime)),
        ("pickup_location_id", canonical_opt_i32(row.pickup_location_id)),
        ("rate_code_id", canonical_opt_i32(row.rate_code_id)),
        ("store_and_fwd_flag", canonical_opt_string(&row.store_and_fwd_flag)),
        ("tip_amount", canonical_opt_decimal(&row.tip_amount)),
        ("tolls_amount", canonical_opt_decimal(&row.tolls_amount)),
        ("total_amount", canonical_opt_decimal(&row.total_amount)),
        ("trip_distance", canonical_opt_f64(row.trip_distance)),
        ("vendor_id", canonical_opt_i32(row.vendor_id)),
    ]
}

/// 64-character lowercase hex SHA-256 over the canonical (name, value)
/// pairs, sorted by column name. This is the primary key of the
/// normalized trips table: identical logical rows fingerprint
/// identically across processes and source vintages.
pub fn compute_fingerprint(row: &TripRow) -> String {
    let mut hasher = Sha256::new();
    for (name, value) in canonical_fields(row) {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_row() -> TripRow {
        TripRow {
            vendor_id: Some(1),
            pickup_datetime: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            dropoff_datetime: Utc.with_ymd_and_hms(2024, 1, 1, 0, 15, 0).unwrap(),
            passenger_count: Some(1),
            trip_distance: Some(2.5),
            rate_code_id: Some(1),
            store_and_fwd_flag: Some("N".to_string()),
            pickup_location_id: Some(100),
            dropoff_location_id: Some(200),
            payment_type: Some(1),
            fare_amount: Some(Decimal::new(1000, 2)),
            extra: Some(Decimal::ZERO),
            mta_tax: Some(Decimal::new(50, 2)),
            tip_amount: Some(Decimal::new(200, 2)),
            tolls_amount: Some(Decimal::ZERO),
            improvement_surcharge: Some(Decimal::new(30, 2)),
            total_amount: Some(Decimal::new(1280, 2)),
            congestion_surcharge: Some(Decimal::new(250, 2)),
            airport_fee: None,
            cbd_congestion_fee: None,
        }
    }

    #[test]
    fn fingerprint_is_64_char_lowercase_hex() {
        let fp = compute_fingerprint(&sample_row());
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let row = sample_row();
        assert_eq!(compute_fingerprint(&row), compute_fingerprint(&row));
    }

    #[test]
    fn fingerprint_unaffected_by_missing_optional_columns_across_vintages() {
        // A 2020-06-style row (no cbd_congestion_fee/airport_fee support) and a
        // 2024-01-style row with the same logical values but explicit None in
        // those columns fingerprint identically: the missing column always
        // canonicalizes to the empty string.
        let a = sample_row();
        let mut b = sample_row();
        b.airport_fee = None;
        b.cbd_congestion_fee = None;
        assert_eq!(compute_fingerprint(&a), compute_fingerprint(&b));
    }

    #[test]
    fn fingerprint_changes_when_a_fare_component_changes() {
        let a = sample_row();
        let mut b = sample_row();
        b.tip_amount = Some(Decimal::new(999, 2));
        assert_ne!(compute_fingerprint(&a), compute_fingerprint(&b));
    }

    #[test]
    fn float_canonicalization_never_uses_scientific_notation() {
        assert_eq!(canonical_opt_f64(Some(0.0000001)), "0.0000001000");
        assert_eq!(canonical_opt_f64(None), "");
    }

    #[test]
    fn datetime_canonicalization_is_seconds_precision_iso8601() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 5, 13, 30, 45).unwrap();
        assert_eq!(canonical_datetime(dt), "2024-01-05T13:30:45Z");
    }
}
