use ahash::AHashMap;
use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::types::LocationDimEntry;

const MANHATTAN_BOROUGH: &str = "Manhattan";
const AIRPORT_ZONE_MARKERS: &[&str] = &["Airport"];

/// Read-only, in-memory lookup from natural keys to dimension surrogate
/// keys, built once after reference data load and handed explicitly to
/// the transformer rather than kept as a global: a process that reloads
/// reference data mid-run constructs a fresh cache instead of mutating
/// one shared everywhere.
#[derive(Debug, Clone)]
pub struct DimensionCache {
    pub locations: AHashMap<i32, LocationDimEntry>,
    pub vendors: AHashMap<i32, i32>,
    pub payment_types: AHashMap<i32, i32>,
    pub rate_codes: AHashMap<i32, i32>,
}

impl DimensionCache {
    pub fn location(&self, locationid: i32) -> Option<&LocationDimEntry> {
        self.locations.get(&locationid)
    }

    pub fn vendor_key(&self, vendor_id: i32) -> Option<i32> {
        self.vendors.get(&vendor_id).copied()
    }

    pub fn payment_type_key(&self, payment_type: i32) -> Option<i32> {
        self.payment_types.get(&payment_type).copied()
    }

    pub fn rate_code_key(&self, rate_code_id: i32) -> Option<i32> {
        self.rate_codes.get(&rate_code_id).copied()
    }
}

/// Build the dimension cache from the already-populated dimension
/// tables. Must run after [`crate::reference_loader`] and the dimension
/// tables are upserted from it.
pub async fn build(pool: &PgPool) -> Result<DimensionCache> {
    let locations = load_locations(pool).await?;
    let vendors = load_surrogate_map(pool, "dim_vendor", "vendor_id", "vendor_key").await?;
    let payment_types = load_surrogate_map(pool, "dim_payment_type", "payment_type", "payment_type_key").await?;
    let rate_codes = load_surrogate_map(pool, "dim_rate_code", "rate_code_id", "rate_code_key").await?;

    tracing::info!(
        locations = locations.len(),
        vendors = vendors.len(),
        payment_types = payment_types.len(),
        rate_codes = rate_codes.len(),
        "built dimension cache"
    );

    Ok(DimensionCache {
        locations,
        vendors,
        payment_types,
        rate_codes,
    })
}

async fn load_locations(pool: &PgPool) -> Result<AHashMap<i32, LocationDimEntry>> {
    let rows: Vec<(i32, i32, String, String, bool, bool)> = sqlx::query_as(
        r#"
        SELECT location_key, locationid, borough, zone, is_airport, is_manhattan
        FROM dim_locations
        "#,
    )
    .fetch_all(pool)
    .await
    .context("Failed to load dim_locations into the dimension cache")?;

    let mut map = AHashMap::with_capacity(rows.len());
    for (location_key, locationid, borough, zone, is_airport, is_manhattan) in rows {
        map.insert(
            locationid,
            LocationDimEntry {
                location_key,
                borough,
                zone,
                is_airport,
                is_manhattan,
            },
        );
    }
    Ok(map)
}

async fn load_surrogate_map(pool: &PgPool, table: &str, natural_key: &str, surrogate_key: &str) -> Result<AHashMap<i32, i32>> {
    let sql = format!("SELECT {natural_key}, {surrogate_key} FROM {table}");
    let rows: Vec<(i32, i32)> = sqlx::query_as(&sql)
        .fetch_all(pool)
        .await
        .with_context(|| format!("Failed to load {table} into the dimension cache"))?;

    Ok(rows.into_iter().collect())
}

/// Whether `zone` should be flagged as an airport zone, per the fixed
/// TLC zone naming convention (`"JFK Airport"`, `"LaGuardia Airport"`,
/// `"Newark Airport"`).
pub fn is_airport_zone(zone: &str) -> bool {
    AIRPORT_ZONE_MARKERS.iter().any(|marker| zone.contains(marker))
}

pub fn is_manhattan_borough(borough: &str) -> bool {
    borough == MANHATTAN_BOROUGH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn airport_zone_detection_matches_known_zone_names() {
        assert!(is_airport_zone("JFK Airport"));
        assert!(is_airport_zone("LaGuardia Airport"));
        assert!(is_airport_zone("Newark Airport"));
        assert!(!is_airport_zone("Alphabet City"));
    }

    #[test]
    fn manhattan_borough_detection_is_exact() {
        assert!(is_manhattan_borough("Manhattan"));
        assert!(!is_manhattan_borough("Brooklyn"));
    }

    #[test]
    fn dimension_cache_lookups_return_none_for_unknown_keys() {
        let cache = DimensionCache {
            locations: AHashMap::new(),
            vendors: AHashMap::new(),
            payment_types: AHashMap::new(),
            rate_codes: AHashMap::new(),
        };
        assert!(cache.location(999).is_none());
        assert!(cache.vendor_key(999).is_none());
    }
}
