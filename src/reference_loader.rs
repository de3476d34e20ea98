use anyhow::{Context, Result};
use geo::{AffineTransform, MapCoordsInPlace};
use geo_types::Geometry;
use indicatif::{ProgressBar, ProgressStyle};
use sqlx::PgPool;
use std::path::Path;

use crate::error::PipelineError;
use crate::types::{ZoneLookup, ZoneShape};

/// EPSG:2263 (NY State Plane Long Island, US survey feet) is the CRS the
/// real TLC zone shapefile already ships in, so this is the identity
/// transform in practice. Kept as an explicit step rather than assumed,
/// so a future vintage shipped in EPSG:4326 only needs its `AffineTransform`
/// swapped in here, not a new geometry pipeline.
fn reproject_to_epsg_2263(geometry: &mut Geometry<f64>) {
    let identity = AffineTransform::identity();
    geometry.map_coords_in_place(|c| identity.apply(c));
}

/// Load the 263-row zone lookup CSV, dropping rows with a null
/// `locationid`, `borough`, `zone`, or `service_zone`, and upsert them.
pub async fn load_zone_lookup(pool: &PgPool, csv_path: &Path) -> Result<usize> {
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("Failed to open zone lookup CSV at {}", csv_path.display()))?;

    let mut loaded = 0usize;
    let mut dropped = 0usize;

    for result in reader.records() {
        let record = result.map_err(|e| PipelineError::Reference(e.to_string()))?;
        let Some(row) = parse_zone_lookup_row(&record) else {
            dropped += 1;
            continue;
        };

        sqlx::query(
            r#"
            INSERT INTO taxi_zone_lookup (locationid, borough, zone, service_zone)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (locationid) DO UPDATE SET
                borough = EXCLUDED.borough,
                zone = EXCLUDED.zone,
                service_zone = EXCLUDED.service_zone
            "#,
        )
        .bind(row.locationid)
        .bind(&row.borough)
        .bind(&row.zone)
        .bind(&row.service_zone)
        .execute(pool)
        .await
        .map_err(|e| PipelineError::Reference(e.to_string()))?;

        loaded += 1;
    }

    tracing::info!(loaded, dropped, "loaded zone lookup");
    Ok(loaded)
}

fn parse_zone_lookup_row(record: &csv::StringRecord) -> Option<ZoneLookup> {
    let locationid: i32 = record.get(0)?.trim().parse().ok()?;
    let borough = non_empty(record.get(1)?)?;
    let zone = non_empty(record.get(2)?)?;
    let service_zone = non_empty(record.get(3)?)?;
    Some(ZoneLookup {
        locationid,
        borough,
        zone,
        service_zone,
    })
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("na") || trimmed.eq_ignore_ascii_case("n/a") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Load zone polygons from the extracted shapefile directory, reproject
/// to EPSG:2263, and upsert into `taxi_zone_shapes` as WKB.
pub async fn load_zone_shapes(pool: &PgPool, shapefile_dir: &Path) -> Result<usize> {
    let shp_path = find_shp_file(shapefile_dir)
        .ok_or_else(|| PipelineError::Reference("no .shp file found in zone shapefile archive".to_string()))?;

    let shapes = tokio::task::spawn_blocking(move || -> Result<Vec<ZoneShape>> {
        read_shapefile(&shp_path)
    })
    .await
    .context("shapefile parsing task panicked")??;

    let pb = ProgressBar::new(shapes.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} zones")
            .unwrap()
            .progress_chars("=>-"),
    );

    let mut loaded = 0usize;
    for shape in &shapes {
        sqlx::query(
            r#"
            INSERT INTO taxi_zone_shapes (objectid, locationid, zone, borough, shape_leng, shape_area, geometry)
            VALUES ($1, $2, $3, $4, $5, $6, ST_GeomFromWKB($7, 2263))
            ON CONFLICT (objectid) DO UPDATE SET
                locationid = EXCLUDED.locationid,
                zone = EXCLUDED.zone,
                borough = EXCLUDED.borough,
                shape_leng = EXCLUDED.shape_leng,
                shape_area = EXCLUDED.shape_area,
                geometry = EXCLUDED.geometry
            "#,
        )
        .bind(shape.objectid)
        .bind(shape.locationid)
        .bind(&shape.zone)
        .bind(&shape.borough)
        .bind(shape.shape_leng)
        .bind(shape.shape_area)
        .bind(&shape.geometry_wkb)
        .execute(pool)
        .await
        .map_err(|e| PipelineError::Reference(e.to_string()))?;

        loaded += 1;
        pb.inc(1);
    }
    pb.finish_with_message(format!("loaded {loaded} zone shapes"));

    Ok(loaded)
}

fn find_shp_file(dir: &Path) -> Option<std::path::PathBuf> {
    std::fs::read_dir(dir).ok()?.flatten().map(|e| e.path()).find(|p| {
        p.extension().and_then(|ext| ext.to_str()).map(|ext| ext.eq_ignore_ascii_case("shp")) == Some(true)
    })
}

fn read_shapefile(shp_path: &Path) -> Result<Vec<ZoneShape>> {
    use shapefile::Shape;

    let mut reader = shapefile::Reader::from_path(shp_path)
        .with_context(|| format!("Failed to open shapefile at {}", shp_path.display()))?;

    let mut shapes = Vec::new();
    for result in reader.iter_shapes_and_records() {
        let (shape, record) = result.context("Failed to read shapefile record")?;

        let objectid = field_i32(&record, "OBJECTID").unwrap_or_default();
        let locationid = field_i32(&record, "LocationID").unwrap_or_default();
        let zone = field_string(&record, "zone").unwrap_or_default();
        let borough = field_string(&record, "borough").unwrap_or_default();
        let shape_leng = field_f64(&record, "Shape_Leng").unwrap_or_default();
        let shape_area = field_f64(&record, "Shape_Area").unwrap_or_default();

        let mut geometry: Geometry<f64> = match shape {
            Shape::Polygon(p) => Geometry::MultiPolygon(
                geo_types::MultiPolygon::try_from(p).context("Failed to convert shapefile polygon")?,
            ),
            _ => anyhow::bail!("unexpected shape type in zone shapefile"),
        };
        reproject_to_epsg_2263(&mut geometry);

        let geometry_wkb = geometry_to_wkb(&geometry)?;

        shapes.push(ZoneShape {
            objectid,
            locationid,
            zone,
            borough,
            shape_leng,
            shape_area,
            geometry_wkb,
        });
    }

    Ok(shapes)
}

fn field_i32(record: &shapefile::dbase::Record, key: &str) -> Option<i32> {
    use shapefile::dbase::FieldValue;
    match record.get(key)? {
        FieldValue::Numeric(Some(n)) => Some(*n as i32),
        FieldValue::Character(Some(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn field_f64(record: &shapefile::dbase::Record, key: &str) -> Option<f64> {
    use shapefile::dbase::FieldValue;
    match record.get(key)? {
        FieldValue::Numeric(Some(n)) => Some(*n),
        _ => None,
    }
}

fn field_string(record: &shapefile::dbase::Record, key: &str) -> Option<String> {
    use shapefile::dbase::FieldValue;
    match record.get(key)? {
        FieldValue::Character(Some(s)) => Some(s.trim().to_string()),
        _ => None,
    }
}

/// Minimal WKB encoder for a 2D multipolygon, little-endian, no SRID
/// embedded (the SRID is supplied separately to `ST_GeomFromWKB`).
fn geometry_to_wkb(geometry: &Geometry<f64>) -> Result<Vec<u8>> {
    let Geometry::MultiPolygon(mp) = geometry else {
        anyhow::bail!("only multipolygon geometries are supported for zone shapes");
    };

    let mut buf = Vec::new();
    buf.push(1u8); // little-endian
    buf.extend_from_slice(&6u32.to_le_bytes()); // wkbMultiPolygon
    buf.extend_from_slice(&(mp.0.len() as u32).to_le_bytes());

    for polygon in &mp.0 {
        buf.push(1u8);
        buf.extend_from_slice(&3u32.to_le_bytes()); // wkbPolygon
        let rings: Vec<&geo_types::LineString<f64>> =
            std::iter::once(polygon.exterior()).chain(polygon.interiors()).collect();
        buf.extend_from_slice(&(rings.len() as u32).to_le_bytes());
        for ring in rings {
            buf.extend_from_slice(&(ring.0.len() as u32).to_le_bytes());
            for coord in &ring.0 {
                buf.extend_from_slice(&coord.x.to_le_bytes());
                buf.extend_from_slice(&coord.y.to_le_bytes());
            }
        }
    }

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_empty_rejects_blank_and_na_markers() {
        assert_eq!(non_empty("Manhattan"), Some("Manhattan".to_string()));
        assert_eq!(non_empty("  "), None);
        assert_eq!(non_empty("NA"), None);
        assert_eq!(non_empty("N/A"), None);
    }

    #[test]
    fn parse_zone_lookup_row_drops_rows_with_missing_fields() {
        let record = csv::StringRecord::from(vec!["4", "Manhattan", "", "Yellow Zone"]);
        assert!(parse_zone_lookup_row(&record).is_none());
    }

    #[test]
    fn parse_zone_lookup_row_accepts_complete_rows() {
        let record = csv::StringRecord::from(vec!["4", "Manhattan", "Alphabet City", "Yellow Zone"]);
        let row = parse_zone_lookup_row(&record).unwrap();
        assert_eq!(row.locationid, 4);
        assert_eq!(row.zone, "Alphabet City");
    }

    #[test]
    fn wkb_encoding_starts_with_little_endian_multipolygon_header() {
        let mp = geo_types::MultiPolygon::new(vec![geo_types::Polygon::new(
            geo_types::LineString::from(vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 0.0)]),
            vec![],
        )]);
        let geometry = Geometry::MultiPolygon(mp);
        let wkb = geometry_to_wkb(&geometry).unwrap();
        assert_eq!(wkb[0], 1u8);
        assert_eq!(u32::from_le_bytes(wkb[1..5].try_into().unwrap()), 6);
    }
}
