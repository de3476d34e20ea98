use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;

use crate::error::PipelineError;
use crate::types::format_year_month;

const TRIP_DATA_BASE_URL: &str = "https://d37ci6vzurychx.cloudfront.net/trip-data";
const ZONE_LOOKUP_URL: &str = "https://d37ci6vzurychx.cloudfront.net/misc/taxi+_zone_lookup.csv";
const ZONE_SHAPEFILE_URL: &str = "https://d37ci6vzurychx.cloudfront.net/misc/taxi_zones.zip";

const MAX_ATTEMPTS: u32 = 3;

/// Download `url` to `dest` with retry, reusing `dest` if it already
/// exists and is non-empty. Backoff is 1s, 2s, 4s between attempts,
/// mirroring the batch-insert retry loop used elsewhere in the pipeline.
async fn fetch_with_retry(url: &str, dest: &Path, what: &str) -> Result<PathBuf> {
    if let Ok(metadata) = tokio::fs::metadata(dest).await {
        if metadata.len() > 0 {
            tracing::debug!(path = %dest.display(), "reusing cached {}", what);
            return Ok(dest.to_path_buf());
        }
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create cache directory {}", parent.display()))?;
    }

    let client = reqwest::Client::new();
    let mut attempt = 0u32;
    let mut last_error = None;

    while attempt < MAX_ATTEMPTS {
        match download_once(&client, url, dest).await {
            Ok(path) => return Ok(path),
            Err(e) => {
                if is_not_found(&e) {
                    return Err(PipelineError::NotFound { what: what.to_string() }.into());
                }
                attempt += 1;
                last_error = Some(e);
                if attempt < MAX_ATTEMPTS {
                    let backoff_secs = 2u64.pow(attempt - 1);
                    tracing::warn!(
                        "Fetch of {} failed (attempt {}/{}), retrying in {}s",
                        what,
                        attempt,
                        MAX_ATTEMPTS,
                        backoff_secs,
                    );
                    sleep(Duration::from_secs(backoff_secs)).await;
                }
            }
        }
    }

    Err(PipelineError::Network {
        what: what.to_string(),
        source: last_error.unwrap(),
    }
    .into())
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<reqwest::Error>()
        .and_then(|e| e.status())
        .map(|s| s.as_u16() == 404)
        .unwrap_or(false)
}

async fn download_once(client: &reqwest::Client, url: &str, dest: &Path) -> Result<PathBuf> {
    use futures::StreamExt;

    let response = client.get(url).send().await?.error_for_status()?;
    let tmp_path = dest.with_extension("part");

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    let mut stream = std::pin::pin!(response.bytes_stream());
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, dest).await?;
    Ok(dest.to_path_buf())
}

/// Resolve the local cache path for (year, month), downloading it first
/// if absent.
pub async fn fetch_month(data_dir: &Path, year: i32, month: u32) -> Result<PathBuf> {
    let label = format_year_month(year, month);
    let url = format!("{TRIP_DATA_BASE_URL}/yellow_tripdata_{label}.parquet");
    let dest = data_dir.join(format!("yellow_tripdata_{label}.parquet"));
    fetch_with_retry(&url, &dest, &format!("trip data for {label}")).await
}

/// Resolve the local cache path for the zone lookup CSV, downloading it
/// first if absent.
pub async fn fetch_zone_lookup(data_dir: &Path) -> Result<PathBuf> {
    let dest = data_dir.join("taxi_zone_lookup.csv");
    fetch_with_retry(ZONE_LOOKUP_URL, &dest, "zone lookup CSV").await
}

/// Resolve the local cache path for the zone shapefile archive,
/// downloading and extracting it first if absent. Returns the directory
/// holding the extracted `.shp`/`.dbf`/`.prj` members.
pub async fn fetch_zone_shapefile(data_dir: &Path) -> Result<PathBuf> {
    let archive_dest = data_dir.join("taxi_zones.zip");
    let extract_dir = data_dir.join("taxi_zones");

    if tokio::fs::metadata(&extract_dir).await.is_ok() {
        tracing::debug!(path = %extract_dir.display(), "reusing extracted zone shapefile");
        return Ok(extract_dir);
    }

    let archive_path = fetch_with_retry(ZONE_SHAPEFILE_URL, &archive_dest, "zone shapefile archive").await?;
    extract_zip(&archive_path, &extract_dir)
        .await
        .context("Failed to extract zone shapefile archive")?;

    Ok(extract_dir)
}

async fn extract_zip(archive_path: &Path, extract_dir: &Path) -> Result<()> {
    let archive_path = archive_path.to_path_buf();
    let extract_dir = extract_dir.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::open(&archive_path)?;
        let mut zip = zip::ZipArchive::new(file)?;
        std::fs::create_dir_all(&extract_dir)?;

        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;
            let Some(name) = entry.enclosed_name() else {
                continue;
            };
            let out_path = extract_dir.join(name);
            if entry.is_dir() {
                std::fs::create_dir_all(&out_path)?;
                continue;
            }
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out_file = std::fs::File::create(&out_path)?;
            std::io::copy(&mut entry, &mut out_file)?;
        }
        Ok(())
    })
    .await??;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_url_matches_expected_cloudfront_layout() {
        let label = format_year_month(2024, 3);
        let url = format!("{TRIP_DATA_BASE_URL}/yellow_tripdata_{label}.parquet");
        assert_eq!(
            url,
            "https://d37ci6vzurychx.cloudfront.net/trip-data/yellow_tripdata_2024-03.parquet"
        );
    }

    #[tokio::test]
    async fn fetch_with_retry_reuses_existing_nonempty_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("cached.parquet");
        tokio::fs::write(&dest, b"already-here").await.unwrap();

        let result = fetch_with_retry("http://127.0.0.1:0/unreachable", &dest, "test file").await;
        assert!(result.is_ok());
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"already-here");
    }
}
