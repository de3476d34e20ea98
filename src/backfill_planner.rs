use anyhow::{anyhow, Result};
use chrono::{Datelike, NaiveDate};
use sqlx::PgPool;
use std::path::Path;

use crate::processing_log;
use crate::types::{format_year_month, MonthDisposition, PlannedMonth};

const EARLIEST_YEAR: i32 = 2009;
const EARLIEST_MONTH: u32 = 1;
const MAX_RETRY_ATTEMPTS: i32 = 3;

/// A user-supplied backfill spec, expanded into an ordered month list by
/// [`plan`]. Parsed once at config-load time so a malformed spec is a
/// `Config` error, not a runtime surprise mid-pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillSpec {
    /// Only months for which a local file already exists.
    Empty,
    /// Exactly this set, ascending.
    Explicit(Vec<(i32, u32)>),
    /// The N calendar months strictly preceding the current month.
    LastN(u32),
    /// Every month in [2009-01, current_month-1].
    All,
}

impl BackfillSpec {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(BackfillSpec::Empty);
        }
        if trimmed.eq_ignore_ascii_case("all") {
            return Ok(BackfillSpec::All);
        }
        if trimmed.eq_ignore_ascii_case("last_6_months") {
            return Ok(BackfillSpec::LastN(6));
        }
        if trimmed.eq_ignore_ascii_case("last_12_months") {
            return Ok(BackfillSpec::LastN(12));
        }

        let mut months = Vec::new();
        for part in trimmed.split(',') {
            months.push(parse_year_month(part.trim())?);
        }
        months.sort_unstable();
        months.dedup();
        Ok(BackfillSpec::Explicit(months))
    }
}

fn parse_year_month(s: &str) -> Result<(i32, u32)> {
    let (y, m) = s
        .split_once('-')
        .ok_or_else(|| anyhow!("invalid month spec '{}', expected YYYY-MM", s))?;
    let year: i32 = y
        .parse()
        .map_err(|_| anyhow!("invalid year in '{}'", s))?;
    let month: u32 = m
        .parse()
        .map_err(|_| anyhow!("invalid month in '{}'", s))?;
    if !(1..=12).contains(&month) {
        return Err(anyhow!("month out of range in '{}'", s));
    }
    Ok((year, month))
}

/// Every month in [2009-01, current_month-1], ascending.
fn all_months(today: NaiveDate) -> Vec<(i32, u32)> {
    let (end_year, end_month) = previous_month(today.year(), today.month());
    let mut months = Vec::new();
    let mut y = EARLIEST_YEAR;
    let mut m = EARLIEST_MONTH;
    while (y, m) <= (end_year, end_month) {
        months.push((y, m));
        (y, m) = next_month(y, m);
    }
    months
}

/// The N calendar months strictly preceding `today`'s month, ascending.
fn last_n_months(n: u32, today: NaiveDate) -> Vec<(i32, u32)> {
    let mut months = Vec::with_capacity(n as usize);
    let (mut y, mut m) = (today.year(), today.month());
    for _ in 0..n {
        (y, m) = previous_month(y, m);
        months.push((y, m));
    }
    months.reverse();
    months
}

fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

/// Months for which a local cache file `yellow_tripdata_YYYY-MM.parquet`
/// already exists under `data_dir`.
fn cached_months(data_dir: &Path) -> Vec<(i32, u32)> {
    let mut months = Vec::new();
    let Ok(entries) = std::fs::read_dir(data_dir) else {
        return months;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name
            .strip_prefix("yellow_tripdata_")
            .and_then(|s| s.strip_suffix(".parquet"))
        {
            if let Ok((y, m)) = parse_year_month(rest) {
                months.push((y, m));
            }
        }
    }
    months.sort_unstable();
    months
}

/// Expand `spec` into an ordered (year, month) list, independent of the
/// processing log.
pub fn expand(spec: &BackfillSpec, data_dir: &Path, today: NaiveDate) -> Vec<(i32, u32)> {
    match spec {
        BackfillSpec::Empty => cached_months(data_dir),
        BackfillSpec::Explicit(months) => months.clone(),
        BackfillSpec::LastN(n) => last_n_months(*n, today),
        BackfillSpec::All => all_months(today),
    }
}

/// Expand `spec` and classify each month against `ProcessingLog`,
/// producing the ordered plan the orchestrator executes.
pub async fn plan(
    spec: &BackfillSpec,
    data_dir: &Path,
    pool: &PgPool,
    today: NaiveDate,
) -> Result<Vec<PlannedMonth>> {
    let months = expand(spec, data_dir, today);
    let mut planned = Vec::with_capacity(months.len());

    for (year, month) in months {
        let disposition = match processing_log::get(pool, year, month as i32).await? {
            None => MonthDisposition::New,
            Some(row) => match row.status.as_str() {
                "completed" => MonthDisposition::Skip {
                    records_loaded: row.records_loaded,
                },
                "in_progress" => MonthDisposition::Retry {
                    attempt_count: row.attempt_count,
                },
                "failed" if row.attempt_count < MAX_RETRY_ATTEMPTS => MonthDisposition::Retry {
                    attempt_count: row.attempt_count,
                },
                _ => MonthDisposition::Skip {
                    records_loaded: row.records_loaded,
                },
            },
        };
        planned.push(PlannedMonth {
            year,
            month,
            disposition,
        });
        tracing::debug!(
            month = %format_year_month(year, month),
            "planned month"
        );
    }

    Ok(planned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_spec() {
        assert_eq!(BackfillSpec::parse("").unwrap(), BackfillSpec::Empty);
    }

    #[test]
    fn parse_all_spec() {
        assert_eq!(BackfillSpec::parse("all").unwrap(), BackfillSpec::All);
    }

    #[test]
    fn parse_last_n_specs() {
        assert_eq!(BackfillSpec::parse("last_6_months").unwrap(), BackfillSpec::LastN(6));
        assert_eq!(BackfillSpec::parse("last_12_months").unwrap(), BackfillSpec::LastN(12));
    }

    #[test]
    fn parse_explicit_spec_sorts_and_dedups() {
        let spec = BackfillSpec::parse("2024-02,2024-01,2024-01").unwrap();
        assert_eq!(spec, BackfillSpec::Explicit(vec![(2024, 1), (2024, 2)]));
    }

    #[test]
    fn parse_rejects_bad_month() {
        assert!(BackfillSpec::parse("2024-13").is_err());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(BackfillSpec::parse("not-a-spec-at-all").is_err());
    }

    #[test]
    fn last_n_months_is_strictly_preceding_and_ascending() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let months = last_n_months(3, today);
        assert_eq!(months, vec![(2023, 12), (2024, 1), (2024, 2)]);
    }

    #[test]
    fn all_months_spans_earliest_to_previous_month() {
        let today = NaiveDate::from_ymd_opt(2009, 3, 1).unwrap();
        let months = all_months(today);
        assert_eq!(months, vec![(2009, 1), (2009, 2)]);
    }

    #[test]
    fn previous_month_wraps_year_boundary() {
        assert_eq!(previous_month(2024, 1), (2023, 12));
    }

    #[test]
    fn next_month_wraps_year_boundary() {
        assert_eq!(next_month(2023, 12), (2024, 1));
    }
}
