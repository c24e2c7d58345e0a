// Partition layout.
//
// metrics/res={resolution_minutes}/month={YYYY-MM}/{min_ts}-{hash16}.parquet
//
// Month directories carry the partitioning contract; the blake3 content hash
// in the filename makes re-inserting an identical batch overwrite the same
// object instead of duplicating it.

use chrono::{DateTime, Datelike, TimeZone, Utc};

pub(crate) const METRICS_ROOT: &str = "metrics";

pub(crate) fn resolution_dir(resolution: u16) -> String {
    format!("{METRICS_ROOT}/res={resolution}/")
}

pub(crate) fn month_dir(resolution: u16, year: i32, month: u32) -> String {
    format!("{METRICS_ROOT}/res={resolution}/month={year:04}-{month:02}/")
}

pub(crate) fn file_path(
    resolution: u16,
    year: i32,
    month: u32,
    min_timestamp_ms: i64,
    hash_hex: &str,
) -> String {
    let prefix = if hash_hex.len() >= 16 {
        &hash_hex[..16]
    } else {
        hash_hex
    };
    format!(
        "{}{}-{}.parquet",
        month_dir(resolution, year, month),
        min_timestamp_ms,
        prefix
    )
}

/// Year and month a millisecond timestamp falls into.
pub(crate) fn month_of(timestamp_ms: i64) -> (i32, u32) {
    match DateTime::from_timestamp_millis(timestamp_ms) {
        Some(dt) => (dt.year(), dt.month()),
        None => (1970, 1),
    }
}

/// Start of a month, in milliseconds.
pub(crate) fn month_start_ms(year: i32, month: u32) -> i64 {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0)
}

/// Exclusive end of a month (start of the following month).
pub(crate) fn month_end_ms(year: i32, month: u32) -> i64 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    month_start_ms(next_year, next_month)
}

/// Months whose span intersects `[start_ms, end_ms)`.
pub(crate) fn months_between(start_ms: i64, end_ms: i64) -> Vec<(i32, u32)> {
    if end_ms <= start_ms {
        return Vec::new();
    }
    let (mut year, mut month) = month_of(start_ms);
    let mut out = Vec::new();
    while month_start_ms(year, month) < end_ms {
        out.push((year, month));
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    out
}

/// Parse a `month=YYYY-MM` directory segment.
pub(crate) fn parse_month_segment(segment: &str) -> Option<(i32, u32)> {
    let value = segment.trim_end_matches('/').strip_prefix("month=")?;
    let (year, month) = value.split_once('-')?;
    let year: i32 = year.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    if (1..=12).contains(&month) {
        Some((year, month))
    } else {
        None
    }
}

/// Minimum timestamp embedded in a data filename, for pruning.
pub(crate) fn parse_file_min_ts(name: &str) -> Option<i64> {
    name.split('-').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_path_shape() {
        // 2023-11-14T22:13:20Z
        let path = file_path(0, 2023, 11, 1_700_000_000_000, "deadbeefdeadbeefdeadbeef");
        assert_eq!(
            path,
            "metrics/res=0/month=2023-11/1700000000000-deadbeefdeadbeef.parquet"
        );
    }

    #[test]
    fn test_month_of() {
        assert_eq!(month_of(1_700_000_000_000), (2023, 11));
        assert_eq!(month_of(0), (1970, 1));
    }

    #[test]
    fn test_months_between_spans_year_boundary() {
        let start = month_start_ms(2023, 11) + 1;
        let end = month_start_ms(2024, 2) + 1;
        assert_eq!(
            months_between(start, end),
            vec![(2023, 11), (2023, 12), (2024, 1), (2024, 2)]
        );
    }

    #[test]
    fn test_months_between_empty_window() {
        assert!(months_between(100, 100).is_empty());
        assert!(months_between(200, 100).is_empty());
    }

    #[test]
    fn test_month_end_follows_start() {
        assert_eq!(month_end_ms(2023, 12), month_start_ms(2024, 1));
        assert!(month_end_ms(2024, 1) > month_start_ms(2024, 1));
    }

    #[test]
    fn test_parse_month_segment() {
        assert_eq!(parse_month_segment("month=2024-02/"), Some((2024, 2)));
        assert_eq!(parse_month_segment("month=2024-13/"), None);
        assert_eq!(parse_month_segment("res=0/"), None);
    }

    #[test]
    fn test_parse_file_min_ts() {
        assert_eq!(
            parse_file_min_ts("1700000000000-deadbeefdeadbeef.parquet"),
            Some(1_700_000_000_000)
        );
        assert_eq!(parse_file_min_ts("garbage.parquet"), None);
    }
}
