//! Shared CSV reading helpers for the upstream files.
//!
//! Upstream files mark unknown values with `X`, `*` or `NA`. Those (and empty
//! cells) become `None` here and never `0`.

use std::collections::HashMap;
use std::fs::File;

use camino::Utf8Path;
use chrono::NaiveDate;
use csv::StringRecord;
use tracing::warn;

use crate::error::DataError;

pub const SENTINELS: [&str; 3] = ["X", "*", "NA"];

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%d/%m/%Y", "%Y%m%d"];

/// A row that was skipped while loading a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowIssue {
    pub line: usize,
    pub message: String,
}

/// Opens `path` with a header row. `quote` of `None` disables quoting, which
/// some upstream files need because they use stray quote characters.
pub fn open_reader(path: &Utf8Path, quote: Option<u8>) -> Result<csv::Reader<File>, DataError> {
    if !path.as_std_path().exists() {
        return Err(DataError::MissingFile(path.as_std_path().to_path_buf()));
    }
    let file = File::open(path.as_std_path())
        .map_err(|err| DataError::Filesystem(format!("open {path}: {err}")))?;
    let mut builder = csv::ReaderBuilder::new();
    builder.flexible(true).trim(csv::Trim::All);
    match quote {
        Some(quote) => builder.quote(quote),
        None => builder.quoting(false),
    };
    Ok(builder.from_reader(file))
}

pub fn read_headers(reader: &mut csv::Reader<File>, path: &Utf8Path) -> Result<StringRecord, DataError> {
    reader
        .headers()
        .cloned()
        .map_err(|err| DataError::Parse {
            file: file_label(path),
            line: 1,
            message: format!("failed to read header row: {err}"),
        })
}

pub fn file_label(path: &Utf8Path) -> String {
    path.file_name().unwrap_or(path.as_str()).to_string()
}

pub fn is_absent(cell: &str) -> bool {
    let cell = cell.trim();
    cell.is_empty() || SENTINELS.contains(&cell)
}

/// A numeric cell; thousands separators are tolerated.
pub fn parse_value(cell: &str) -> Result<Option<f64>, String> {
    if is_absent(cell) {
        return Ok(None);
    }
    let cleaned = cell.trim().replace(',', "");
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .map(Some)
        .ok_or_else(|| format!("invalid number {cell:?}"))
}

/// An integral count cell; `12.0` is accepted, `12.5` is not.
pub fn parse_count(cell: &str) -> Result<Option<i64>, String> {
    match parse_value(cell)? {
        None => Ok(None),
        Some(value) if value.fract() == 0.0 => Ok(Some(value as i64)),
        Some(_) => Err(format!("invalid count {cell:?}")),
    }
}

/// `Ok(None)` for a sentinel date, an error for anything unparseable.
pub fn parse_date(cell: &str) -> Result<Option<NaiveDate>, String> {
    if is_absent(cell) {
        return Ok(None);
    }
    let cell = cell.trim();
    let candidate = cell.get(..10).filter(|_| cell.contains('T')).unwrap_or(cell);
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(candidate, format).ok())
        .map(Some)
        .ok_or_else(|| format!("invalid date {cell:?}"))
}

pub fn normalize_header_name(name: &str) -> String {
    name.trim().trim_start_matches('\u{feff}').to_ascii_lowercase()
}

pub fn build_header_map(headers: &StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (normalize_header_name(name), idx))
        .collect()
}

/// The first column whose normalised name equals one of `names`, or starts
/// with one of `prefixes`.
pub fn find_column(
    header_map: &HashMap<String, usize>,
    names: &[&str],
    prefixes: &[&str],
) -> Option<usize> {
    names
        .iter()
        .find_map(|name| header_map.get(*name).copied())
        .or_else(|| {
            let mut matches: Vec<(&String, usize)> = header_map
                .iter()
                .filter(|(name, _)| prefixes.iter().any(|prefix| name.starts_with(prefix)))
                .map(|(name, idx)| (name, *idx))
                .collect();
            matches.sort_by_key(|(_, idx)| *idx);
            matches.first().map(|(_, idx)| *idx)
        })
}

pub fn header_line(headers: &StringRecord) -> String {
    headers.iter().collect::<Vec<_>>().join(",")
}

/// Logs skipped rows, collapsing long runs into a count.
pub fn report_issues(file: &str, issues: &[RowIssue]) {
    const SHOWN: usize = 5;
    for issue in issues.iter().take(SHOWN) {
        warn!("{file}:{}: skipped row: {}", issue.line, issue.message);
    }
    if issues.len() > SHOWN {
        warn!("{file}: {} more rows skipped", issues.len() - SHOWN);
    }
}

/// Logs the skipped rows; a file where every data row failed is fatal.
pub fn check_parsed(file: &str, rows: usize, issues: &[RowIssue]) -> Result<(), DataError> {
    report_issues(file, issues);
    if rows > 0 && issues.len() == rows {
        return Err(DataError::Unparseable {
            file: file.to_string(),
        });
    }
    Ok(())
}
