//! Scottish health-board data: populations, cases, deaths, intensive care,
//! deceased and testing.
//!
//! Most tables exist in a historical archive and a current upstream file with
//! a different layout. The archive seeds each series and current rows replace
//! it date by date.

use std::collections::{BTreeMap, HashMap};
use std::iter::Sum;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use csv::StringRecord;
use tracing::{debug, info, warn};

use crate::config::TableSchemaHint;
use crate::csv_util::{self, RowIssue};
use crate::domain::{
    CaseRecord, DateSeries, DeathRecord, EntityName, EntityValues, GOLDEN_JUBILEE, GRAND_TOTAL,
    ScaleFactor, TestRecord,
};
use crate::error::DataError;

pub const POPULATIONS_FILE: &str = "HB_Populations.csv";
pub const CASES_FILE: &str =
    "COVID19 - Daily Management Information - Scottish Health Boards - Cumulative cases.csv";
pub const INTENSIVE_CARE_FILE: &str =
    "COVID19 - Daily Management Information - Scottish Health Boards - ICU patients.csv";
pub const DECEASED_FILE: &str = "COVID19 - Daily Management Information - Scotland - Deaths.csv";
pub const TESTS_FILE: &str = "COVID19 - Daily Management Information - Scotland - Testing.csv";
pub const OLD_CASES_FILE: &str = "regional_cases.csv";
pub const OLD_DEATHS_FILE: &str = "regional_deaths.csv";
pub const OLD_INTENSIVE_CARE_FILE: &str = "intensive_care.csv";
pub const OLD_DECEASED_FILE: &str = "scot_test_positive_deceased.csv";
pub const OLD_TESTS_FILE: &str = "scot_tests.csv";

/// Files republished upstream on every revision.
pub const CURRENT_FILES: [&str; 4] = [CASES_FILE, INTENSIVE_CARE_FILE, DECEASED_FILE, TESTS_FILE];

/// Historical files that never change once downloaded.
pub const ARCHIVE_FILES: [&str; 6] = [
    POPULATIONS_FILE,
    OLD_CASES_FILE,
    OLD_DEATHS_FILE,
    OLD_INTENSIVE_CARE_FILE,
    OLD_DECEASED_FILE,
    OLD_TESTS_FILE,
];

const TOTAL_ALIASES: [&str; 3] = ["grand total", "scotland", "total"];

#[derive(Debug, Clone, Default)]
pub struct RegionalData {
    /// Sorted; excludes `Grand Total`.
    pub health_boards: Vec<EntityName>,
    /// Per health board, plus `Grand Total` as the sum of all boards.
    pub scale: BTreeMap<EntityName, ScaleFactor>,
    pub cases: DateSeries<CaseRecord>,
    pub deaths: DateSeries<DeathRecord>,
    /// Patients per board (plus the national hospital); counts, unscaled.
    pub intensive_cares: DateSeries<EntityValues<i64>>,
    pub intensive_care: DateSeries<i64>,
    /// Cumulative.
    pub deceased: DateSeries<i64>,
    pub tests: DateSeries<TestRecord>,
    /// Tables that failed to load, with the reason; their series stay empty.
    pub failures: Vec<String>,
}

impl RegionalData {
    pub fn last_date(&self) -> Option<NaiveDate> {
        self.cases.last_date()
    }

    fn record_failure(&mut self, what: &str, err: DataError) {
        warn!("Skipping {what} data: {err}");
        self.failures.push(format!("{what}: {err}"));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Populations {
    pub health_boards: Vec<EntityName>,
    pub scale: BTreeMap<EntityName, ScaleFactor>,
}

pub struct RegionalLoader {
    dir: Utf8PathBuf,
    numbers_per: u32,
    hint: TableSchemaHint,
}

impl RegionalLoader {
    pub fn new(dir: impl Into<Utf8PathBuf>, numbers_per: u32, hint: TableSchemaHint) -> Self {
        Self {
            dir: dir.into(),
            numbers_per,
            hint,
        }
    }

    /// Fails only when the population table is unusable; any other table
    /// that fails is recorded in [`RegionalData::failures`].
    pub fn load(&self) -> Result<RegionalData, DataError> {
        info!("Reading health board data ({POPULATIONS_FILE}).");
        let populations = load_populations(&self.dir.join(POPULATIONS_FILE), self.numbers_per)?;
        debug!("Read {} health boards.", populations.health_boards.len());

        let mut data = RegionalData {
            health_boards: populations.health_boards,
            scale: populations.scale,
            ..RegionalData::default()
        };
        let boards = EntityIndex::new(&data.health_boards);
        let scale = data.scale.clone();
        let per_capita =
            |entity: &str, raw: f64| scale.get(entity).and_then(|factor| factor.apply(raw));

        match self.load_entity_series("cases", Some(Seed::Entities(OLD_CASES_FILE)), CASES_FILE, &boards, &per_capita) {
            Ok(series) => data.cases = series,
            Err(err) => data.record_failure("cases", err),
        }
        match self.load_entity_series("deaths", None, OLD_DEATHS_FILE, &boards, &per_capita) {
            Ok(series) => data.deaths = series,
            Err(err) => data.record_failure("deaths", err),
        }

        let mut icu_names = data.health_boards.clone();
        icu_names.push(GOLDEN_JUBILEE.to_string());
        let units = EntityIndex::new(&icu_names);
        let count = |_: &str, raw: f64| Some(raw.round() as i64);
        match self.load_entity_series(
            "intensive care",
            Some(Seed::Aggregate(OLD_INTENSIVE_CARE_FILE)),
            INTENSIVE_CARE_FILE,
            &units,
            &count,
        ) {
            Ok(series) => {
                data.intensive_care = series
                    .iter()
                    .filter_map(|(date, record)| record.grand_total.map(|total| (*date, total)))
                    .collect();
                data.intensive_cares = series;
            }
            Err(err) => data.record_failure("intensive care", err),
        }

        match self.load_deceased() {
            Ok(series) => data.deceased = series,
            Err(err) => data.record_failure("deceased", err),
        }
        match self.load_tests() {
            Ok(series) => data.tests = series,
            Err(err) => data.record_failure("tests", err),
        }

        Ok(data)
    }

    fn load_entity_series<T, C>(
        &self,
        what: &str,
        seed: Option<Seed<'_>>,
        current: &str,
        index: &EntityIndex,
        convert: &C,
    ) -> Result<DateSeries<EntityValues<T>>, DataError>
    where
        T: Copy + Sum<T>,
        C: Fn(&str, f64) -> Option<T>,
    {
        info!("Reading {what} data ({current}).");
        let seed = match seed {
            Some(Seed::Entities(name)) => {
                self.optional(read_entity_table(&self.dir.join(name), index, self.hint, convert))?
            }
            Some(Seed::Aggregate(name)) => {
                self.optional(read_aggregate_table(&self.dir.join(name), index, convert))?
            }
            None => None,
        };
        let current = read_entity_table(&self.dir.join(current), index, self.hint, convert)?;
        let series = merge_entity_series(seed, current);
        debug!("Read {what} data for {}.", series.coverage());
        Ok(series)
    }

    fn load_deceased(&self) -> Result<DateSeries<i64>, DataError> {
        info!("Reading deceased data ({DECEASED_FILE}).");
        let mut series = self
            .optional(read_deceased(&self.dir.join(OLD_DECEASED_FILE)))?
            .unwrap_or_default();
        series.overlay(read_deceased(&self.dir.join(DECEASED_FILE))?);
        debug!("Read deceased data for {}.", series.coverage());
        Ok(series)
    }

    fn load_tests(&self) -> Result<DateSeries<TestRecord>, DataError> {
        info!("Reading tests data ({TESTS_FILE}).");
        let mut series = self
            .optional(read_tests(&self.dir.join(OLD_TESTS_FILE)))?
            .unwrap_or_default();
        series.overlay(read_tests(&self.dir.join(TESTS_FILE))?);
        debug!("Read tests data for {}.", series.coverage());
        Ok(series)
    }

    /// A missing historical file is skipped; any other failure is fatal.
    fn optional<T>(&self, result: Result<T, DataError>) -> Result<Option<T>, DataError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(DataError::MissingFile(path)) => {
                debug!("No historical file at {}, skipping.", path.display());
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

/// A historical file that seeds a table before the current file overlays it.
#[derive(Debug, Clone, Copy)]
enum Seed<'a> {
    Entities(&'a str),
    Aggregate(&'a str),
}

/// Case-insensitive entity lookup that also tolerates an `NHS ` prefix and
/// `&` written for `and`.
#[derive(Debug, Clone)]
pub struct EntityIndex {
    names: Vec<EntityName>,
    lookup: HashMap<String, EntityName>,
}

impl EntityIndex {
    pub fn new(names: &[EntityName]) -> Self {
        let lookup = names
            .iter()
            .map(|name| (normalize_entity_name(name), name.clone()))
            .collect();
        Self {
            names: names.to_vec(),
            lookup,
        }
    }

    pub fn names(&self) -> &[EntityName] {
        &self.names
    }

    pub fn resolve(&self, header: &str) -> Option<&EntityName> {
        self.lookup.get(&normalize_entity_name(header))
    }
}

pub fn normalize_entity_name(name: &str) -> String {
    let lowered = csv_util::normalize_header_name(name);
    let stripped = lowered.strip_prefix("nhs ").unwrap_or(&lowered);
    stripped
        .replace('&', " and ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_total_column(header: &str) -> bool {
    TOTAL_ALIASES.contains(&normalize_entity_name(header).as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableSchema {
    /// Date, then one column per entity in canonical order, then an optional
    /// total.
    Positional,
    /// Columns titled with entity names.
    Named,
    /// Date and a single Scotland-wide total, whatever the header says.
    Aggregate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout {
    pub schema: TableSchema,
    pub entities: Vec<(usize, EntityName)>,
    pub total: Option<usize>,
}

/// Maps a health-board table's columns onto entities.
///
/// With [`TableSchemaHint::Auto`] a header naming only known entities and
/// total columns is read by name; a header naming none of them but with the
/// right column count is read by position. A header that names some known
/// entities and some unknown ones is an [`DataError::UnknownEntity`].
pub fn detect_layout(
    headers: &StringRecord,
    index: &EntityIndex,
    hint: TableSchemaHint,
    file: &str,
) -> Result<ColumnLayout, DataError> {
    let ambiguous = || DataError::SchemaAmbiguity {
        file: file.to_string(),
        header: csv_util::header_line(headers),
    };
    let first = headers.get(0).map(csv_util::normalize_header_name);
    if first.as_deref() != Some("date") {
        return Err(ambiguous());
    }

    let unknown_entity = |entity: &str| DataError::UnknownEntity {
        file: file.to_string(),
        entity: entity.to_string(),
    };

    match hint {
        TableSchemaHint::Positional => positional_layout(headers, index).ok_or_else(ambiguous),
        TableSchemaHint::Named => {
            let (layout, unknown) = named_layout(headers, index);
            match unknown.first() {
                Some(entity) => Err(unknown_entity(entity)),
                None => Ok(layout),
            }
        }
        TableSchemaHint::Auto => {
            let (layout, unknown) = named_layout(headers, index);
            match unknown.first() {
                None => Ok(layout),
                Some(entity) if !layout.entities.is_empty() => Err(unknown_entity(entity)),
                Some(_) => positional_layout(headers, index).ok_or_else(ambiguous),
            }
        }
    }
}

fn named_layout(headers: &StringRecord, index: &EntityIndex) -> (ColumnLayout, Vec<String>) {
    let mut layout = ColumnLayout {
        schema: TableSchema::Named,
        entities: Vec::new(),
        total: None,
    };
    let mut unknown = Vec::new();
    for (idx, header) in headers.iter().enumerate().skip(1) {
        if header.trim().is_empty() {
            continue;
        }
        if is_total_column(header) {
            layout.total.get_or_insert(idx);
        } else if let Some(name) = index.resolve(header) {
            layout.entities.push((idx, name.clone()));
        } else {
            unknown.push(header.trim().to_string());
        }
    }
    (layout, unknown)
}

/// The second column is the total; any further columns are ignored.
pub fn aggregate_layout() -> ColumnLayout {
    ColumnLayout {
        schema: TableSchema::Aggregate,
        entities: Vec::new(),
        total: Some(1),
    }
}

fn positional_layout(headers: &StringRecord, index: &EntityIndex) -> Option<ColumnLayout> {
    let entities = index.names().len();
    let columns = headers.len();
    if columns != entities + 1 && columns != entities + 2 {
        return None;
    }
    Some(ColumnLayout {
        schema: TableSchema::Positional,
        entities: index
            .names()
            .iter()
            .enumerate()
            .map(|(offset, name)| (offset + 1, name.clone()))
            .collect(),
        total: (columns == entities + 2).then_some(entities + 1),
    })
}

/// One parsed row before the Grand Total is settled.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow<T> {
    pub values: BTreeMap<EntityName, Option<T>>,
    pub source_total: Option<T>,
}

pub fn read_entity_table<T, C>(
    path: &Utf8Path,
    index: &EntityIndex,
    hint: TableSchemaHint,
    convert: &C,
) -> Result<DateSeries<RawRow<T>>, DataError>
where
    T: Copy,
    C: Fn(&str, f64) -> Option<T>,
{
    read_with_layout(path, index, convert, |headers, file| {
        detect_layout(headers, index, hint, file)
    })
}

/// Reads a `Date,<total>` table as aggregate-only rows.
pub fn read_aggregate_table<T, C>(
    path: &Utf8Path,
    index: &EntityIndex,
    convert: &C,
) -> Result<DateSeries<RawRow<T>>, DataError>
where
    T: Copy,
    C: Fn(&str, f64) -> Option<T>,
{
    read_with_layout(path, index, convert, |headers, file| {
        if headers.len() < 2 {
            return Err(DataError::SchemaAmbiguity {
                file: file.to_string(),
                header: csv_util::header_line(headers),
            });
        }
        Ok(aggregate_layout())
    })
}

fn read_with_layout<T, C, L>(
    path: &Utf8Path,
    index: &EntityIndex,
    convert: &C,
    layout: L,
) -> Result<DateSeries<RawRow<T>>, DataError>
where
    T: Copy,
    C: Fn(&str, f64) -> Option<T>,
    L: FnOnce(&StringRecord, &str) -> Result<ColumnLayout, DataError>,
{
    let file = csv_util::file_label(path);
    let mut reader = csv_util::open_reader(path, None)?;
    let headers = csv_util::read_headers(&mut reader, path)?;
    let layout = layout(&headers, file.as_str())?;

    let mut series = DateSeries::new();
    let mut issues = Vec::new();
    let mut rows = 0;
    for (idx, result) in reader.records().enumerate() {
        let line = idx + 2;
        rows += 1;
        let parsed = result
            .map_err(|err| err.to_string())
            .and_then(|record| parse_entity_row(&record, &layout, index, convert));
        match parsed {
            Ok(Some((date, row))) => {
                series.insert(date, row);
            }
            Ok(None) => {}
            Err(message) => issues.push(RowIssue { line, message }),
        }
    }
    csv_util::check_parsed(&file, rows, &issues)?;
    Ok(series)
}

fn parse_entity_row<T, C>(
    record: &StringRecord,
    layout: &ColumnLayout,
    index: &EntityIndex,
    convert: &C,
) -> Result<Option<(NaiveDate, RawRow<T>)>, String>
where
    T: Copy,
    C: Fn(&str, f64) -> Option<T>,
{
    let Some(date) = csv_util::parse_date(record.get(0).unwrap_or(""))? else {
        return Ok(None);
    };
    let mut values: BTreeMap<EntityName, Option<T>> =
        index.names().iter().map(|name| (name.clone(), None)).collect();
    for (idx, name) in &layout.entities {
        let raw = csv_util::parse_value(record.get(*idx).unwrap_or(""))?;
        values.insert(name.clone(), raw.and_then(|raw| convert(name, raw)));
    }
    let source_total = match layout.total {
        Some(idx) => csv_util::parse_value(record.get(idx).unwrap_or(""))?
            .and_then(|raw| convert(GRAND_TOTAL, raw)),
        None => None,
    };
    Ok(Some((date, RawRow { values, source_total })))
}

/// Seed rows are kept as read; a seed row without entity values keeps the
/// file's own total. Current rows need at least one entity value and replace
/// the seed by date. Wherever entity values exist the Grand Total is their
/// sum, never the file's total column.
pub fn merge_entity_series<T>(
    seed: Option<DateSeries<RawRow<T>>>,
    current: DateSeries<RawRow<T>>,
) -> DateSeries<EntityValues<T>>
where
    T: Copy + Sum<T>,
{
    let mut merged = DateSeries::new();
    for (date, row) in seed.into_iter().flatten() {
        let mut record = EntityValues::new(row.values);
        if !record.has_any_value() {
            record.grand_total = row.source_total;
        }
        if record.has_any_value() || record.grand_total.is_some() {
            merged.insert(date, record);
        }
    }
    for (date, row) in current {
        let record = EntityValues::new(row.values);
        if record.has_any_value() {
            merged.insert(date, record);
        }
    }
    merged
}

pub fn load_populations(path: &Utf8Path, numbers_per: u32) -> Result<Populations, DataError> {
    let file = csv_util::file_label(path);
    let mut reader = csv_util::open_reader(path, None)?;
    let headers = csv_util::read_headers(&mut reader, path)?;
    let header_map = csv_util::build_header_map(&headers);
    let (Some(name_col), Some(population_col)) = (
        csv_util::find_column(&header_map, &["name"], &[]),
        csv_util::find_column(&header_map, &["population"], &[]),
    ) else {
        return Err(DataError::SchemaAmbiguity {
            file,
            header: csv_util::header_line(&headers),
        });
    };

    let mut scale = BTreeMap::new();
    let mut issues = Vec::new();
    let mut rows = 0;
    for (idx, result) in reader.records().enumerate() {
        let line = idx + 2;
        rows += 1;
        let record = match result {
            Ok(record) => record,
            Err(err) => {
                issues.push(RowIssue {
                    line,
                    message: err.to_string(),
                });
                continue;
            }
        };
        let name = record.get(name_col).unwrap_or("").trim();
        if name.is_empty() {
            issues.push(RowIssue {
                line,
                message: "missing name".to_string(),
            });
            continue;
        }
        if normalize_entity_name(name) == normalize_entity_name(GRAND_TOTAL) {
            continue;
        }
        match csv_util::parse_value(record.get(population_col).unwrap_or("")) {
            Ok(Some(population)) => {
                scale.insert(
                    name.to_string(),
                    ScaleFactor::from_population(population, numbers_per),
                );
            }
            Ok(None) => issues.push(RowIssue {
                line,
                message: format!("no population for {name}"),
            }),
            Err(message) => issues.push(RowIssue { line, message }),
        }
    }
    csv_util::check_parsed(&file, rows, &issues)?;
    if scale.is_empty() {
        return Err(DataError::Unparseable { file });
    }

    let health_boards: Vec<EntityName> = scale.keys().cloned().collect();
    let total = scale
        .values()
        .copied()
        .fold(ScaleFactor::from_population(0.0, numbers_per), |acc, factor| acc + factor);
    scale.insert(GRAND_TOTAL.to_string(), total);
    Ok(Populations {
        health_boards,
        scale,
    })
}

/// Date in the first column and the cumulative count in the second; rows
/// without a count are dropped.
pub fn read_deceased(path: &Utf8Path) -> Result<DateSeries<i64>, DataError> {
    let file = csv_util::file_label(path);
    let mut reader = csv_util::open_reader(path, None)?;
    csv_util::read_headers(&mut reader, path)?;

    let mut series = DateSeries::new();
    let mut issues = Vec::new();
    let mut rows = 0;
    for (idx, result) in reader.records().enumerate() {
        let line = idx + 2;
        rows += 1;
        let parsed = result.map_err(|err| err.to_string()).and_then(|record| {
            let date = csv_util::parse_date(record.get(0).unwrap_or(""))?;
            let value = csv_util::parse_count(record.get(1).unwrap_or(""))?;
            Ok(date.zip(value))
        });
        match parsed {
            Ok(Some((date, value))) => {
                series.insert(date, value);
            }
            Ok(None) => {}
            Err(message) => issues.push(RowIssue { line, message }),
        }
    }
    csv_util::check_parsed(&file, rows, &issues)?;
    Ok(series)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestSchema {
    /// Date, Conducted, Today Positive, Today Negative, Total Positive,
    /// Total Negative.
    Legacy,
    /// Date, Total Negative, Total Positive, Total, NHS Daily,
    /// NHS Cumulative, Regional Daily, Regional Cumulative.
    Current,
}

pub fn detect_test_schema(headers: &StringRecord, file: &str) -> Result<TestSchema, DataError> {
    let columns = (0..headers.len())
        .rev()
        .find(|&idx| !headers[idx].trim().is_empty())
        .map_or(0, |last| last + 1);
    match columns {
        6 => Ok(TestSchema::Legacy),
        8 => Ok(TestSchema::Current),
        _ => Err(DataError::SchemaAmbiguity {
            file: file.to_string(),
            header: csv_util::header_line(headers),
        }),
    }
}

pub fn read_tests(path: &Utf8Path) -> Result<DateSeries<TestRecord>, DataError> {
    let file = csv_util::file_label(path);
    let mut reader = csv_util::open_reader(path, None)?;
    let headers = csv_util::read_headers(&mut reader, path)?;
    let schema = detect_test_schema(&headers, &file)?;

    let mut cumulative: DateSeries<(Option<i64>, Option<i64>)> = DateSeries::new();
    let mut legacy = DateSeries::new();
    let mut issues = Vec::new();
    let mut rows = 0;
    for (idx, result) in reader.records().enumerate() {
        let line = idx + 2;
        rows += 1;
        let parsed = result.map_err(|err| err.to_string()).and_then(|record| {
            let Some(date) = csv_util::parse_date(record.get(0).unwrap_or(""))? else {
                return Ok(None);
            };
            let cell = |idx: usize| csv_util::parse_count(record.get(idx).unwrap_or(""));
            Ok(Some(match schema {
                TestSchema::Legacy => {
                    let (daily_positive, daily_negative) = (cell(2)?, cell(3)?);
                    TestRow::Complete(
                        date,
                        TestRecord {
                            total_positive: cell(4)?,
                            total_negative: cell(5)?,
                            daily_positive,
                            daily_negative,
                            positive_rate: TestRecord::positivity(daily_positive, daily_negative),
                        },
                    )
                }
                TestSchema::Current => TestRow::Cumulative(date, cell(2)?, cell(1)?),
            }))
        });
        match parsed {
            Ok(Some(TestRow::Complete(date, record))) => {
                legacy.insert(date, record);
            }
            Ok(Some(TestRow::Cumulative(date, positive, negative))) => {
                cumulative.insert(date, (positive, negative));
            }
            Ok(None) => {}
            Err(message) => issues.push(RowIssue { line, message }),
        }
    }
    csv_util::check_parsed(&file, rows, &issues)?;

    match schema {
        TestSchema::Legacy => Ok(legacy),
        TestSchema::Current => Ok(daily_tests(&cumulative)),
    }
}

enum TestRow {
    Complete(NaiveDate, TestRecord),
    Cumulative(NaiveDate, Option<i64>, Option<i64>),
}

/// Daily figures from consecutive cumulative rows. A row is dropped when its
/// own or the prior row's totals are missing; the first row has no prior.
pub fn daily_tests(cumulative: &DateSeries<(Option<i64>, Option<i64>)>) -> DateSeries<TestRecord> {
    let rows: Vec<(&NaiveDate, &(Option<i64>, Option<i64>))> = cumulative.iter().collect();
    rows.windows(2)
        .filter_map(|pair| {
            let (_, (prev_positive, prev_negative)) = pair[0];
            let (date, (positive, negative)) = pair[1];
            let daily_positive = positive.zip(*prev_positive).map(|(now, prev)| now - prev)?;
            let daily_negative = negative.zip(*prev_negative).map(|(now, prev)| now - prev)?;
            Some((
                *date,
                TestRecord {
                    total_positive: *positive,
                    total_negative: *negative,
                    daily_positive: Some(daily_positive),
                    daily_negative: Some(daily_negative),
                    positive_rate: TestRecord::positivity(Some(daily_positive), Some(daily_negative)),
                },
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use assert_matches::assert_matches;
    use tempfile::TempDir;

    use super::*;

    const POPULATIONS: &str = "Name,Population\nA,100000\nB,50000\nC,50000\nGrand Total,200000\n";

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn fixture(files: &[(&str, &str)]) -> (TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        for (name, content) in files {
            fs::write(dir.join(name), content).unwrap();
        }
        (temp, dir)
    }

    fn boards() -> EntityIndex {
        EntityIndex::new(&["A".to_string(), "B".to_string(), "C".to_string()])
    }

    #[test]
    fn populations_define_scale_and_grand_total() {
        let (_temp, dir) = fixture(&[(POPULATIONS_FILE, POPULATIONS)]);
        let populations = load_populations(&dir.join(POPULATIONS_FILE), 100_000).unwrap();
        assert_eq!(populations.health_boards, vec!["A", "B", "C"]);
        assert_eq!(populations.scale["B"].value(), 0.5);
        assert_eq!(populations.scale[GRAND_TOTAL].value(), 2.0);
    }

    #[test]
    fn cases_are_scaled_and_sentinels_stay_absent() {
        let (_temp, dir) = fixture(&[
            (POPULATIONS_FILE, POPULATIONS),
            (CASES_FILE, "Date,A,B,C\n2020-03-01,10,5,X\n"),
        ]);
        let data = RegionalLoader::new(dir, 100_000, TableSchemaHint::Auto)
            .load()
            .unwrap();
        let record = data.cases.get(date(2020, 3, 1)).unwrap();
        assert_eq!(record.get("A"), Some(10.0));
        assert_eq!(record.get("B"), Some(10.0));
        assert_eq!(record.get("C"), None);
        assert_eq!(record.grand_total, Some(20.0));
    }

    #[test]
    fn current_rows_win_and_total_is_recomputed() {
        let (_temp, dir) = fixture(&[
            (
                OLD_CASES_FILE,
                "Date,A,B,C,Grand Total\n2020-03-01,1,1,1,999\n2020-03-02,2,2,2,999\n",
            ),
            (
                CASES_FILE,
                "Date,A,B,C,Grand Total\n2020-03-02,20,10,X,999\n2020-03-03,NA,NA,NA,999\n",
            ),
        ]);
        let scale = |_: &str, raw: f64| Some(raw);
        let index = boards();
        let seed =
            read_entity_table(&dir.join(OLD_CASES_FILE), &index, TableSchemaHint::Auto, &scale)
                .unwrap();
        let current =
            read_entity_table(&dir.join(CASES_FILE), &index, TableSchemaHint::Auto, &scale).unwrap();
        let merged = merge_entity_series(Some(seed), current);

        assert_eq!(merged.get(date(2020, 3, 1)).unwrap().grand_total, Some(3.0));
        let overlapping = merged.get(date(2020, 3, 2)).unwrap();
        assert_eq!(overlapping.get("A"), Some(20.0));
        assert_eq!(overlapping.grand_total, Some(30.0));
        assert!(!merged.contains(date(2020, 3, 3)));
    }

    #[test]
    fn aggregate_only_rows_keep_their_total() {
        let (_temp, dir) = fixture(&[(OLD_INTENSIVE_CARE_FILE, "Date,ICU\n2020-03-10,7\n")]);
        let count = |_: &str, raw: f64| Some(raw as i64);
        let seed = read_aggregate_table(&dir.join(OLD_INTENSIVE_CARE_FILE), &boards(), &count).unwrap();
        let merged = merge_entity_series(Some(seed), DateSeries::new());
        assert_eq!(merged.get(date(2020, 3, 10)).unwrap().grand_total, Some(7));
    }

    #[test]
    fn intensive_care_archive_is_read_by_position() {
        let (_temp, dir) = fixture(&[
            (POPULATIONS_FILE, POPULATIONS),
            (CASES_FILE, "Date,A,B,C\n2020-03-10,1,1,1\n"),
            (OLD_INTENSIVE_CARE_FILE, "Date,ICU\n2020-03-10,7\n"),
            (INTENSIVE_CARE_FILE, "Date,A,B,C\n2020-03-11,1,2,3\n"),
        ]);
        let data = RegionalLoader::new(dir, 100_000, TableSchemaHint::Auto)
            .load()
            .unwrap();
        assert!(!data.failures.iter().any(|failure| failure.starts_with("intensive care")));
        assert_eq!(data.intensive_care.len(), 2);
        assert_eq!(data.intensive_care.get(date(2020, 3, 10)), Some(&7));
        assert_eq!(data.intensive_care.get(date(2020, 3, 11)), Some(&6));
        assert_eq!(data.intensive_cares.get(date(2020, 3, 11)).unwrap().get("B"), Some(2));
    }

    #[test]
    fn test_schema_ignores_trailing_blank_columns() {
        let legacy = StringRecord::from(vec!["Date", "a", "b", "c", "d", "e", "", ""]);
        assert_eq!(detect_test_schema(&legacy, "t.csv").unwrap(), TestSchema::Legacy);
        let current = StringRecord::from(vec!["Date", "a", "b", "c", "d", "e", "f", "g"]);
        assert_eq!(detect_test_schema(&current, "t.csv").unwrap(), TestSchema::Current);
        let odd = StringRecord::from(vec!["Date", "a", "b"]);
        assert_matches!(
            detect_test_schema(&odd, "t.csv").unwrap_err(),
            DataError::SchemaAmbiguity { .. }
        );
    }

    #[test]
    fn entity_names_are_normalised() {
        let index = EntityIndex::new(&["Ayrshire and Arran".to_string()]);
        assert_eq!(
            index.resolve("NHS Ayrshire & Arran").map(String::as_str),
            Some("Ayrshire and Arran")
        );
        assert_eq!(index.resolve("ayrshire  and arran ").map(String::as_str), Some("Ayrshire and Arran"));
    }

    #[test]
    fn layout_detection() {
        let index = boards();
        let named = StringRecord::from(vec!["Date", "C", "A", "B", "Scotland"]);
        let layout = detect_layout(&named, &index, TableSchemaHint::Auto, "f.csv").unwrap();
        assert_eq!(layout.schema, TableSchema::Named);
        assert_eq!(layout.entities[0], (1, "C".to_string()));
        assert_eq!(layout.total, Some(4));

        let positional = StringRecord::from(vec!["Date", "x", "y", "z", "sum"]);
        let layout = detect_layout(&positional, &index, TableSchemaHint::Auto, "f.csv").unwrap();
        assert_eq!(layout.schema, TableSchema::Positional);
        assert_eq!(layout.total, Some(4));

        let unknown = StringRecord::from(vec!["Date", "A", "Z"]);
        let err = detect_layout(&unknown, &index, TableSchemaHint::Auto, "f.csv").unwrap_err();
        assert_matches!(err, DataError::UnknownEntity { entity, .. } if entity == "Z");

        let drifted = StringRecord::from(vec!["Day", "A", "B", "C"]);
        let err = detect_layout(&drifted, &index, TableSchemaHint::Auto, "f.csv").unwrap_err();
        assert_matches!(err, DataError::SchemaAmbiguity { .. });

        let forced = StringRecord::from(vec!["Date", "A", "B", "C"]);
        let layout = detect_layout(&forced, &index, TableSchemaHint::Positional, "f.csv").unwrap();
        assert_eq!(layout.schema, TableSchema::Positional);
        assert_eq!(layout.total, None);
    }

    #[test]
    fn unknown_entity_fails_only_that_table() {
        let (_temp, dir) = fixture(&[
            (POPULATIONS_FILE, POPULATIONS),
            (CASES_FILE, "Date,A,Z\n2020-03-01,1,2\n"),
            (DECEASED_FILE, "Date,Deceased\n2020-03-01,4\n"),
        ]);
        let data = RegionalLoader::new(dir, 100_000, TableSchemaHint::Auto)
            .load()
            .unwrap();
        assert!(data.cases.is_empty());
        assert!(data.failures.iter().any(|failure| failure.starts_with("cases")));
        assert_eq!(data.deceased.get(date(2020, 3, 1)), Some(&4));
    }

    #[test]
    fn bad_dates_are_skipped_but_all_bad_is_fatal() {
        let (_temp, dir) = fixture(&[
            ("some.csv", "Date,A,B,C\nnot a date,1,1,1\n2020-03-01,1,1,1\n"),
            ("none.csv", "Date,A,B,C\nnot a date,1,1,1\n2020-03-01,one,1,1\n"),
        ]);
        let scale = |_: &str, raw: f64| Some(raw);
        let series =
            read_entity_table(&dir.join("some.csv"), &boards(), TableSchemaHint::Auto, &scale)
                .unwrap();
        assert_eq!(series.len(), 1);

        let err = read_entity_table(&dir.join("none.csv"), &boards(), TableSchemaHint::Auto, &scale)
            .unwrap_err();
        assert_matches!(err, DataError::Unparseable { .. });
    }

    #[test]
    fn current_tests_derive_daily_figures() {
        let (_temp, dir) = fixture(&[(
            TESTS_FILE,
            "Date,Total Negative,Total Positive,Total,NHS Daily,NHS Cumulative,Regional Daily,Regional Cumulative\n\
             2020-03-01,100,10,110,,,,\n\
             2020-03-02,110,15,125,,,,\n\
             2020-03-03,120,15,135,,,,\n\
             2020-03-04,NA,22,,,,,\n",
        )]);
        let tests = read_tests(&dir.join(TESTS_FILE)).unwrap();
        assert!(!tests.contains(date(2020, 3, 1)));
        let second = tests.get(date(2020, 3, 2)).unwrap();
        assert_eq!(second.daily_positive, Some(5));
        assert_eq!(second.daily_negative, Some(10));
        assert_eq!(second.positive_rate, Some(5.0 / 15.0));
        assert_eq!(tests.get(date(2020, 3, 3)).unwrap().daily_positive, Some(0));
        assert!(!tests.contains(date(2020, 3, 4)));
    }

    #[test]
    fn legacy_tests_are_taken_as_published() {
        let (_temp, dir) = fixture(&[(
            OLD_TESTS_FILE,
            "Date,Conducted,Today Positive,Today Negative,Total Positive,Total Negative\n\
             2020-03-01,40,1,3,10,30\n",
        )]);
        let tests = read_tests(&dir.join(OLD_TESTS_FILE)).unwrap();
        let record = tests.get(date(2020, 3, 1)).unwrap();
        assert_eq!(record.total_negative, Some(30));
        assert_eq!(record.positive_rate, Some(0.25));
    }

    #[test]
    fn unexpected_test_columns_are_schema_drift() {
        let (_temp, dir) = fixture(&[(TESTS_FILE, "Date,a,b,c,d,e,f\n2020-03-01,1,2,3,4,5,6\n")]);
        let err = read_tests(&dir.join(TESTS_FILE)).unwrap_err();
        assert_matches!(err, DataError::SchemaAmbiguity { .. });
    }
}
