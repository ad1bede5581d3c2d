use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::config::NationalLayout;
use crate::csv_util::{self, RowIssue};
use crate::domain::{DateSeries, Measure, Nation, NationTotals, ScaleFactor};
use crate::error::DataError;

pub const COMBINED_CASES_FILE: &str = "uk_nations_cases.csv";
pub const COMBINED_DEATHS_FILE: &str = "uk_nations_deaths.csv";

pub fn per_nation_file(nation: Nation) -> String {
    format!("covid-19-totals-{}.csv", nation.slug())
}

/// Scaled totals for the four nations and the UK.
#[derive(Debug, Clone, Default)]
pub struct NationalData {
    series: BTreeMap<Nation, DateSeries<NationTotals>>,
    /// Files that failed to load, with the reason.
    pub failures: Vec<String>,
}

impl NationalData {
    pub fn nation(&self, nation: Nation) -> Option<&DateSeries<NationTotals>> {
        self.series.get(&nation)
    }

    pub fn nations(&self) -> impl Iterator<Item = Nation> + '_ {
        self.series.keys().copied()
    }

    pub fn insert(&mut self, nation: Nation, series: DateSeries<NationTotals>) {
        self.series.insert(nation, series);
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.series.values().filter_map(DateSeries::last_date).max()
    }

    fn record_failure(&mut self, what: &str, err: DataError) {
        warn!("Skipping UK data ({what}): {err}");
        self.failures.push(format!("{what}: {err}"));
    }
}

/// Unscaled values as read; any field may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct RawTotals {
    new_cases: Option<f64>,
    cum_cases: Option<f64>,
    new_deaths: Option<f64>,
    cum_deaths: Option<f64>,
    tests: Option<f64>,
}

impl RawTotals {
    fn scaled(self, scale: ScaleFactor) -> NationTotals {
        let apply = |value: Option<f64>| value.and_then(|raw| scale.apply(raw));
        NationTotals {
            daily_cases: apply(self.new_cases),
            daily_deaths: apply(self.new_deaths),
            cumulative_cases: apply(self.cum_cases),
            cumulative_deaths: apply(self.cum_deaths),
            tests: apply(self.tests),
        }
    }

    fn merge(&mut self, other: RawTotals) {
        self.new_cases = other.new_cases.or(self.new_cases);
        self.cum_cases = other.cum_cases.or(self.cum_cases);
        self.new_deaths = other.new_deaths.or(self.new_deaths);
        self.cum_deaths = other.cum_deaths.or(self.cum_deaths);
        self.tests = other.tests.or(self.tests);
    }
}

pub struct NationalLoader {
    dir: Utf8PathBuf,
    numbers_per: u32,
    layout: NationalLayout,
}

impl NationalLoader {
    pub fn new(dir: impl Into<Utf8PathBuf>, numbers_per: u32, layout: NationalLayout) -> Self {
        Self {
            dir: dir.into(),
            numbers_per,
            layout,
        }
    }

    /// Fails only when no file at all could be read.
    pub fn load(&self) -> Result<NationalData, DataError> {
        let data = match self.layout {
            NationalLayout::PerNation => self.load_per_nation(),
            NationalLayout::Combined => self.load_combined(),
        };
        if data.series.is_empty() {
            return Err(DataError::DatasetUnavailable(format!(
                "uk ({})",
                data.failures.join("; ")
            )));
        }
        Ok(data)
    }

    fn load_per_nation(&self) -> NationalData {
        let mut data = NationalData::default();
        for nation in Nation::ALL {
            let file = per_nation_file(nation);
            info!("Reading UK data ({file}).");
            match read_nation_totals(&self.dir.join(&file)) {
                Ok(raw) => {
                    let scale = nation.scale(self.numbers_per);
                    let series: DateSeries<NationTotals> =
                        with_daily_deltas(raw).map(|totals| totals.scaled(scale));
                    debug!("Read UK data for {}.", series.coverage());
                    data.insert(nation, series);
                }
                Err(err) => data.record_failure(&file, err),
            }
        }
        data
    }

    fn load_combined(&self) -> NationalData {
        let mut data = NationalData::default();
        let mut raw: BTreeMap<Nation, DateSeries<RawTotals>> = BTreeMap::new();
        for (file, measure) in [
            (COMBINED_CASES_FILE, Measure::Cases),
            (COMBINED_DEATHS_FILE, Measure::Deaths),
        ] {
            info!("Reading UK data ({file}).");
            match read_combined(&self.dir.join(file), measure) {
                Ok(by_nation) => {
                    for (nation, series) in by_nation {
                        let target = raw.entry(nation).or_default();
                        for (date, totals) in series {
                            match target.get(date).copied() {
                                Some(mut existing) => {
                                    existing.merge(totals);
                                    target.insert(date, existing);
                                }
                                None => {
                                    target.insert(date, totals);
                                }
                            }
                        }
                    }
                }
                Err(err) => data.record_failure(file, err),
            }
        }
        if raw.is_empty() {
            return data;
        }

        raw.insert(Nation::Uk, sum_constituents(&raw));
        for (nation, series) in raw {
            let scale = nation.scale(self.numbers_per);
            let series = series.map(|totals| totals.scaled(scale));
            debug!("Read UK data for {nation}: {}.", series.coverage());
            data.insert(nation, series);
        }
        data
    }
}

/// `Date, Tests, ConfirmedCases, Deaths`, all cumulative.
fn read_nation_totals(path: &Utf8Path) -> Result<DateSeries<RawTotals>, DataError> {
    let file = csv_util::file_label(path);
    let mut reader = csv_util::open_reader(path, Some(b'"'))?;
    let headers = csv_util::read_headers(&mut reader, path)?;
    let header_map = csv_util::build_header_map(&headers);
    let Some(date_col) = csv_util::find_column(&header_map, &["date"], &[]) else {
        return Err(DataError::SchemaAmbiguity {
            file,
            header: csv_util::header_line(&headers),
        });
    };
    let tests_col = csv_util::find_column(&header_map, &["tests"], &[]);
    let cases_col = csv_util::find_column(&header_map, &["confirmedcases", "cases"], &[]);
    let deaths_col = csv_util::find_column(&header_map, &["deaths"], &[]);

    let mut series = DateSeries::new();
    let mut issues = Vec::new();
    let mut rows = 0;
    for (idx, result) in reader.records().enumerate() {
        let line = idx + 2;
        rows += 1;
        let parsed = result.map_err(|err| err.to_string()).and_then(|record| {
            let cell = |col: Option<usize>| match col {
                Some(col) => csv_util::parse_value(record.get(col).unwrap_or("")),
                None => Ok(None),
            };
            let Some(date) = csv_util::parse_date(record.get(date_col).unwrap_or(""))? else {
                return Ok(None);
            };
            Ok(Some((
                date,
                RawTotals {
                    tests: cell(tests_col)?,
                    cum_cases: cell(cases_col)?,
                    cum_deaths: cell(deaths_col)?,
                    ..RawTotals::default()
                },
            )))
        });
        match parsed {
            Ok(Some((date, totals))) => {
                series.insert(date, totals);
            }
            Ok(None) => {}
            Err(message) => issues.push(RowIssue { line, message }),
        }
    }
    csv_util::check_parsed(&file, rows, &issues)?;
    Ok(series)
}

/// Daily figures as the change from the prior row's cumulative figures.
fn with_daily_deltas(series: DateSeries<RawTotals>) -> DateSeries<RawTotals> {
    let mut previous: Option<RawTotals> = None;
    series
        .into_iter()
        .map(|(date, mut totals)| {
            if let Some(prev) = previous {
                let delta = |now: Option<f64>, before: Option<f64>| {
                    now.zip(before).map(|(now, before)| now - before)
                };
                totals.new_cases = totals.new_cases.or(delta(totals.cum_cases, prev.cum_cases));
                totals.new_deaths = totals.new_deaths.or(delta(totals.cum_deaths, prev.cum_deaths));
            }
            previous = Some(totals);
            (date, totals)
        })
        .collect()
}

/// A file keyed by (nation, date) with one `new*` and one `cum*` column.
/// Rows for areas other than the four nations are ignored.
fn read_combined(
    path: &Utf8Path,
    measure: Measure,
) -> Result<BTreeMap<Nation, DateSeries<RawTotals>>, DataError> {
    let file = csv_util::file_label(path);
    let mut reader = csv_util::open_reader(path, Some(b'"'))?;
    let headers = csv_util::read_headers(&mut reader, path)?;
    let header_map = csv_util::build_header_map(&headers);
    let columns = (
        csv_util::find_column(&header_map, &["date"], &[]),
        csv_util::find_column(&header_map, &["areaname", "nation"], &[]),
        csv_util::find_column(&header_map, &[], &["new"]),
        csv_util::find_column(&header_map, &[], &["cum"]),
    );
    let (Some(date_col), Some(area_col), new_col, cum_col) = columns else {
        return Err(DataError::SchemaAmbiguity {
            file,
            header: csv_util::header_line(&headers),
        });
    };
    if new_col.is_none() && cum_col.is_none() {
        return Err(DataError::SchemaAmbiguity {
            file,
            header: csv_util::header_line(&headers),
        });
    }

    let mut by_nation: BTreeMap<Nation, DateSeries<RawTotals>> = BTreeMap::new();
    let mut issues = Vec::new();
    let mut rows = 0;
    for (idx, result) in reader.records().enumerate() {
        let line = idx + 2;
        rows += 1;
        let parsed = result.map_err(|err| err.to_string()).and_then(|record| {
            let nation = match record.get(area_col).unwrap_or("").parse::<Nation>() {
                Ok(nation) if nation != Nation::Uk => nation,
                _ => return Ok(None),
            };
            let cell = |col: Option<usize>| match col {
                Some(col) => csv_util::parse_value(record.get(col).unwrap_or("")),
                None => Ok(None),
            };
            let Some(date) = csv_util::parse_date(record.get(date_col).unwrap_or(""))? else {
                return Ok(None);
            };
            let (new, cum) = (cell(new_col)?, cell(cum_col)?);
            let totals = match measure {
                Measure::Cases => RawTotals {
                    new_cases: new,
                    cum_cases: cum,
                    ..RawTotals::default()
                },
                Measure::Deaths => RawTotals {
                    new_deaths: new,
                    cum_deaths: cum,
                    ..RawTotals::default()
                },
            };
            Ok(Some((nation, date, totals)))
        });
        match parsed {
            Ok(Some((nation, date, totals))) => {
                by_nation.entry(nation).or_default().insert(date, totals);
            }
            Ok(None) => {}
            Err(message) => issues.push(RowIssue { line, message }),
        }
    }
    csv_util::check_parsed(&file, rows, &issues)?;
    Ok(by_nation)
}

/// Per date, each field summed over the nations that report it.
fn sum_constituents(raw: &BTreeMap<Nation, DateSeries<RawTotals>>) -> DateSeries<RawTotals> {
    let mut uk: DateSeries<RawTotals> = DateSeries::new();
    for nation in Nation::CONSTITUENTS {
        let Some(series) = raw.get(&nation) else {
            continue;
        };
        for (date, totals) in series {
            let mut sum = uk.get(*date).copied().unwrap_or_default();
            let add = |acc: Option<f64>, value: Option<f64>| match (acc, value) {
                (Some(acc), Some(value)) => Some(acc + value),
                (acc, value) => acc.or(value),
            };
            sum.new_cases = add(sum.new_cases, totals.new_cases);
            sum.cum_cases = add(sum.cum_cases, totals.cum_cases);
            sum.new_deaths = add(sum.new_deaths, totals.new_deaths);
            sum.cum_deaths = add(sum.cum_deaths, totals.cum_deaths);
            sum.tests = add(sum.tests, totals.tests);
            uk.insert(*date, sum);
        }
    }
    uk
}
