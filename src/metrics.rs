//! Derived metrics over the loaded datasets.
//!
//! Nothing here performs I/O. Every function reads the in-memory datasets and
//! returns display-ready tables whose missing values stay `None`.

use chrono::NaiveDate;
use serde::Serialize;

use crate::domain::{
    DateSeries, DateWindow, EntityName, EntityValues, GOLDEN_JUBILEE, GRAND_TOTAL, Measure,
    MobilityCategory, Nation, NationTotals, UK_KEY,
};
use crate::error::DataError;
use crate::mobility::MobilityData;
use crate::national::NationalData;
use crate::regional::{POPULATIONS_FILE, RegionalData};

pub const ROLLING_WINDOW: usize = 7;
pub const DATE_HEADER: &str = "Date";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableRow {
    pub date: NaiveDate,
    pub values: Vec<Option<f64>>,
}

/// Rows in ascending date order; `headers[0]` is the date column and each
/// row holds one value per remaining header.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<TableRow>,
}

impl Table {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    fn with_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let headers = std::iter::once(DATE_HEADER.to_string())
            .chain(columns.into_iter().map(Into::into))
            .collect();
        Self::new(headers)
    }

    pub fn push(&mut self, date: NaiveDate, values: Vec<Option<f64>>) {
        self.rows.push(TableRow { date, values });
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.rows.last().map(|row| row.date)
    }

    /// Position of `name` within each row's values.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .skip(1)
            .position(|header| header == name)
    }

    pub fn column(&self, name: &str) -> Option<Vec<(NaiveDate, Option<f64>)>> {
        let idx = self.column_index(name)?;
        Some(
            self.rows
                .iter()
                .map(|row| (row.date, row.values.get(idx).copied().flatten()))
                .collect(),
        )
    }

    /// A table holding only the named columns, in the order given. Unknown
    /// names are dropped.
    pub fn select(&self, names: &[&str]) -> Table {
        let indices: Vec<usize> = names
            .iter()
            .filter_map(|name| self.column_index(name))
            .collect();
        let mut selected = Table::with_columns(indices.iter().map(|idx| self.headers[idx + 1].clone()));
        for row in &self.rows {
            let values = indices
                .iter()
                .map(|idx| row.values.get(*idx).copied().flatten())
                .collect();
            selected.push(row.date, values);
        }
        selected
    }

    /// True when some column holds a non-zero value.
    pub fn has_nonzero(&self) -> bool {
        self.rows
            .iter()
            .flat_map(|row| row.values.iter().flatten())
            .any(|value| *value != 0.0)
    }
}

/// `value / aggregate`; `None` when either is missing or the aggregate is 0.
pub fn ratio(value: Option<f64>, aggregate: Option<f64>) -> Option<f64> {
    let (value, aggregate) = (value?, aggregate?);
    (aggregate != 0.0).then(|| value / aggregate)
}

pub fn entity_vs_aggregate(
    series: &DateSeries<EntityValues<f64>>,
    entity: &str,
) -> DateSeries<Option<f64>> {
    series.map(|record| ratio(record.get(entity), record.grand_total))
}

/// Mean of each full trailing window; the leading `window - 1` points have
/// no output and a window with a missing value averages to `None`.
///
/// Windows count values, not calendar days: a gap in the dates makes a
/// window span more than `window` days.
pub fn rolling_average(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    if window == 0 {
        return Vec::new();
    }
    values
        .windows(window)
        .map(|slice| {
            let sum: Option<f64> = slice.iter().copied().sum();
            sum.map(|sum| sum / window as f64)
        })
        .collect()
}

/// `output[i] = input[i] - input[i - 1]`; the first element has no delta.
pub fn day_over_day(values: &[Option<f64>]) -> Vec<Option<f64>> {
    if values.is_empty() {
        return Vec::new();
    }
    std::iter::once(None)
        .chain(
            values
                .windows(2)
                .map(|pair| pair[1].zip(pair[0]).map(|(now, before)| now - before)),
        )
        .collect()
}

pub fn rolling_series(series: &DateSeries<Option<f64>>, window: usize) -> DateSeries<Option<f64>> {
    let (dates, values): (Vec<NaiveDate>, Vec<Option<f64>>) =
        series.iter().map(|(date, value)| (*date, *value)).unzip();
    let averages = rolling_average(&values, window);
    dates
        .into_iter()
        .skip(window.saturating_sub(1))
        .zip(averages)
        .collect()
}

pub fn delta_series(series: &DateSeries<Option<f64>>) -> DateSeries<Option<f64>> {
    let (dates, values): (Vec<NaiveDate>, Vec<Option<f64>>) =
        series.iter().map(|(date, value)| (*date, *value)).unzip();
    dates.into_iter().zip(day_over_day(&values)).collect()
}

fn entity_table(series: &DateSeries<EntityValues<f64>>, entities: &[EntityName]) -> Table {
    let mut table = Table::with_columns(entities.iter().cloned().chain([GRAND_TOTAL.to_string()]));
    for (date, record) in series {
        let values = entities
            .iter()
            .map(|entity| record.get(entity))
            .chain([record.grand_total])
            .collect();
        table.push(*date, values);
    }
    table
}

/// `Date, <health boards...>, Grand Total` per capita.
pub fn health_board_table(regional: &RegionalData, measure: Measure) -> Table {
    let series = match measure {
        Measure::Cases => &regional.cases,
        Measure::Deaths => &regional.deaths,
    };
    entity_table(series, &regional.health_boards)
}

pub fn intensive_care_table(regional: &RegionalData) -> Table {
    let mut units = regional.health_boards.clone();
    units.push(GOLDEN_JUBILEE.to_string());
    let series = regional.intensive_cares.map(|record| {
        EntityValues {
            values: record
                .values
                .iter()
                .map(|(name, value)| (name.clone(), value.map(|value| value as f64)))
                .collect(),
            grand_total: record.grand_total.map(|total| total as f64),
        }
    });
    entity_table(&series, &units)
}

/// Patients in intensive care beside cumulative deceased, every day from the
/// first date of either series to the last date of either.
pub fn icu_deceased_table(regional: &RegionalData) -> Table {
    let mut table = Table::with_columns(["Patients in intensive care", "Cumulative deceased"]);
    let window = DateWindow::union([regional.intensive_care.window(), regional.deceased.window()]);
    for date in window.into_iter().flat_map(DateWindow::days) {
        table.push(
            date,
            vec![
                regional.intensive_care.get(date).map(|value| *value as f64),
                regional.deceased.get(date).map(|value| *value as f64),
            ],
        );
    }
    table
}

pub fn tests_table(regional: &RegionalData) -> Table {
    let mut table = Table::with_columns([
        "Positive",
        "Negative",
        "Positive Rate",
        "Cumulative Positive",
        "Cumulative Negative",
    ]);
    let count = |value: Option<i64>| value.map(|value| value as f64);
    for (date, record) in &regional.tests {
        table.push(
            *date,
            vec![
                count(record.daily_positive),
                count(record.daily_negative),
                record.positive_rate,
                count(record.total_positive),
                count(record.total_negative),
            ],
        );
    }
    table
}

/// One health board's cases and deaths with their share of the Grand Total,
/// over the union of the cases and deaths windows.
pub fn health_board_summary(regional: &RegionalData, name: &str) -> Result<Table, DataError> {
    if !regional.health_boards.iter().any(|board| board == name) {
        return Err(DataError::UnknownEntity {
            file: POPULATIONS_FILE.to_string(),
            entity: name.to_string(),
        });
    }
    let mut table = Table::with_columns(["Cases", "Deaths", "Cases Ratio", "Deaths Ratio"]);
    let window = DateWindow::union([regional.cases.window(), regional.deaths.window()]);
    for date in window.into_iter().flat_map(DateWindow::days) {
        let cases = regional.cases.get(date);
        let deaths = regional.deaths.get(date);
        let case_value = cases.and_then(|record| record.get(name));
        let death_value = deaths.and_then(|record| record.get(name));
        table.push(
            date,
            vec![
                case_value,
                death_value,
                ratio(case_value, cases.and_then(|record| record.grand_total)),
                ratio(death_value, deaths.and_then(|record| record.grand_total)),
            ],
        );
    }
    Ok(table)
}

/// A nation's daily figures and their ratio to the UK's, over the dates both
/// cover.
pub fn nation_comparison(national: &NationalData, nation: Nation) -> Result<Table, DataError> {
    if nation == Nation::Uk {
        return Err(DataError::UnknownNation(format!(
            "{nation} cannot be compared with itself"
        )));
    }
    let uk = national
        .nation(Nation::Uk)
        .ok_or_else(|| DataError::DatasetUnavailable("UK totals".to_string()))?;
    let country = national
        .nation(nation)
        .ok_or_else(|| DataError::DatasetUnavailable(format!("{nation} totals")))?;

    let mut table = Table::with_columns(["Cases", "Deaths", "Cases Ratio", "Deaths Ratio"]);
    let window = uk
        .window()
        .zip(country.window())
        .and_then(|(uk, country)| uk.intersection(country));
    for date in window.into_iter().flat_map(DateWindow::days) {
        let ours = country.get(date).copied().unwrap_or_default();
        let theirs = uk.get(date).copied().unwrap_or_default();
        table.push(
            date,
            vec![
                ours.daily_cases,
                ours.daily_deaths,
                ratio(ours.daily_cases, theirs.daily_cases),
                ratio(ours.daily_deaths, theirs.daily_deaths),
            ],
        );
    }
    Ok(table)
}

/// Cumulative then daily values for every nation and the UK, over the union
/// of their windows.
pub fn uk_table(national: &NationalData, measure: Measure) -> Table {
    let cumulative = Nation::ALL.iter().map(|nation| nation.name().to_string());
    let daily = Nation::ALL.iter().map(|nation| format!("{} Daily", nation.name()));
    let mut table = Table::with_columns(cumulative.chain(daily));

    let pick = |totals: &NationTotals| match measure {
        Measure::Cases => (totals.cumulative_cases, totals.daily_cases),
        Measure::Deaths => (totals.cumulative_deaths, totals.daily_deaths),
    };
    let window = DateWindow::union(
        Nation::ALL
            .iter()
            .map(|nation| national.nation(*nation).and_then(DateSeries::window)),
    );
    for date in window.into_iter().flat_map(DateWindow::days) {
        let figures: Vec<(Option<f64>, Option<f64>)> = Nation::ALL
            .iter()
            .map(|nation| {
                national
                    .nation(*nation)
                    .and_then(|series| series.get(date))
                    .map(pick)
                    .unwrap_or_default()
            })
            .collect();
        let values = figures
            .iter()
            .map(|(cumulative, _)| *cumulative)
            .chain(figures.iter().map(|(_, daily)| *daily))
            .collect();
        table.push(date, values);
    }
    table
}

/// Every column of a cumulative table turned into a `window`-row rolling
/// mean of its row-over-row changes. Dates missing from the table are not
/// filled in, so the window follows the published rows.
pub fn smoothed_daily_table(table: &Table, window: usize) -> Table {
    let mut smoothed = Table::new(table.headers.clone());
    if window == 0 || table.rows.len() < window {
        return smoothed;
    }
    let columns: Vec<Vec<Option<f64>>> = (0..table.headers.len().saturating_sub(1))
        .map(|idx| {
            let cumulative: Vec<Option<f64>> = table
                .rows
                .iter()
                .map(|row| row.values.get(idx).copied().flatten())
                .collect();
            rolling_average(&day_over_day(&cumulative), window)
        })
        .collect();
    for (offset, row) in table.rows.iter().skip(window - 1).enumerate() {
        let values = columns.iter().map(|column| column[offset]).collect();
        smoothed.push(row.date, values);
    }
    smoothed
}

fn category_table() -> Table {
    Table::with_columns(MobilityCategory::ALL.iter().map(|category| category.title()))
}

pub fn mobility_table(mobility: &MobilityData, region: &str) -> Option<Table> {
    let series = mobility.region(region)?;
    let mut table = category_table();
    for (date, vector) in series {
        table.push(*date, vector.0.to_vec());
    }
    Some(table)
}

/// Region minus UK, per category, on the dates both report.
pub fn mobility_comparison(mobility: &MobilityData, region: &str) -> Option<Table> {
    let series = mobility.region(region)?;
    let uk = mobility.region(UK_KEY)?;
    let mut table = category_table();
    for (date, vector) in series {
        if let Some(national) = uk.get(*date) {
            table.push(*date, vector.difference(national).0.to_vec());
        }
    }
    Some(table)
}
