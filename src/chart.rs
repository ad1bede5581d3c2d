//! Chart descriptions for the external plotter.
//!
//! Each [`ChartSpec`] carries the data and how it should be read (log or
//! linear scale, clamped range, reference line, line or filled area); drawing
//! is left to the plotter.

use camino::Utf8PathBuf;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info};

use crate::domain::{GRAND_TOTAL, Measure, MobilityCategory, Nation, UK_KEY};
use crate::error::DataError;
use crate::export::file_stem;
use crate::metrics::{self, ROLLING_WINDOW, Table};
use crate::mobility::MobilityData;
use crate::national::NationalData;
use crate::regional::RegionalData;
use crate::state::Datasets;
use crate::store::Store;

pub const CHARTS_FILE: &str = "charts.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum YScale {
    Linear,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesStyle {
    Line,
    FilledArea,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ValueRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartPoint {
    pub date: NaiveDate,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartSeries {
    pub name: String,
    pub style: SeriesStyle,
    /// Drawn against a second, linear y axis.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub secondary_axis: bool,
    pub points: Vec<ChartPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartSpec {
    pub file_stem: String,
    pub title: String,
    pub y_label: Option<String>,
    pub y_scale: YScale,
    pub y_range: Option<ValueRange>,
    pub reference_line: Option<f64>,
    pub series: Vec<ChartSeries>,
}

impl ChartSpec {
    fn new(file_stem: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            file_stem: file_stem.into(),
            title: title.into(),
            y_label: None,
            y_scale: YScale::Linear,
            y_range: Some(ValueRange {
                min: Some(0.0),
                max: None,
            }),
            reference_line: None,
            series: Vec::new(),
        }
    }

    fn log(mut self) -> Self {
        self.y_scale = YScale::Log;
        self
    }

    fn unclamped(mut self) -> Self {
        self.y_range = None;
        self
    }

    fn reference(mut self, value: f64) -> Self {
        self.reference_line = Some(value);
        self
    }

    fn label(mut self, label: impl Into<String>) -> Self {
        self.y_label = Some(label.into());
        self
    }

    /// Adds one series per named column of `table`, skipping unknown names.
    fn columns(mut self, table: &Table, names: &[&str], style: SeriesStyle) -> Self {
        for name in names {
            if let Some(points) = table.column(name) {
                self.series.push(series(name, style, points));
            }
        }
        self
    }
}

fn series(name: &str, style: SeriesStyle, points: Vec<(NaiveDate, Option<f64>)>) -> ChartSeries {
    ChartSeries {
        name: name.to_string(),
        style,
        secondary_axis: false,
        points: points
            .into_iter()
            .map(|(date, value)| ChartPoint { date, value })
            .collect(),
    }
}

/// `100000` -> `100,000`.
pub fn group_thousands(value: u32) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

pub struct ChartBuilder {
    numbers_per: u32,
    mobility_regions: Vec<String>,
}

impl ChartBuilder {
    pub fn new(numbers_per: u32, mobility_regions: Vec<String>) -> Self {
        Self {
            numbers_per,
            mobility_regions,
        }
    }

    pub fn build(&self, datasets: &Datasets) -> Vec<ChartSpec> {
        let mut charts = Vec::new();
        if let Some(regional) = &datasets.regional {
            info!("Building Scottish charts.");
            charts.extend(self.scotland(regional));
            charts.extend(self.health_boards(regional));
        }
        if let Some(national) = &datasets.national {
            info!("Building UK charts.");
            charts.extend(self.uk(national));
        }
        if let Some(mobility) = &datasets.mobility {
            info!("Building mobility charts.");
            charts.extend(self.mobility(mobility));
        }
        charts
    }

    /// Writes every chart to `charts.json` under the public root.
    pub fn write(&self, store: &Store, datasets: &Datasets) -> Result<Utf8PathBuf, DataError> {
        store.ensure_public_root()?;
        let charts = self.build(datasets);
        let content = serde_json::to_vec_pretty(&charts)
            .map_err(|err| DataError::Filesystem(err.to_string()))?;
        let path = store.public_path(CHARTS_FILE);
        Store::write_bytes_atomic(&path, &content)?;
        Ok(path)
    }

    fn per(&self) -> String {
        format!("per {}", group_thousands(self.numbers_per))
    }

    fn scotland(&self, regional: &RegionalData) -> Vec<ChartSpec> {
        let n = self.numbers_per;
        let per = self.per();
        let boards: Vec<&str> = regional.health_boards.iter().map(String::as_str).collect();
        let tests = metrics::tests_table(regional);
        let cases = metrics::health_board_table(regional, Measure::Cases);
        let deaths = metrics::health_board_table(regional, Measure::Deaths);
        let smoothed = metrics::smoothed_daily_table(&cases.select(&boards), ROLLING_WINDOW);
        let icu = metrics::intensive_care_table(regional);
        let icu_units: Vec<&str> = icu
            .headers
            .iter()
            .skip(1)
            .map(String::as_str)
            .filter(|name| *name != GRAND_TOTAL)
            .collect();
        let icu_deceased = metrics::icu_deceased_table(regional);

        vec![
            ChartSpec::new("scotland_daily_tests", "Scottish COVID-19 Daily Tests").columns(
                &tests,
                &["Positive", "Negative"],
                SeriesStyle::FilledArea,
            ),
            ChartSpec::new("scotland_cumulative_tests", "Scottish COVID-19 Cumulative Tests")
                .columns(
                    &tests,
                    &["Cumulative Positive", "Cumulative Negative"],
                    SeriesStyle::FilledArea,
                ),
            ChartSpec::new(
                format!("scotland_total_cases_per_{n}"),
                format!("Scottish Health Board Total COVID-19 Cases ({per})"),
            )
            .log()
            .columns(&cases, &boards, SeriesStyle::Line),
            ChartSpec::new(
                format!("scotland_daily_cases_per_{n}_averaged_{ROLLING_WINDOW}_days"),
                format!(
                    "Scottish Health Board Daily COVID-19 Cases ({per}, {ROLLING_WINDOW} day rolling average)"
                ),
            )
            .columns(&smoothed, &boards, SeriesStyle::Line),
            ChartSpec::new(
                format!("scotland_total_deaths_per_{n}"),
                format!("Scottish Health Board Total COVID-19 Deaths ({per})"),
            )
            .log()
            .columns(&deaths, &boards, SeriesStyle::Line),
            ChartSpec::new("scotland_icus", "Scottish Health Board COVID-19 ICU Beds").columns(
                &icu,
                &icu_units,
                SeriesStyle::Line,
            ),
            ChartSpec::new(
                "scotland_icu_deceased",
                "Scottish COVID-19 Cumulative Deceased and Intensive Care Use",
            )
            .log()
            .columns(
                &icu_deceased,
                &["Patients in intensive care", "Cumulative deceased"],
                SeriesStyle::Line,
            ),
        ]
    }

    fn health_boards(&self, regional: &RegionalData) -> Vec<ChartSpec> {
        let n = self.numbers_per;
        let per = self.per();
        let mut charts = Vec::new();
        for board in &regional.health_boards {
            let Ok(summary) = metrics::health_board_summary(regional, board) else {
                continue;
            };
            let totals = summary.select(&["Cases", "Deaths"]);
            if !totals.has_nonzero() {
                debug!("{board} has no cases.");
                continue;
            }
            let stem = file_stem(board);

            let cumulative = summary.column("Cases").unwrap_or_default();
            let values: Vec<Option<f64>> = cumulative.iter().map(|(_, value)| *value).collect();
            let daily = cumulative
                .iter()
                .map(|(date, _)| *date)
                .zip(metrics::day_over_day(&values))
                .skip(1)
                .collect();
            let mut daily = series("Daily Cases", SeriesStyle::Line, daily);
            daily.secondary_axis = true;

            let mut chart = ChartSpec::new(
                format!("{stem}_per_{n}"),
                format!("COVID-19 in {board} ({per})"),
            )
            .log()
            .label("Total");
            chart.series.push(daily);
            if let Some(points) = summary.column("Cases") {
                chart.series.push(series("Total Cases", SeriesStyle::Line, points));
            }
            if let Some(points) = summary.column("Deaths") {
                chart.series.push(series("Total Deaths", SeriesStyle::Line, points));
            }
            charts.push(chart);

            charts.push(
                ChartSpec::new(
                    format!("{stem}_vs_scotland"),
                    format!("COVID-19 in {board} vs Scotland"),
                )
                .label(format!("{board} {per} ÷ Scotland {per}"))
                .reference(1.0)
                .columns(&ratios(&summary), &["Cases", "Deaths"], SeriesStyle::Line),
            );
        }
        charts
    }

    fn uk(&self, national: &NationalData) -> Vec<ChartSpec> {
        let n = self.numbers_per;
        let per = self.per();
        let names: Vec<&str> = Nation::CONSTITUENTS.iter().map(|nation| nation.name()).collect();
        let daily_columns: Vec<String> = names.iter().map(|name| format!("{name} Daily")).collect();
        let daily_names: Vec<&str> = daily_columns.iter().map(String::as_str).collect();

        let mut charts = Vec::new();
        for measure in Measure::ALL {
            let key = measure.as_str();
            let title = measure.title();
            let table = metrics::uk_table(national, measure);
            let daily = rename_columns(&table.select(&daily_names), &names);
            let smoothed = metrics::smoothed_daily_table(&table.select(&names), ROLLING_WINDOW);

            charts.push(
                ChartSpec::new(
                    format!("uk_total_{key}_per_{n}"),
                    format!("UK COVID-19 Total {title} ({per})"),
                )
                .log()
                .columns(&table, &names, SeriesStyle::Line),
            );
            charts.push(
                ChartSpec::new(
                    format!("uk_daily_{key}_per_{n}"),
                    format!("UK COVID-19 Daily {title} ({per})"),
                )
                .columns(&daily, &names, SeriesStyle::Line),
            );
            charts.push(
                ChartSpec::new(
                    format!("uk_daily_{key}_per_{n}_averaged_{ROLLING_WINDOW}_days"),
                    format!("UK COVID-19 Daily {title} ({per}, {ROLLING_WINDOW} day rolling average)"),
                )
                .columns(&smoothed, &names, SeriesStyle::Line),
            );
        }

        for nation in Nation::CONSTITUENTS {
            match metrics::nation_comparison(national, nation) {
                Ok(table) => charts.push(
                    ChartSpec::new(
                        format!("{}_vs_uk", file_stem(nation.name())),
                        format!("COVID-19 in {nation} vs the UK"),
                    )
                    .label(format!("{nation} {per} ÷ UK {per}"))
                    .reference(1.0)
                    .columns(&ratios(&table), &["Cases", "Deaths"], SeriesStyle::Line),
                ),
                Err(err) => debug!("No comparison chart for {nation}: {err}"),
            }
        }
        charts
    }

    fn mobility(&self, mobility: &MobilityData) -> Vec<ChartSpec> {
        let titles: Vec<&str> = MobilityCategory::ALL
            .iter()
            .map(|category| category.title())
            .collect();
        let mut charts = Vec::new();
        for region in mobility.keys() {
            if let Some(table) = metrics::mobility_table(mobility, region) {
                charts.push(
                    ChartSpec::new(
                        format!("mobility_{}", file_stem(region)),
                        format!("Mobility in {region}"),
                    )
                    .unclamped()
                    .reference(0.0)
                    .label("Usage compared to pre pandemic levels (%)")
                    .columns(&table, &titles, SeriesStyle::Line),
                );
            }
        }
        for region in &self.mobility_regions {
            if region == UK_KEY {
                continue;
            }
            if let Some(table) = metrics::mobility_comparison(mobility, region) {
                charts.push(
                    ChartSpec::new(
                        format!("mobility_{}_vs_uk", file_stem(region)),
                        format!("Mobility in {region} vs the UK"),
                    )
                    .unclamped()
                    .reference(0.0)
                    .columns(&table, &titles, SeriesStyle::Line),
                );
            }
        }
        charts
    }
}

/// The ratio columns of a comparison table, renamed to their measure.
fn ratios(table: &Table) -> Table {
    rename_columns(&table.select(&["Cases Ratio", "Deaths Ratio"]), &["Cases", "Deaths"])
}

fn rename_columns(table: &Table, names: &[&str]) -> Table {
    let mut renamed = table.clone();
    for (header, name) in renamed.headers.iter_mut().skip(1).zip(names) {
        *header = name.to_string();
    }
    renamed
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::domain::{DateSeries, EntityValues, ScaleFactor};

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 3, d).unwrap()
    }

    fn regional() -> RegionalData {
        let boards = vec!["Fife".to_string(), "Orkney".to_string()];
        let mut cases = DateSeries::new();
        let mut deaths = DateSeries::new();
        for d in 1..=3 {
            let mut values = BTreeMap::new();
            values.insert("Fife".to_string(), Some(d as f64 * 10.0));
            values.insert("Orkney".to_string(), Some(0.0));
            cases.insert(date(d), EntityValues::new(values.clone()));
            deaths.insert(date(d), EntityValues::new(values));
        }
        let mut scale = BTreeMap::new();
        scale.insert("Fife".to_string(), ScaleFactor::from_population(100_000.0, 100_000));
        RegionalData {
            health_boards: boards,
            scale,
            cases,
            deaths,
            ..RegionalData::default()
        }
    }

    #[test]
    fn thousands_are_grouped() {
        assert_eq!(group_thousands(100_000), "100,000");
        assert_eq!(group_thousands(1_000_000), "1,000,000");
        assert_eq!(group_thousands(999), "999");
    }

    #[test]
    fn boards_without_cases_get_no_chart() {
        let datasets = Datasets {
            regional: Some(regional()),
            ..Datasets::default()
        };
        let charts = ChartBuilder::new(100_000, vec![]).build(&datasets);
        let stems: Vec<&str> = charts.iter().map(|chart| chart.file_stem.as_str()).collect();
        assert!(stems.contains(&"fife_per_100000"));
        assert!(stems.contains(&"fife_vs_scotland"));
        assert!(!stems.contains(&"orkney_per_100000"));
    }

    #[test]
    fn board_chart_carries_daily_cases_on_second_axis() {
        let datasets = Datasets {
            regional: Some(regional()),
            ..Datasets::default()
        };
        let charts = ChartBuilder::new(100_000, vec![]).build(&datasets);
        let fife = charts
            .iter()
            .find(|chart| chart.file_stem == "fife_per_100000")
            .unwrap();
        assert_eq!(fife.y_scale, YScale::Log);
        assert_eq!(fife.title, "COVID-19 in Fife (per 100,000)");
        let daily = &fife.series[0];
        assert!(daily.secondary_axis);
        assert_eq!(daily.points.len(), 2);
        assert_eq!(daily.points[0].value, Some(10.0));
    }

    #[test]
    fn comparison_charts_use_ratio_columns() {
        let datasets = Datasets {
            regional: Some(regional()),
            ..Datasets::default()
        };
        let charts = ChartBuilder::new(100_000, vec![]).build(&datasets);
        let versus = charts
            .iter()
            .find(|chart| chart.file_stem == "fife_vs_scotland")
            .unwrap();
        assert_eq!(versus.reference_line, Some(1.0));
        let names: Vec<&str> = versus.series.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["Cases", "Deaths"]);
        assert_eq!(versus.series[0].points[0].value, Some(1.0));
    }

    #[test]
    fn missing_datasets_produce_no_charts() {
        assert!(ChartBuilder::new(100_000, vec![]).build(&Datasets::default()).is_empty());
    }
}
