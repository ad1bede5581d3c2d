use std::collections::{BTreeMap, HashMap};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use tracing::{debug, info};

use crate::config::MobilitySettings;
use crate::csv_util::{self, RowIssue};
use crate::domain::{DateSeries, MobilityCategory, MobilityVector, UK_KEY};
use crate::error::DataError;

pub const DATA_FILE: &str = "Global_Mobility_Report.csv";

/// Daily mobility vectors keyed by `UK`, each configured region and each
/// contributing sub-region.
#[derive(Debug, Clone, Default)]
pub struct MobilityData {
    regions: BTreeMap<String, DateSeries<MobilityVector>>,
    /// When the file on disk was downloaded, if known.
    pub accessed_at: Option<String>,
}

impl MobilityData {
    pub fn from_regions(regions: BTreeMap<String, DateSeries<MobilityVector>>) -> Self {
        Self {
            regions,
            accessed_at: None,
        }
    }

    pub fn region(&self, key: &str) -> Option<&DateSeries<MobilityVector>> {
        self.regions.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.regions.keys().map(String::as_str)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.regions.get(UK_KEY).and_then(DateSeries::last_date)
    }
}

#[derive(Debug, Clone, Default)]
struct Accumulator {
    sums: [f64; 6],
    present: [usize; 6],
    rows: usize,
}

impl Accumulator {
    fn add(&mut self, values: &[Option<f64>; 6]) {
        self.rows += 1;
        for (idx, value) in values.iter().enumerate() {
            if let Some(value) = value {
                self.sums[idx] += value;
                self.present[idx] += 1;
            }
        }
    }

    /// Each component's sum over every row of the date, so a row missing a
    /// component still counts towards the divisor. A component no row
    /// reports stays absent.
    fn mean(&self) -> MobilityVector {
        let mut out = [None; 6];
        for (idx, slot) in out.iter_mut().enumerate() {
            if self.present[idx] > 0 {
                *slot = Some(self.sums[idx] / self.rows as f64);
            }
        }
        MobilityVector(out)
    }
}

struct Columns {
    country: usize,
    sub_region: usize,
    date: usize,
    categories: [usize; 6],
}

pub struct MobilityLoader {
    dir: Utf8PathBuf,
    settings: MobilitySettings,
}

impl MobilityLoader {
    pub fn new(dir: impl Into<Utf8PathBuf>, settings: MobilitySettings) -> Self {
        Self {
            dir: dir.into(),
            settings,
        }
    }

    pub fn load(&self) -> Result<MobilityData, DataError> {
        info!("Reading Google mobility data.");
        let data = read_mobility(&self.dir.join(DATA_FILE), &self.settings)?;
        debug!(
            "Read Google mobility data for {}.",
            data.region(UK_KEY)
                .map(DateSeries::coverage)
                .unwrap_or_else(|| "no dates".to_string())
        );
        Ok(data)
    }
}

pub fn read_mobility(path: &Utf8Path, settings: &MobilitySettings) -> Result<MobilityData, DataError> {
    let file = csv_util::file_label(path);
    let mut reader = csv_util::open_reader(path, Some(b'"'))?;
    let headers = csv_util::read_headers(&mut reader, path)?;
    let columns = locate_columns(&headers, &file)?;

    let member_of: HashMap<&str, &str> = settings
        .regions
        .iter()
        .flat_map(|(region, members)| {
            members
                .iter()
                .map(move |member| (member.as_str(), region.as_str()))
        })
        .collect();

    let mut groups: BTreeMap<String, BTreeMap<NaiveDate, Accumulator>> = BTreeMap::new();
    let mut issues = Vec::new();
    let mut rows = 0;
    for (idx, result) in reader.records().enumerate() {
        let line = idx + 2;
        let record = match result {
            Ok(record) => record,
            Err(err) => {
                rows += 1;
                issues.push(RowIssue {
                    line,
                    message: err.to_string(),
                });
                continue;
            }
        };
        if record.get(columns.country).map(str::trim) != Some(settings.country_code.as_str()) {
            continue;
        }
        let sub_region = record.get(columns.sub_region).unwrap_or("").trim();
        let keys: Vec<&str> = if sub_region.is_empty() {
            vec![UK_KEY]
        } else if let Some(region) = member_of.get(sub_region) {
            vec![*region, sub_region]
        } else {
            continue;
        };

        rows += 1;
        let parsed = (|| -> Result<Option<(NaiveDate, [Option<f64>; 6])>, String> {
            let Some(date) = csv_util::parse_date(record.get(columns.date).unwrap_or(""))? else {
                return Ok(None);
            };
            let mut values = [None; 6];
            for (slot, col) in values.iter_mut().zip(columns.categories) {
                *slot = csv_util::parse_value(record.get(col).unwrap_or(""))?;
            }
            Ok(Some((date, values)))
        })();
        match parsed {
            Ok(Some((date, values))) => {
                for key in keys {
                    groups
                        .entry(key.to_string())
                        .or_default()
                        .entry(date)
                        .or_default()
                        .add(&values);
                }
            }
            Ok(None) => {}
            Err(message) => issues.push(RowIssue { line, message }),
        }
    }
    csv_util::check_parsed(&file, rows, &issues)?;

    let regions = groups
        .into_iter()
        .map(|(key, dates)| {
            let series = dates
                .into_iter()
                .map(|(date, acc)| (date, acc.mean()))
                .collect();
            (key, series)
        })
        .collect();
    Ok(MobilityData {
        regions,
        accessed_at: None,
    })
}

fn locate_columns(headers: &csv::StringRecord, file: &str) -> Result<Columns, DataError> {
    let map = csv_util::build_header_map(headers);
    let ambiguous = || DataError::SchemaAmbiguity {
        file: file.to_string(),
        header: csv_util::header_line(headers),
    };
    let find = |name: &str| csv_util::find_column(&map, &[name], &[]);

    let mut categories = [0; 6];
    for category in MobilityCategory::ALL {
        categories[category.index()] =
            csv_util::find_column(&map, &[], &[category.column_prefix()]).ok_or_else(ambiguous)?;
    }
    Ok(Columns {
        country: find("country_region_code").ok_or_else(ambiguous)?,
        sub_region: find("sub_region_1").ok_or_else(ambiguous)?,
        date: find("date").ok_or_else(ambiguous)?,
        categories,
    })
}
