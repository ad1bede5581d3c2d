//! CSV files for download beside the charts.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use crate::domain::{Measure, Nation, UK_KEY};
use crate::error::DataError;
use crate::metrics::{self, Table};
use crate::state::Datasets;
use crate::store::Store;

pub struct CsvExporter<'a> {
    store: &'a Store,
    numbers_per: u32,
    mobility_regions: Vec<String>,
}

impl<'a> CsvExporter<'a> {
    pub fn new(store: &'a Store, numbers_per: u32, mobility_regions: Vec<String>) -> Self {
        Self {
            store,
            numbers_per,
            mobility_regions,
        }
    }

    /// Writes every table the loaded datasets support and returns the paths
    /// written. Missing datasets contribute nothing.
    pub fn export(&self, datasets: &Datasets) -> Result<Vec<Utf8PathBuf>, DataError> {
        self.store.ensure_public_root()?;
        let per = self.numbers_per;
        let mut tables: Vec<(String, Table)> = Vec::new();

        if let Some(regional) = &datasets.regional {
            info!("Exporting Scottish data.");
            for measure in Measure::ALL {
                tables.push((
                    format!("scotland_{}_per_{per}.csv", measure.as_str()),
                    metrics::health_board_table(regional, measure),
                ));
            }
            tables.push((
                "scotland_icu_deceased.csv".to_string(),
                metrics::icu_deceased_table(regional),
            ));
            tables.push(("scotland_tests.csv".to_string(), metrics::tests_table(regional)));
            for board in &regional.health_boards {
                tables.push((
                    format!("{}_per_{per}.csv", file_stem(board)),
                    metrics::health_board_summary(regional, board)?,
                ));
            }
        }

        if let Some(national) = &datasets.national {
            info!("Exporting UK data.");
            for measure in Measure::ALL {
                tables.push((
                    format!("uk_{}_per_{per}.csv", measure.as_str()),
                    metrics::uk_table(national, measure),
                ));
            }
            for nation in Nation::CONSTITUENTS {
                match metrics::nation_comparison(national, nation) {
                    Ok(table) => tables.push((
                        format!("{}_per_{per}.csv", file_stem(nation.name())),
                        table,
                    )),
                    Err(err) => debug!("No comparison for {nation}: {err}"),
                }
            }
        }

        if let Some(mobility) = &datasets.mobility {
            info!("Exporting mobility data.");
            for region in std::iter::once(UK_KEY).chain(self.mobility_regions.iter().map(String::as_str)) {
                if let Some(table) = metrics::mobility_table(mobility, region) {
                    tables.push((format!("mobility_{}.csv", file_stem(region)), table));
                }
            }
        }

        let mut written = Vec::with_capacity(tables.len());
        for (name, table) in tables {
            let path = self.store.public_path(&name);
            write_table(&path, &table)?;
            written.push(path);
        }
        Ok(written)
    }
}

/// `Health Board Name` -> `health_board_name`.
pub fn file_stem(name: &str) -> String {
    name.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join("_")
}

/// Writes `table` with one row per date; absent values are empty cells. The
/// file only replaces `path` once it is complete.
pub fn write_table(path: &Utf8Path, table: &Table) -> Result<(), DataError> {
    let temp = Store::temp_file_for(path)?;
    let mut writer = csv::Writer::from_writer(temp);
    let to_fs = |err: csv::Error| DataError::Filesystem(format!("write {path}: {err}"));

    writer.write_record(&table.headers).map_err(to_fs)?;
    for row in &table.rows {
        let mut record = Vec::with_capacity(row.values.len() + 1);
        record.push(row.date.format("%Y-%m-%d").to_string());
        record.extend(
            row.values
                .iter()
                .map(|value| value.map(|value| value.to_string()).unwrap_or_default()),
        );
        writer.write_record(&record).map_err(to_fs)?;
    }
    let temp = writer
        .into_inner()
        .map_err(|err| DataError::Filesystem(format!("write {path}: {}", err.error())))?;
    Store::persist(temp, path)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::NaiveDate;

    use super::*;

    #[test]
    fn stems_are_lowercase_with_underscores() {
        assert_eq!(file_stem("Ayrshire and Arran"), "ayrshire_and_arran");
        assert_eq!(file_stem("Northern Ireland"), "northern_ireland");
        assert_eq!(file_stem("UK"), "uk");
    }

    #[test]
    fn absent_values_are_written_as_empty_cells() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("table.csv")).unwrap();
        let mut table = Table::new(vec!["Date".to_string(), "A".to_string(), "B".to_string()]);
        table.push(NaiveDate::from_ymd_opt(2020, 3, 1).unwrap(), vec![Some(10.0), None]);
        table.push(NaiveDate::from_ymd_opt(2020, 3, 2).unwrap(), vec![Some(2.5), Some(0.0)]);

        write_table(&path, &table).unwrap();

        let content = fs::read_to_string(path.as_std_path()).unwrap();
        assert_eq!(content, "Date,A,B\n2020-03-01,10,\n2020-03-02,2.5,0\n");
    }

    #[test]
    fn nothing_is_written_without_datasets() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = Store::new_with_paths(root.join("data"), root.join("public"));
        let written = CsvExporter::new(&store, 100_000, vec![])
            .export(&Datasets::default())
            .unwrap();
        assert!(written.is_empty());
    }
}
