use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::NaiveDate;
use tempfile::TempDir;

use scot_covid19_data::config::TableSchemaHint;
use scot_covid19_data::domain::GRAND_TOTAL;
use scot_covid19_data::error::DataError;
use scot_covid19_data::regional::{
    CASES_FILE, OLD_CASES_FILE, OLD_DEATHS_FILE, POPULATIONS_FILE, RegionalLoader,
};

const POPULATIONS: &str = "Name,Population\nA,100000\nB,50000\nC,50000\nGrand Total,200000\n";

fn data_dir(files: &[(&str, &str)]) -> (TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    for (name, content) in files {
        fs::write(dir.join(name), content).unwrap();
    }
    (temp, dir)
}

fn date(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 3, d).unwrap()
}

#[test]
fn cases_are_scaled_per_head_and_totalled_from_present_values() {
    let (_temp, dir) = data_dir(&[
        (POPULATIONS_FILE, POPULATIONS),
        (CASES_FILE, "Date,A,B,C\n2020-03-01,10,5,X\n"),
    ]);

    let data = RegionalLoader::new(dir, 100_000, TableSchemaHint::Auto)
        .load()
        .unwrap();

    assert_eq!(data.health_boards, ["A", "B", "C"]);
    let record = data.cases.get(date(1)).unwrap();
    assert_eq!(record.get("A"), Some(10.0));
    assert_eq!(record.get("B"), Some(10.0));
    assert_eq!(record.get("C"), None);
    assert_eq!(record.get(GRAND_TOTAL), Some(20.0));
}

#[test]
fn newer_file_wins_and_total_is_recomputed() {
    let (_temp, dir) = data_dir(&[
        (POPULATIONS_FILE, POPULATIONS),
        (
            OLD_CASES_FILE,
            "Date,A,B,C,Grand Total\n2020-03-01,1,1,1,999\n2020-03-02,2,2,2,999\n",
        ),
        (CASES_FILE, "Date,A,B,C\n2020-03-02,4,4,X\n2020-03-03,6,6,6\n"),
    ]);

    let data = RegionalLoader::new(dir, 100_000, TableSchemaHint::Auto)
        .load()
        .unwrap();

    assert_eq!(data.cases.len(), 3);
    let seeded = data.cases.get(date(1)).unwrap();
    assert_eq!(seeded.get(GRAND_TOTAL), Some(5.0));

    let overlapping = data.cases.get(date(2)).unwrap();
    assert_eq!(overlapping.get("A"), Some(4.0));
    assert_eq!(overlapping.get("B"), Some(8.0));
    assert_eq!(overlapping.get("C"), None);
    assert_eq!(overlapping.get(GRAND_TOTAL), Some(12.0));
}

#[test]
fn sentinels_are_absent_not_zero() {
    let (_temp, dir) = data_dir(&[
        (POPULATIONS_FILE, POPULATIONS),
        (CASES_FILE, "Date,A,B,C\n2020-03-01,X,*,NA\n2020-03-02,1,NA,2\n"),
    ]);

    let data = RegionalLoader::new(dir, 100_000, TableSchemaHint::Auto)
        .load()
        .unwrap();

    assert!(data.cases.get(date(1)).is_none());
    let record = data.cases.get(date(2)).unwrap();
    assert_eq!(record.get("B"), None);
    assert_eq!(record.get("C"), Some(4.0));
}

#[test]
fn scaled_values_round_trip_to_raw_counts() {
    let (_temp, dir) = data_dir(&[
        (POPULATIONS_FILE, "Name,Population\nA,371910\nB,148790\nC,22270\n"),
        (CASES_FILE, "Date,A,B,C\n2020-03-01,37,11,3\n"),
    ]);

    let data = RegionalLoader::new(dir, 100_000, TableSchemaHint::Auto)
        .load()
        .unwrap();

    let record = data.cases.get(date(1)).unwrap();
    for (name, raw) in [("A", 37.0), ("B", 11.0), ("C", 3.0)] {
        let scaled = record.get(name).unwrap();
        let factor = data.scale[name].value();
        assert!((scaled * factor - raw).abs() < 1e-9, "{name}: {scaled} * {factor}");
    }
}

#[test]
fn failed_tables_are_recorded_and_others_still_load() {
    let (_temp, dir) = data_dir(&[
        (POPULATIONS_FILE, POPULATIONS),
        (CASES_FILE, "Date,A,B,C\n2020-03-01,1,2,3\n"),
        (OLD_DEATHS_FILE, "Date,A,B,Somewhere Else\n2020-03-01,1,2,3\n"),
    ]);

    let data = RegionalLoader::new(dir, 100_000, TableSchemaHint::Auto)
        .load()
        .unwrap();

    assert_eq!(data.cases.len(), 1);
    assert!(data.deaths.is_empty());
    assert!(data.failures.iter().any(|failure| failure.starts_with("deaths")));
    assert!(data.failures.iter().any(|failure| failure.starts_with("tests")));
}

#[test]
fn missing_population_table_is_fatal() {
    let (_temp, dir) = data_dir(&[(CASES_FILE, "Date,A,B,C\n2020-03-01,1,2,3\n")]);
    let err = RegionalLoader::new(dir, 100_000, TableSchemaHint::Auto)
        .load()
        .unwrap_err();
    assert_matches!(err, DataError::MissingFile(_));
}
