use std::fs;

use assert_matches::assert_matches;

use scot_covid19_data::config::{Config, ConfigLoader, NationalLayout, TableSchemaHint};
use scot_covid19_data::domain::SourceId;
use scot_covid19_data::error::DataError;
use scot_covid19_data::fetch::RevisionProbe;

#[test]
fn parse_config_overrides() {
    let config: Config = serde_json::from_str(
        r#"{
            "numbers_per": 10000,
            "data_dir": "/tmp/scot-data",
            "http": {"timeout_secs": 5, "retries": 1},
            "national": {"layout": "combined"},
            "mobility": {"country_code": "IE", "regions": {"Leinster": ["Dublin"]}},
            "schema": "positional",
            "sources": {
                "mobility": {
                    "revision": [{"kind": "last_modified", "url": "https://example.org/report.csv"}]
                }
            }
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve_config(config).unwrap();
    assert_eq!(resolved.numbers_per, 10_000);
    assert_eq!(resolved.data_dir.as_deref().map(|dir| dir.as_str()), Some("/tmp/scot-data"));
    assert_eq!(resolved.http.timeout.as_secs(), 5);
    assert_eq!(resolved.http.retries, 1);
    assert_eq!(resolved.national_layout, NationalLayout::Combined);
    assert_eq!(resolved.schema_hint, TableSchemaHint::Positional);
    assert_eq!(resolved.mobility.country_code, "IE");
    assert_eq!(resolved.mobility.regions["Leinster"], ["Dublin"]);

    let mobility = resolved.source(SourceId::Mobility).unwrap();
    assert_eq!(mobility.files.len(), 1);
    assert_matches!(mobility.probes.as_slice(), [RevisionProbe::LastModified { .. }]);
}

#[test]
fn explicit_config_path_must_exist() {
    let err = ConfigLoader::resolve(Some("/nonexistent/scot-covid19.json")).unwrap_err();
    assert_matches!(err, DataError::MissingConfig(_));
}

#[test]
fn malformed_config_is_a_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("scot-covid19.json");
    fs::write(&path, "{ not json").unwrap();
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, DataError::ConfigParse(_));
}

#[test]
fn source_without_probes_is_rejected() {
    let config: Config =
        serde_json::from_str(r#"{"sources": {"uk": {"revision": []}}}"#).unwrap();
    let err = ConfigLoader::resolve_config(config).unwrap_err();
    assert_matches!(err, DataError::ConfigInvalid(_));
}
