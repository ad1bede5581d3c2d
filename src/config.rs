use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{DEFAULT_NUMBERS_PER, Nation, SourceId};
use crate::error::DataError;
use crate::fetch::{RemoteFile, RevisionProbe, SourceSpec};
use crate::{mobility, national, regional};

pub const DEFAULT_CONFIG_FILE: &str = "scot-covid19.json";

const SCOTLAND_CURRENT_BASE: &str =
    "https://raw.githubusercontent.com/DataScienceScotland/COVID-19-Management-Information/master";
const SCOTLAND_ARCHIVE_BASE: &str =
    "https://raw.githubusercontent.com/watty62/Scot_covid19/master/data/processed";
const SCOTLAND_COMMITS: &str =
    "https://api.github.com/repos/DataScienceScotland/COVID-19-Management-Information/commits/master";
const UK_TOTALS_BASE: &str = "https://raw.githubusercontent.com/geeogi/covid-19-uk-data/master/data";
const UK_TOTALS_COMMITS: &str = "https://api.github.com/repos/geeogi/covid-19-uk-data/commits/master";
const UK_DASHBOARD_CASES: &str = "https://api.coronavirus.data.gov.uk/v2/data?areaType=nation&metric=newCasesByPublishDate&metric=cumCasesByPublishDate&format=csv";
const UK_DASHBOARD_DEATHS: &str = "https://api.coronavirus.data.gov.uk/v2/data?areaType=nation&metric=newDeaths28DaysByPublishDate&metric=cumDeaths28DaysByPublishDate&format=csv";
const MOBILITY_PAGE: &str = "https://www.google.com/covid19/mobility/";
const MOBILITY_FILE_URL: &str = "https://www.gstatic.com/covid19/mobility/Global_Mobility_Report.csv";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub numbers_per: Option<u32>,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub public_dir: Option<String>,
    #[serde(default)]
    pub http: HttpEntry,
    #[serde(default)]
    pub national: NationalEntry,
    #[serde(default)]
    pub mobility: MobilityEntry,
    #[serde(default)]
    pub schema: Option<TableSchemaHint>,
    #[serde(default)]
    pub sources: BTreeMap<SourceId, SourceEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct HttpEntry {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retries: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct NationalEntry {
    #[serde(default)]
    pub layout: Option<NationalLayout>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MobilityEntry {
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub regions: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SourceEntry {
    #[serde(default)]
    pub files: Option<Vec<RemoteFile>>,
    #[serde(default)]
    pub revision: Option<Vec<RevisionProbe>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NationalLayout {
    /// One pre-built CSV per nation plus one for the UK.
    #[default]
    PerNation,
    /// One cases file and one deaths file keyed by (nation, date).
    Combined,
}

/// How a health-board table's columns are mapped onto entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableSchemaHint {
    #[default]
    Auto,
    Positional,
    Named,
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub retries: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            retries: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MobilitySettings {
    pub country_code: String,
    pub regions: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub numbers_per: u32,
    pub data_dir: Option<Utf8PathBuf>,
    pub public_dir: Option<Utf8PathBuf>,
    pub http: HttpSettings,
    pub national_layout: NationalLayout,
    pub mobility: MobilitySettings,
    pub schema_hint: TableSchemaHint,
    pub sources: BTreeMap<SourceId, SourceSpec>,
}

impl ResolvedConfig {
    pub fn source(&self, id: SourceId) -> Result<&SourceSpec, DataError> {
        self.sources
            .get(&id)
            .ok_or_else(|| DataError::UnknownSource(id.to_string()))
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, or the default config file when present. Without either
    /// the built-in defaults are used.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, DataError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if !config_path.exists() {
            if path.is_some() {
                return Err(DataError::MissingConfig(config_path));
            }
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| DataError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| DataError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, DataError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let numbers_per = config.numbers_per.unwrap_or(DEFAULT_NUMBERS_PER);
        if numbers_per == 0 {
            return Err(DataError::ConfigInvalid(
                "numbers_per must be greater than zero".to_string(),
            ));
        }

        let defaults = HttpSettings::default();
        let http = HttpSettings {
            timeout: config
                .http
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            retries: config.http.retries.unwrap_or(defaults.retries),
        };
        if http.timeout.is_zero() {
            return Err(DataError::ConfigInvalid(
                "http.timeout_secs must be greater than zero".to_string(),
            ));
        }

        let national_layout = config.national.layout.unwrap_or_default();
        let mobility = MobilitySettings {
            country_code: config
                .mobility
                .country_code
                .unwrap_or_else(|| "GB".to_string()),
            regions: config.mobility.regions.unwrap_or_else(default_mobility_regions),
        };

        let mut sources = default_sources(national_layout);
        for (id, entry) in config.sources {
            let spec = sources
                .entry(id)
                .or_insert_with(|| SourceSpec::new(id, Vec::new(), Vec::new()));
            if let Some(files) = entry.files {
                spec.files = files;
            }
            if let Some(probes) = entry.revision {
                spec.probes = probes;
            }
        }
        for spec in sources.values() {
            if spec.files.is_empty() {
                return Err(DataError::ConfigInvalid(format!(
                    "source {} has no files",
                    spec.id
                )));
            }
            if spec.probes.is_empty() {
                return Err(DataError::ConfigInvalid(format!(
                    "source {} has no revision probes",
                    spec.id
                )));
            }
        }

        Ok(ResolvedConfig {
            schema_version,
            numbers_per,
            data_dir: config.data_dir.map(Utf8PathBuf::from),
            public_dir: config.public_dir.map(Utf8PathBuf::from),
            http,
            national_layout,
            mobility,
            schema_hint: config.schema.unwrap_or_default(),
            sources,
        })
    }
}

pub fn default_sources(layout: NationalLayout) -> BTreeMap<SourceId, SourceSpec> {
    let mut sources = BTreeMap::new();
    sources.insert(SourceId::Scotland, scotland_source());
    sources.insert(SourceId::Uk, uk_source(layout));
    sources.insert(SourceId::Mobility, mobility_source());
    sources
}

fn scotland_source() -> SourceSpec {
    let current = regional::CURRENT_FILES
        .iter()
        .map(|name| RemoteFile::new(name, format!("{SCOTLAND_CURRENT_BASE}/{}", encode_path(name))));
    let archive = regional::ARCHIVE_FILES
        .iter()
        .map(|name| RemoteFile::frozen(name, format!("{SCOTLAND_ARCHIVE_BASE}/{name}")));
    SourceSpec::new(
        SourceId::Scotland,
        current.chain(archive).collect(),
        vec![RevisionProbe::GithubCommit {
            api_url: SCOTLAND_COMMITS.to_string(),
        }],
    )
}

fn uk_source(layout: NationalLayout) -> SourceSpec {
    match layout {
        NationalLayout::PerNation => SourceSpec::new(
            SourceId::Uk,
            Nation::ALL
                .iter()
                .map(|nation| {
                    let name = national::per_nation_file(*nation);
                    let url = format!("{UK_TOTALS_BASE}/{name}");
                    RemoteFile::new(&name, url)
                })
                .collect(),
            vec![RevisionProbe::GithubCommit {
                api_url: UK_TOTALS_COMMITS.to_string(),
            }],
        ),
        NationalLayout::Combined => SourceSpec::new(
            SourceId::Uk,
            vec![
                RemoteFile::new(national::COMBINED_CASES_FILE, UK_DASHBOARD_CASES),
                RemoteFile::new(national::COMBINED_DEATHS_FILE, UK_DASHBOARD_DEATHS),
            ],
            vec![RevisionProbe::LastModified {
                url: UK_DASHBOARD_CASES.to_string(),
            }],
        ),
    }
}

fn mobility_source() -> SourceSpec {
    SourceSpec::new(
        SourceId::Mobility,
        vec![RemoteFile::new(mobility::DATA_FILE, MOBILITY_FILE_URL)],
        vec![
            RevisionProbe::LinkQueryParam {
                page_url: MOBILITY_PAGE.to_string(),
                link_pattern: r#"https://www\.gstatic\.com/covid19/mobility/Global_Mobility_Report\.csv\?[^"'\s<>]+"#
                    .to_string(),
                param: "cachebust".to_string(),
            },
            RevisionProbe::PageScrape {
                page_url: MOBILITY_PAGE.to_string(),
                pattern: r"Reports created (\d{4}-\d{2}-\d{2})".to_string(),
            },
        ],
    )
}

pub fn default_mobility_regions() -> BTreeMap<String, Vec<String>> {
    let scotland = [
        "Aberdeen City",
        "Aberdeenshire",
        "Angus Council",
        "Argyll and Bute Council",
        "Clackmannanshire",
        "Dumfries and Galloway",
        "Dundee City Council",
        "East Ayrshire Council",
        "East Dunbartonshire Council",
        "East Lothian Council",
        "East Renfrewshire Council",
        "Edinburgh",
        "Falkirk",
        "Fife",
        "Glasgow City",
        "Highland Council",
        "Inverclyde",
        "Midlothian",
        "Moray",
        "Na h-Eileanan an Iar",
        "North Ayrshire Council",
        "North Lanarkshire",
        "Orkney",
        "Perth and Kinross",
        "Renfrewshire",
        "Scottish Borders",
        "Shetland Islands",
        "South Ayrshire Council",
        "South Lanarkshire",
        "Stirling",
        "West Dunbartonshire Council",
        "West Lothian",
    ];
    let mut regions = BTreeMap::new();
    regions.insert(
        "Scotland".to_string(),
        scotland.iter().map(|name| name.to_string()).collect(),
    );
    regions
}

fn encode_path(name: &str) -> String {
    name.replace(' ', "%20")
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults_cover_every_source() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.numbers_per, 100_000);
        assert_eq!(resolved.national_layout, NationalLayout::PerNation);
        assert_eq!(resolved.mobility.country_code, "GB");
        assert_eq!(resolved.mobility.regions["Scotland"].len(), 32);
        for id in SourceId::ALL {
            assert!(!resolved.source(id).unwrap().files.is_empty());
        }
    }

    #[test]
    fn scotland_urls_are_encoded() {
        let source = scotland_source();
        let file = source
            .files
            .iter()
            .find(|file| file.name == regional::CASES_FILE)
            .unwrap();
        assert!(!file.url.contains(' '));
        assert!(!file.frozen);
        assert!(
            source
                .files
                .iter()
                .any(|file| file.name == regional::POPULATIONS_FILE && file.frozen)
        );
    }

    #[test]
    fn combined_layout_switches_uk_files() {
        let config: Config =
            serde_json::from_str(r#"{"national": {"layout": "combined"}}"#).unwrap();
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        let uk = resolved.source(SourceId::Uk).unwrap();
        assert_eq!(uk.files.len(), 2);
    }

    #[test]
    fn rejects_zero_normalisation_constant() {
        let config: Config = serde_json::from_str(r#"{"numbers_per": 0}"#).unwrap();
        let err = ConfigLoader::resolve_config(config).unwrap_err();
        assert_matches!(err, DataError::ConfigInvalid(_));
    }
}
