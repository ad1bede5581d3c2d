use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::sync::Mutex;

use camino::Utf8PathBuf;

use scot_covid19_data::app::{App, ExportTarget, UpdateOptions};
use scot_covid19_data::config::{Config, ConfigLoader};
use scot_covid19_data::domain::{Nation, SourceId};
use scot_covid19_data::error::DataError;
use scot_covid19_data::fetch::{
    DownloadAction, Fetcher, HeadInfo, RemoteFile, RevisionProbe, SourceSpec,
};
use scot_covid19_data::national::per_nation_file;
use scot_covid19_data::output::JsonOutput;
use scot_covid19_data::regional::{CASES_FILE, OLD_DEATHS_FILE, POPULATIONS_FILE};
use scot_covid19_data::store::Store;
use scot_covid19_data::{mobility, package, page};

const SCOTLAND_COMMITS: &str = "https://api.example.org/scotland/commits/master";
const UK_COMMITS: &str = "https://api.example.org/uk/commits/master";
const MOBILITY_PAGE: &str = "https://example.org/mobility/";

#[derive(Default)]
struct MockFetcher {
    bodies: Mutex<HashMap<String, String>>,
    downloads: Mutex<Vec<String>>,
}

impl MockFetcher {
    fn serve(&self, url: &str, body: &str) {
        self.bodies
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_string());
    }
}

impl Fetcher for MockFetcher {
    fn fetch_text(&self, url: &str) -> Result<String, DataError> {
        self.bodies
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| DataError::FetchStatus {
                url: url.to_string(),
                status: 404,
                message: "not found".to_string(),
            })
    }

    fn fetch_head(&self, url: &str) -> Result<HeadInfo, DataError> {
        Err(DataError::Fetch {
            url: url.to_string(),
            message: "unreachable".to_string(),
        })
    }

    fn fetch_into(&self, url: &str, sink: &mut dyn Write) -> Result<u64, DataError> {
        let body = self.fetch_text(url)?;
        self.downloads.lock().unwrap().push(url.to_string());
        sink.write_all(body.as_bytes()).unwrap();
        Ok(body.len() as u64)
    }
}

fn file_url(name: &str) -> String {
    format!("https://files.example.org/{}", name.replace(' ', "%20"))
}

fn fetcher() -> MockFetcher {
    let fetcher = MockFetcher::default();
    fetcher.serve(SCOTLAND_COMMITS, r#"{"sha": "scot-1"}"#);
    fetcher.serve(UK_COMMITS, r#"{"sha": "uk-1"}"#);
    fetcher.serve(MOBILITY_PAGE, "<p>Reports created 2020-03-05</p>");

    fetcher.serve(
        &file_url(POPULATIONS_FILE),
        "Name,Population\nA,100000\nB,50000\nC,50000\nGrand Total,200000\n",
    );
    fetcher.serve(
        &file_url(CASES_FILE),
        "Date,A,B,C\n2020-03-01,10,5,X\n2020-03-02,12,6,1\n",
    );
    fetcher.serve(&file_url(OLD_DEATHS_FILE), "Date,A,B,C\n2020-03-02,1,0,0\n");
    for nation in Nation::ALL {
        fetcher.serve(
            &file_url(&per_nation_file(nation)),
            "Date,Tests,ConfirmedCases,Deaths\n2020-03-01,100,10,1\n2020-03-02,150,15,2\n",
        );
    }
    fetcher.serve(
        &file_url(mobility::DATA_FILE),
        "country_region_code,sub_region_1,sub_region_2,metro_area,date,retail_and_recreation_percent_change_from_baseline,grocery_and_pharmacy_percent_change_from_baseline,parks_percent_change_from_baseline,transit_stations_percent_change_from_baseline,workplaces_percent_change_from_baseline,residential_percent_change_from_baseline\n\
GB,,,,2020-03-01,-10,-4,6,-2,-8,2\n\
GB,Fife,,,2020-03-01,-20,-6,2,-4,-10,4\n",
    );
    fetcher
}

fn source(id: SourceId, files: Vec<RemoteFile>, probe: RevisionProbe) -> SourceSpec {
    SourceSpec::new(id, files, vec![probe])
}

fn app() -> (tempfile::TempDir, App<MockFetcher>) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let store = Store::new_with_paths(root.join("data"), root.join("public"));

    let mut config = ConfigLoader::resolve_config(Config::default()).unwrap();
    config.sources.insert(
        SourceId::Scotland,
        source(
            SourceId::Scotland,
            vec![
                RemoteFile::frozen(POPULATIONS_FILE, file_url(POPULATIONS_FILE)),
                RemoteFile::new(CASES_FILE, file_url(CASES_FILE)),
                RemoteFile::frozen(OLD_DEATHS_FILE, file_url(OLD_DEATHS_FILE)),
            ],
            RevisionProbe::GithubCommit {
                api_url: SCOTLAND_COMMITS.to_string(),
            },
        ),
    );
    config.sources.insert(
        SourceId::Uk,
        source(
            SourceId::Uk,
            Nation::ALL
                .iter()
                .map(|nation| {
                    let name = per_nation_file(*nation);
                    RemoteFile::new(&name, file_url(&name))
                })
                .collect(),
            RevisionProbe::GithubCommit {
                api_url: UK_COMMITS.to_string(),
            },
        ),
    );
    config.sources.insert(
        SourceId::Mobility,
        source(
            SourceId::Mobility,
            vec![RemoteFile::new(mobility::DATA_FILE, file_url(mobility::DATA_FILE))],
            RevisionProbe::PageScrape {
                page_url: MOBILITY_PAGE.to_string(),
                pattern: r"Reports created (\d{4}-\d{2}-\d{2})".to_string(),
            },
        ),
    );
    (temp, App::new(store, fetcher(), config))
}

#[test]
fn update_loads_every_dataset() {
    let (_temp, app) = app();
    let result = app.update(&UpdateOptions::default(), &JsonOutput).unwrap();

    assert_eq!(result.sources.len(), 3);
    for source in &result.sources {
        assert!(source.error.is_none(), "{:?}", source.error);
        assert!(source.stale);
    }
    assert!(result.datasets.iter().all(|status| status.loaded));

    let scotland = result
        .datasets
        .iter()
        .find(|status| status.dataset == "scotland")
        .unwrap();
    assert_eq!(scotland.upto.unwrap().to_string(), "2020-03-02");
    assert!(!scotland.failures.is_empty());

    let snapshot = app.shared().snapshot();
    let regional = snapshot.regional.as_ref().unwrap();
    assert_eq!(regional.cases.len(), 2);
    assert!(snapshot.national.as_ref().unwrap().nation(Nation::Uk).is_some());
    assert!(snapshot.mobility.as_ref().unwrap().region("Fife").is_some());
    assert!(!app.shared().is_updating());
}

#[test]
fn unchanged_revisions_download_nothing() {
    let (_temp, app) = app();
    app.update(&UpdateOptions::default(), &JsonOutput).unwrap();
    let first = app.fetcher_downloads();

    let again = app.update(&UpdateOptions::default(), &JsonOutput).unwrap();
    assert!(again.sources.iter().all(|source| !source.stale));
    assert_eq!(app.fetcher_downloads(), first);
}

#[test]
fn frozen_files_are_kept_across_revisions() {
    let (_temp, app) = app();
    app.update(&UpdateOptions::default(), &JsonOutput).unwrap();

    let populations = app.store().data_path(POPULATIONS_FILE);
    fs::write(populations.as_std_path(), "Name,Population\nA,100000\nB,50000\nC,50000\n").unwrap();

    let refreshed = App::new(
        app.store().clone(),
        {
            let fetcher = fetcher();
            fetcher.serve(SCOTLAND_COMMITS, r#"{"sha": "scot-2"}"#);
            fetcher
        },
        app.config().clone(),
    );
    let result = refreshed
        .update(
            &UpdateOptions {
                force: false,
                only: Some(SourceId::Scotland),
            },
            &JsonOutput,
        )
        .unwrap();

    let scotland = &result.sources[0];
    assert_eq!(scotland.revision.as_str(), "scot-2");
    let downloaded: Vec<&str> = scotland
        .files
        .iter()
        .filter(|file| matches!(file.action, DownloadAction::Downloaded { .. }))
        .map(|file| file.name.as_str())
        .collect();
    assert_eq!(downloaded, [CASES_FILE]);
    let kept = fs::read_to_string(populations.as_std_path()).unwrap();
    assert!(!kept.contains("Grand Total"));
}

#[test]
fn export_writes_every_output() {
    let (_temp, app) = app();
    app.update(&UpdateOptions::default(), &JsonOutput).unwrap();
    let result = app.export(ExportTarget::All, &JsonOutput).unwrap();

    let public = app.store().public_root().to_owned();
    for name in [
        "scotland_cases_per_100000.csv",
        "scotland_deaths_per_100000.csv",
        "scotland_icu_deceased.csv",
        "scotland_tests.csv",
        "a_per_100000.csv",
        "uk_cases_per_100000.csv",
        "uk_deaths_per_100000.csv",
        "northern_ireland_per_100000.csv",
        "mobility_uk.csv",
        "mobility_scotland.csv",
        "charts.json",
        page::PAGE_CONTEXT_FILE,
        package::ZIP_FILE,
    ] {
        assert!(public.join(name).as_std_path().exists(), "{name} missing");
        assert!(result.written.iter().any(|path| path.ends_with(name)));
    }

    let cases = fs::read_to_string(public.join("scotland_cases_per_100000.csv").as_std_path()).unwrap();
    assert_eq!(
        cases,
        "Date,A,B,C,Grand Total\n2020-03-01,10,10,,20\n2020-03-02,12,12,2,26\n"
    );

    let board = fs::read_to_string(public.join("a_per_100000.csv").as_std_path()).unwrap();
    assert!(board.starts_with("Date,Cases,Deaths,Cases Ratio,Deaths Ratio\n2020-03-01,10,,0.5,\n"));
}

#[test]
fn export_without_data_still_writes_page_context() {
    let (_temp, app) = app();
    let result = app.export(ExportTarget::Page, &JsonOutput).unwrap();
    assert_eq!(result.written.len(), 1);

    let content = fs::read_to_string(
        app.store()
            .public_path(page::PAGE_CONTEXT_FILE)
            .as_std_path(),
    )
    .unwrap();
    let json: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(json["upto_scotland"], serde_json::Value::Null);
    assert_eq!(json["health_boards"], serde_json::json!([]));
}

trait Downloads {
    fn fetcher_downloads(&self) -> usize;
}

impl Downloads for App<MockFetcher> {
    fn fetcher_downloads(&self) -> usize {
        self.fetcher().downloads.lock().unwrap().len()
    }
}
