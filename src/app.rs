use std::time::{Duration, Instant};

use chrono::NaiveDate;
use clap::ValueEnum;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::chart::ChartBuilder;
use crate::config::ResolvedConfig;
use crate::domain::{RevisionMarker, SourceId};
use crate::error::DataError;
use crate::export::CsvExporter;
use crate::fetch::{self, DownloadAction, Fetcher, SourceSpec};
use crate::mobility::MobilityLoader;
use crate::national::NationalLoader;
use crate::package;
use crate::page::PageContext;
use crate::regional::RegionalLoader;
use crate::state::{Datasets, SharedDatasets};
use crate::store::{SourceMetadata, Store};

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Download every file regardless of revision or cache.
    pub force: bool,
    /// Refresh only this source; the others are loaded from cache.
    pub only: Option<SourceId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportTarget {
    Csv,
    Charts,
    Page,
    Zip,
    All,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub sources: Vec<SourceCheck>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceCheck {
    pub source: SourceId,
    pub current: RevisionMarker,
    pub remote: Option<RevisionMarker>,
    pub up_to_date: Option<bool>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileResult {
    pub name: String,
    #[serde(flatten)]
    pub action: DownloadAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshResult {
    pub source: SourceId,
    pub previous: RevisionMarker,
    /// The revision now on disk; unchanged when the refresh failed.
    pub revision: RevisionMarker,
    pub stale: bool,
    pub files: Vec<FileResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetStatus {
    pub dataset: String,
    pub loaded: bool,
    pub upto: Option<NaiveDate>,
    /// Tables that were skipped while the dataset itself loaded.
    pub failures: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadResult {
    pub datasets: Vec<DatasetStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateResult {
    pub sources: Vec<RefreshResult>,
    pub datasets: Vec<DatasetStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportResult {
    pub written: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<F: Fetcher> {
    store: Store,
    fetcher: F,
    config: ResolvedConfig,
    shared: SharedDatasets,
}

impl<F: Fetcher> App<F> {
    pub fn new(store: Store, fetcher: F, config: ResolvedConfig) -> Self {
        Self {
            store,
            fetcher,
            config,
            shared: SharedDatasets::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Readers keep a clone of this to see each newly published generation.
    pub fn shared(&self) -> &SharedDatasets {
        &self.shared
    }

    /// Compares each source's on-disk revision with upstream. Writes nothing.
    pub fn check(&self, sink: &dyn ProgressSink) -> Result<CheckResult, DataError> {
        let mut sources = Vec::new();
        for spec in self.config.sources.values() {
            sink.event(ProgressEvent {
                message: format!("phase=Check; source={}", spec.id),
                elapsed: None,
            });
            let current = self.store.read_revision(spec.id)?;
            let check = match fetch::check_revision(&self.fetcher, spec) {
                Ok(remote) => SourceCheck {
                    source: spec.id,
                    up_to_date: Some(remote == current),
                    current,
                    remote: Some(remote),
                    error: None,
                },
                Err(err) => SourceCheck {
                    source: spec.id,
                    current,
                    remote: None,
                    up_to_date: None,
                    error: Some(err.to_string()),
                },
            };
            sources.push(check);
        }
        Ok(CheckResult { sources })
    }

    /// Brings the on-disk cache up to date. A source that fails keeps its
    /// previous files and revision; the others carry on.
    pub fn refresh(
        &self,
        options: &UpdateOptions,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<RefreshResult>, DataError> {
        self.store.ensure_data_root()?;
        let mut results = Vec::new();
        for spec in self.config.sources.values() {
            if options.only.is_some_and(|only| only != spec.id) {
                continue;
            }
            results.push(self.refresh_source(spec, options.force, sink));
        }
        Ok(results)
    }

    /// Parses every dataset from the cache and publishes the result.
    pub fn load(&self, sink: &dyn ProgressSink) -> LoadResult {
        let (datasets, statuses) = self.load_datasets(sink);
        self.shared.publish(datasets);
        LoadResult { datasets: statuses }
    }

    /// Refresh, then parse into a fresh generation and publish it in one swap.
    pub fn update(
        &self,
        options: &UpdateOptions,
        sink: &dyn ProgressSink,
    ) -> Result<UpdateResult, DataError> {
        let _guard = self.shared.begin_update().ok_or(DataError::UpdateInProgress)?;
        let start = Instant::now();
        let sources = self.refresh(options, sink)?;
        let (datasets, statuses) = self.load_datasets(sink);
        self.shared.publish(datasets);
        sink.event(ProgressEvent {
            message: "phase=Done; update complete".to_string(),
            elapsed: Some(start.elapsed()),
        });
        Ok(UpdateResult {
            sources,
            datasets: statuses,
        })
    }

    /// Emits outputs from the currently published datasets.
    pub fn export(
        &self,
        target: ExportTarget,
        sink: &dyn ProgressSink,
    ) -> Result<ExportResult, DataError> {
        let datasets = self.shared.snapshot();
        let numbers_per = self.config.numbers_per;
        let regions: Vec<String> = self.config.mobility.regions.keys().cloned().collect();
        let all = target == ExportTarget::All;
        let mut written = Vec::new();

        if all || target == ExportTarget::Csv {
            sink.event(ProgressEvent {
                message: "phase=Export; csv".to_string(),
                elapsed: None,
            });
            let paths = CsvExporter::new(&self.store, numbers_per, regions.clone()).export(&datasets)?;
            written.extend(paths.into_iter().map(|path| path.to_string()));
        }
        if all || target == ExportTarget::Charts {
            sink.event(ProgressEvent {
                message: "phase=Export; charts".to_string(),
                elapsed: None,
            });
            let path = ChartBuilder::new(numbers_per, regions).write(&self.store, &datasets)?;
            written.push(path.to_string());
        }
        let page = PageContext::new(&datasets, numbers_per, self.shared.is_updating());
        if all || target == ExportTarget::Page {
            sink.event(ProgressEvent {
                message: "phase=Export; page".to_string(),
                elapsed: None,
            });
            written.push(page.write(&self.store)?.to_string());
        }
        if all || target == ExportTarget::Zip {
            sink.event(ProgressEvent {
                message: "phase=Export; zip".to_string(),
                elapsed: None,
            });
            written.push(package::build_package(&self.store, &page)?.to_string());
        }
        Ok(ExportResult { written })
    }

    fn refresh_source(&self, spec: &SourceSpec, force: bool, sink: &dyn ProgressSink) -> RefreshResult {
        let start = Instant::now();
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; source={}", spec.id),
            elapsed: None,
        });

        let previous = match self.store.read_revision(spec.id) {
            Ok(marker) => marker,
            Err(err) => return failed(spec.id, RevisionMarker::default(), err),
        };
        let remote = match fetch::check_revision(&self.fetcher, spec) {
            Ok(remote) => Some(remote),
            Err(err) => {
                warn!("Could not check {} revision, using cached files: {err}", spec.id);
                None
            }
        };
        let stale = remote.as_ref().is_some_and(|remote| *remote != previous);
        debug!(
            "{}: current data {previous}, remote data {}, data is {}",
            spec.id,
            remote
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown".to_string()),
            if stale { "stale" } else { "current" }
        );
        if force {
            info!("Downloading all {} files.", spec.id);
        } else if stale {
            info!("Downloading updated {} files.", spec.id);
        }

        let mut files = Vec::new();
        let mut error = remote
            .is_none()
            .then(|| format!("revision check failed for {}", spec.id));
        for file in &spec.files {
            let overwrite = force || (stale && !file.frozen);
            let destination = self.store.data_path(&file.name);
            match fetch::download(&self.fetcher, file, &destination, overwrite) {
                Ok(action) => {
                    if let DownloadAction::Downloaded { bytes } = action {
                        sink.event(ProgressEvent {
                            message: format!("phase=Download; file={} bytes={bytes}", file.name),
                            elapsed: None,
                        });
                    }
                    files.push(FileResult {
                        name: file.name.clone(),
                        action,
                    });
                }
                Err(err) => {
                    warn!("Downloading {} failed: {err}", file.name);
                    error = Some(err.to_string());
                    break;
                }
            }
        }

        let complete = files.len() == spec.files.len();
        let downloaded = files
            .iter()
            .any(|file| matches!(file.action, DownloadAction::Downloaded { .. }));
        let mut revision = previous.clone();
        if let (true, Some(remote)) = (complete, remote) {
            if stale || downloaded {
                match self.record_revision(spec, &remote) {
                    Ok(()) => revision = remote,
                    Err(err) => error = Some(err.to_string()),
                }
            }
        }

        sink.event(ProgressEvent {
            message: format!("phase=Done; source={} revision={revision}", spec.id),
            elapsed: Some(start.elapsed()),
        });
        RefreshResult {
            source: spec.id,
            previous,
            revision,
            stale,
            files,
            error,
        }
    }

    fn record_revision(&self, spec: &SourceSpec, remote: &RevisionMarker) -> Result<(), DataError> {
        self.store.write_revision(spec.id, remote)?;
        let meta = self.build_metadata(spec, remote);
        Store::write_metadata(&self.store.metadata_path(spec.id), &meta)
    }

    fn build_metadata(&self, spec: &SourceSpec, revision: &RevisionMarker) -> SourceMetadata {
        SourceMetadata {
            source: spec.id.to_string(),
            revision: revision.clone(),
            downloaded_at: iso_timestamp(),
            tool: format!("scot-covid19/{}", env!("CARGO_PKG_VERSION")),
            files: spec.files.iter().map(|file| file.name.clone()).collect(),
        }
    }

    fn load_datasets(&self, sink: &dyn ProgressSink) -> (Datasets, Vec<DatasetStatus>) {
        let dir = self.store.data_root();
        let numbers_per = self.config.numbers_per;
        let mut datasets = Datasets::default();
        let mut statuses = Vec::new();

        sink.event(ProgressEvent {
            message: "phase=Load; dataset=scotland".to_string(),
            elapsed: None,
        });
        match RegionalLoader::new(dir, numbers_per, self.config.schema_hint).load() {
            Ok(regional) => {
                statuses.push(loaded("scotland", regional.last_date(), regional.failures.clone()));
                datasets.regional = Some(regional);
            }
            Err(err) => statuses.push(unavailable("scotland", err)),
        }

        sink.event(ProgressEvent {
            message: "phase=Load; dataset=uk".to_string(),
            elapsed: None,
        });
        match NationalLoader::new(dir, numbers_per, self.config.national_layout).load() {
            Ok(national) => {
                statuses.push(loaded("uk", national.last_date(), national.failures.clone()));
                datasets.national = Some(national);
            }
            Err(err) => statuses.push(unavailable("uk", err)),
        }

        sink.event(ProgressEvent {
            message: "phase=Load; dataset=mobility".to_string(),
            elapsed: None,
        });
        match MobilityLoader::new(dir, self.config.mobility.clone()).load() {
            Ok(mut mobility) => {
                mobility.accessed_at = self
                    .store
                    .read_metadata(SourceId::Mobility)
                    .ok()
                    .flatten()
                    .map(|meta| meta.downloaded_at);
                statuses.push(loaded("mobility", mobility.last_date(), Vec::new()));
                datasets.mobility = Some(mobility);
            }
            Err(err) => statuses.push(unavailable("mobility", err)),
        }

        (datasets, statuses)
    }
}

fn failed(source: SourceId, previous: RevisionMarker, err: DataError) -> RefreshResult {
    warn!("Refreshing {source} failed: {err}");
    RefreshResult {
        source,
        revision: previous.clone(),
        previous,
        stale: false,
        files: Vec::new(),
        error: Some(err.to_string()),
    }
}

fn loaded(dataset: &str, upto: Option<NaiveDate>, failures: Vec<String>) -> DatasetStatus {
    DatasetStatus {
        dataset: dataset.to_string(),
        loaded: true,
        upto,
        failures,
        error: None,
    }
}

fn unavailable(dataset: &str, err: DataError) -> DatasetStatus {
    warn!("{dataset} data unavailable: {err}");
    DatasetStatus {
        dataset: dataset.to_string(),
        loaded: false,
        upto: None,
        failures: Vec::new(),
        error: Some(err.to_string()),
    }
}

fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
