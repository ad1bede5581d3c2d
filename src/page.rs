use camino::Utf8PathBuf;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

use crate::error::DataError;
use crate::state::Datasets;
use crate::store::Store;

pub const PAGE_CONTEXT_FILE: &str = "page_context.json";

/// Values the index page template is rendered with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageContext {
    pub numbers_per: u32,
    pub upto_scotland: Option<NaiveDate>,
    pub upto_uk: Option<NaiveDate>,
    pub upto_mobility: Option<NaiveDate>,
    pub health_boards: Vec<String>,
    pub updating: bool,
    pub hide_zip_download_link: bool,
}

impl PageContext {
    pub fn new(datasets: &Datasets, numbers_per: u32, updating: bool) -> Self {
        Self {
            numbers_per,
            upto_scotland: datasets.upto_scotland(),
            upto_uk: datasets.upto_uk(),
            upto_mobility: datasets.upto_mobility(),
            health_boards: datasets
                .regional
                .as_ref()
                .map(|regional| regional.health_boards.clone())
                .unwrap_or_default(),
            updating,
            hide_zip_download_link: false,
        }
    }

    /// The copy shipped inside the zip package, which cannot link to itself.
    pub fn for_download(&self) -> Self {
        Self {
            updating: false,
            hide_zip_download_link: true,
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, DataError> {
        serde_json::to_vec_pretty(self).map_err(|err| DataError::Filesystem(err.to_string()))
    }

    pub fn write(&self, store: &Store) -> Result<Utf8PathBuf, DataError> {
        info!("Generating page context.");
        store.ensure_public_root()?;
        let path = store.public_path(PAGE_CONTEXT_FILE);
        Store::write_bytes_atomic(&path, &self.to_json()?)?;
        Ok(path)
    }
}
