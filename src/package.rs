use std::fs;
use std::io::{self, Write};
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};
use zip::ZipArchive;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::error::DataError;
use crate::mobility;
use crate::page::{PAGE_CONTEXT_FILE, PageContext};
use crate::store::Store;

pub const ZIP_FILE: &str = "scotland-covid19-data.zip";
pub const README_FILE: &str = "readme.txt";

const README: &str = "\
The public folder contains the website data: CSV files, chart descriptions
and the page context.
The data folder contains the data as downloaded from the various data sources used.

Data sources:
  * Scottish health board data - https://github.com/watty62/Scot_covid19
  * UK nations data - https://github.com/tomwhite/covid-19-uk-data
  * The Scottish Government - https://github.com/DataScienceScotland/COVID-19-Management-Information
  * Google mobility reports (not included in this download) - https://www.google.com/covid19/mobility/
";

/// Bundles the public and data directories into `scotland-covid19-data.zip`
/// under the public root. The large mobility report is left out and the page
/// context is replaced by its download copy.
pub fn build_package(store: &Store, page: &PageContext) -> Result<Utf8PathBuf, DataError> {
    info!("Generating zip.");
    store.ensure_public_root()?;
    let destination = store.public_path(ZIP_FILE);
    let temp = Store::temp_file_for(&destination)?;
    let mut writer = ZipWriter::new(temp);
    let options = SimpleFileOptions::default();

    let mut entries = Vec::new();
    for (prefix, root) in [("public", store.public_root()), ("data", store.data_root())] {
        for path in Store::list_files(root)? {
            let Some(name) = entry_name(prefix, root, &path) else {
                continue;
            };
            if skip(prefix, &name) {
                continue;
            }
            entries.push((name, path));
        }
    }

    for (name, path) in &entries {
        debug!("Adding {name}.");
        writer
            .start_file(name.as_str(), options)
            .map_err(|err| DataError::Filesystem(err.to_string()))?;
        let mut source = fs::File::open(path)
            .map_err(|err| DataError::Filesystem(format!("open {}: {err}", path.display())))?;
        io::copy(&mut source, &mut writer).map_err(|err| DataError::Filesystem(err.to_string()))?;
    }

    writer
        .start_file(format!("public/{PAGE_CONTEXT_FILE}"), options)
        .map_err(|err| DataError::Filesystem(err.to_string()))?;
    writer
        .write_all(&page.for_download().to_json()?)
        .map_err(|err| DataError::Filesystem(err.to_string()))?;

    writer
        .start_file(README_FILE, options)
        .map_err(|err| DataError::Filesystem(err.to_string()))?;
    writer
        .write_all(README.as_bytes())
        .map_err(|err| DataError::Filesystem(err.to_string()))?;

    let temp = writer
        .finish()
        .map_err(|err| DataError::Filesystem(err.to_string()))?;
    validate_package(temp.path())?;
    Store::persist(temp, &destination)?;
    Ok(destination)
}

/// `<prefix>/<path relative to root>` with forward slashes; `None` for paths
/// outside `root` or with non UTF-8 names.
fn entry_name(prefix: &str, root: &Utf8Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root.as_std_path()).ok()?;
    let parts: Option<Vec<&str>> = relative
        .components()
        .map(|component| component.as_os_str().to_str())
        .collect();
    let parts = parts?;
    Some(format!("{prefix}/{}", parts.join("/")))
}

fn skip(prefix: &str, name: &str) -> bool {
    let file_name = name.rsplit('/').next().unwrap_or(name);
    file_name.starts_with('.')
        || (prefix == "public" && (file_name == ZIP_FILE || file_name == PAGE_CONTEXT_FILE))
        || (prefix == "data" && file_name == mobility::DATA_FILE)
}

/// Reads every entry of the archive at `zip_path` to the end.
pub fn validate_package(zip_path: &Path) -> Result<(), DataError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| DataError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| DataError::Filesystem(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| DataError::Filesystem(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        io::copy(&mut entry, &mut io::sink())
            .map_err(|err| DataError::Filesystem(err.to_string()))?;
    }
    Ok(())
}
