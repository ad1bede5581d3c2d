use std::fs;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use tempfile::{Builder, NamedTempFile};

use crate::config::ResolvedConfig;
use crate::domain::{RevisionMarker, SourceId};
use crate::error::DataError;

/// On-disk layout: downloaded source files and revision markers live under
/// the data root, generated outputs under the public root.
#[derive(Debug, Clone)]
pub struct Store {
    data_root: Utf8PathBuf,
    public_root: Utf8PathBuf,
}

impl Store {
    pub fn new() -> Result<Self, DataError> {
        let cwd = std::env::current_dir().map_err(|err| DataError::Filesystem(err.to_string()))?;
        let public_root = Utf8PathBuf::from_path_buf(cwd.join("public"))
            .map_err(|_| DataError::Filesystem("invalid output path".to_string()))?;

        let data_root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("scot-covid19-data"))
                    .ok()
            })
            .ok_or_else(|| {
                DataError::Filesystem("unable to resolve cache directory".to_string())
            })?;

        Ok(Self {
            data_root,
            public_root,
        })
    }

    /// Uses the configured directories, falling back to the defaults of
    /// [`Store::new`] for any left unset.
    pub fn from_config(config: &ResolvedConfig) -> Result<Self, DataError> {
        match (&config.data_dir, &config.public_dir) {
            (Some(data), Some(public)) => Ok(Self::new_with_paths(data.clone(), public.clone())),
            (data, public) => {
                let defaults = Self::new()?;
                Ok(Self::new_with_paths(
                    data.clone().unwrap_or(defaults.data_root),
                    public.clone().unwrap_or(defaults.public_root),
                ))
            }
        }
    }

    pub fn new_with_paths(data_root: Utf8PathBuf, public_root: Utf8PathBuf) -> Self {
        Self {
            data_root,
            public_root,
        }
    }

    pub fn data_root(&self) -> &Utf8Path {
        &self.data_root
    }

    pub fn public_root(&self) -> &Utf8Path {
        &self.public_root
    }

    pub fn data_path(&self, file: &str) -> Utf8PathBuf {
        self.data_root.join(file)
    }

    pub fn public_path(&self, file: &str) -> Utf8PathBuf {
        self.public_root.join(file)
    }

    pub fn revision_path(&self, source: SourceId) -> Utf8PathBuf {
        self.data_root.join(format!("{}.revision", source.as_str()))
    }

    pub fn metadata_path(&self, source: SourceId) -> Utf8PathBuf {
        self.data_root.join(format!("{}.json", source.as_str()))
    }

    pub fn ensure_data_root(&self) -> Result<(), DataError> {
        fs::create_dir_all(self.data_root.as_std_path())
            .map_err(|err| DataError::Filesystem(err.to_string()))
    }

    pub fn ensure_public_root(&self) -> Result<(), DataError> {
        fs::create_dir_all(self.public_root.as_std_path())
            .map_err(|err| DataError::Filesystem(err.to_string()))
    }

    pub fn exists(&self, path: &Utf8Path) -> bool {
        path.as_std_path().exists()
    }

    /// The marker of the snapshot currently on disk; empty before the first
    /// successful refresh.
    pub fn read_revision(&self, source: SourceId) -> Result<RevisionMarker, DataError> {
        let path = self.revision_path(source);
        if !path.as_std_path().exists() {
            return Ok(RevisionMarker::default());
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| DataError::Filesystem(format!("read {path}: {err}")))?;
        Ok(RevisionMarker::new(content))
    }

    pub fn write_revision(&self, source: SourceId, marker: &RevisionMarker) -> Result<(), DataError> {
        Self::write_bytes_atomic(&self.revision_path(source), marker.as_str().as_bytes())
    }

    pub fn read_metadata(&self, source: SourceId) -> Result<Option<SourceMetadata>, DataError> {
        let path = self.metadata_path(source);
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| DataError::Filesystem(err.to_string()))?;
        let metadata = serde_json::from_str(&content)
            .map_err(|err| DataError::Filesystem(format!("parse {path}: {err}")))?;
        Ok(Some(metadata))
    }

    pub fn write_metadata(path: &Utf8Path, metadata: &SourceMetadata) -> Result<(), DataError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| DataError::Filesystem(err.to_string()))?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(metadata)
            .map_err(|err| DataError::Filesystem(err.to_string()))?;
        fs::write(tmp_path.as_std_path(), &content)
            .map_err(|err| DataError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| DataError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), DataError> {
        let mut temp = Self::temp_file_for(path)?;
        std::io::Write::write_all(&mut temp, content)
            .map_err(|err| DataError::Filesystem(err.to_string()))?;
        Self::persist(temp, path)
    }

    /// A temp file in the destination's directory, so the final rename never
    /// crosses filesystems.
    pub fn temp_file_for(dest: &Utf8Path) -> Result<NamedTempFile, DataError> {
        let parent = dest
            .parent()
            .ok_or_else(|| DataError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| DataError::Filesystem(err.to_string()))?;
        Builder::new()
            .prefix(".scot-covid19")
            .suffix(".part")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| DataError::Filesystem(err.to_string()))
    }

    /// Replaces `dest` with the finished temp file in a single rename.
    pub fn persist(temp: NamedTempFile, dest: &Utf8Path) -> Result<(), DataError> {
        temp.persist(dest.as_std_path())
            .map_err(|err| DataError::Filesystem(format!("replace {dest}: {err}")))?;
        Ok(())
    }

    pub fn list_files(root: &Utf8Path) -> Result<Vec<PathBuf>, DataError> {
        if !root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = walk_dir(root.as_std_path())?
            .into_iter()
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        Ok(files)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub source: String,
    pub revision: RevisionMarker,
    pub downloaded_at: String,
    pub tool: String,
    pub files: Vec<String>,
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, DataError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| DataError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| DataError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}
