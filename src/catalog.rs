//! Manifests for clients that cannot describe themselves.
//!
//! Some runtimes connect with an empty function list and only a process tag
//! (typically their executable or assembly name). The broker then looks the
//! tag up here and serves the functions recorded for it.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use rail_protocol::Manifest;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::watcher::{DirectoryWatcher, WatchedType};

pub trait AssetCatalog: Send + Sync {
    fn lookup(&self, process_tag: &str) -> Option<Manifest>;
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog directory {0} does not exist")]
    MissingDir(PathBuf),
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path} is not a valid manifest: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
struct CatalogEntry {
    tag: String,
    path: PathBuf,
    manifest: Manifest,
}

/// Directory of `*.json` manifests, e.g. the `Rail.manifest.json` files the
/// SDK generators write.
///
/// An entry is keyed by its `processTag` (or `assembly`), else its
/// `context`, else the file name without `.json` and `.manifest`. Keys
/// compare case-insensitively.
pub struct DiskCatalog {
    dir: PathBuf,
    entries: DashMap<String, CatalogEntry>,
}

impl DiskCatalog {
    /// Loads every manifest in `dir`. Unreadable files are skipped with a warning.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(CatalogError::MissingDir(dir));
        }
        let catalog = Self {
            dir,
            entries: DashMap::new(),
        };
        catalog.rescan()?;
        Ok(catalog)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Re-reads the whole directory. Returns the number of entries.
    pub fn rescan(&self) -> Result<usize, CatalogError> {
        let read_dir = std::fs::read_dir(&self.dir).map_err(|source| CatalogError::Read {
            path: self.dir.clone(),
            source,
        })?;

        self.entries.clear();
        for entry in read_dir.flatten() {
            let path = entry.path();
            if !is_manifest_file(&path) {
                continue;
            }
            if let Err(e) = self.load_file(&path) {
                warn!("skipping catalog file: {e}");
            }
        }
        info!(dir = %self.dir.display(), entries = self.entries.len(), "asset catalog loaded");
        Ok(self.entries.len())
    }

    /// Adds or replaces the entry stored in `path`. Returns its key.
    pub fn load_file(&self, path: &Path) -> Result<String, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: Manifest = serde_json::from_str(&raw).map_err(|source| CatalogError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let tag = manifest
            .process_tag
            .clone()
            .or_else(|| manifest.context.clone())
            .unwrap_or_else(|| tag_from_file_name(path));

        // a file that changed its tag must not leave the old key behind
        self.entries.retain(|_, e| e.path != path);
        debug!(%tag, path = %path.display(), functions = manifest.functions.len(), "catalog entry loaded");
        self.entries.insert(
            tag.to_lowercase(),
            CatalogEntry {
                tag: tag.clone(),
                path: path.to_path_buf(),
                manifest,
            },
        );
        Ok(tag)
    }

    pub fn remove_file(&self, path: &Path) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.path != path);
        before - self.entries.len()
    }

    /// `(tag, manifest)` pairs sorted by tag.
    pub fn entries(&self) -> Vec<(String, Manifest)> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.tag.clone(), e.manifest.clone()))
            .collect();
        all.sort_by(|a, b| a.0.to_lowercase().cmp(&b.0.to_lowercase()));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keeps the catalog in sync with its directory until the returned watcher is dropped.
    pub async fn watch(self: &Arc<Self>, poll_interval: Duration) -> Result<DirectoryWatcher> {
        let watched: Arc<dyn WatchedType> = Arc::new(CatalogWatch(self.clone()));
        DirectoryWatcher::new(self.dir.clone(), watched, false, true, poll_interval).await
    }
}

impl AssetCatalog for DiskCatalog {
    fn lookup(&self, process_tag: &str) -> Option<Manifest> {
        let key = process_tag.trim().to_lowercase();
        if let Some(entry) = self.entries.get(&key) {
            return Some(entry.manifest.clone());
        }
        // clients often report "Calc.exe" or a full path where the catalog says "Calc"
        let stem = Path::new(process_tag.trim())
            .file_stem()?
            .to_string_lossy()
            .to_lowercase();
        self.entries.get(&stem).map(|e| e.manifest.clone())
    }
}

struct CatalogWatch(Arc<DiskCatalog>);

#[async_trait]
impl WatchedType for CatalogWatch {
    fn is_relevant(&self, path: &Path) -> bool {
        is_manifest_file(path)
    }

    async fn on_create_or_modify(&self, path: &Path) -> Result<()> {
        let tag = self.0.load_file(path)?;
        info!(%tag, path = %path.display(), "catalog entry updated");
        Ok(())
    }

    async fn on_remove(&self, path: &Path) -> Result<()> {
        if self.0.remove_file(path) > 0 {
            info!(path = %path.display(), "catalog entry removed");
        }
        Ok(())
    }
}

fn is_manifest_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

fn tag_from_file_name(path: &Path) -> String {
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    match name.strip_suffix(".manifest") {
        Some(stripped) => stripped.to_string(),
        None => name,
    }
}
