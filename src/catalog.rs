// src/catalog.rs
//
// Snapshot of the file names this node offers to peers

use log::{debug, info};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("couldn't create shared directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error scanning shared directory {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// Base names of the files under the shared directory.
///
/// The catalog is only as fresh as its last `rebuild`; it does not watch
/// the filesystem. Names are base names only, so two files with the same
/// name in different subdirectories collapse into one entry.
pub struct FileCatalog {
    root: PathBuf,
    files: RwLock<HashSet<String>>,
}

impl FileCatalog {
    /// Create an empty catalog over `root`. Call `rebuild` to populate it.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            files: RwLock::new(HashSet::new()),
        }
    }

    /// Create the catalog and scan the directory once
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, CatalogError> {
        let catalog = Self::new(root);
        catalog.rebuild()?;
        Ok(catalog)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Clear and repopulate the catalog from disk, returning the entry count.
    ///
    /// The directory is created if missing. The write lock is held for the
    /// whole walk, so concurrent snapshots wait for the rebuild to finish.
    /// On error the catalog is left empty.
    pub fn rebuild(&self) -> Result<usize, CatalogError> {
        let mut files = self.files.write();
        files.clear();

        fs::create_dir_all(&self.root).map_err(|source| CatalogError::CreateDir {
            path: self.root.clone(),
            source,
        })?;

        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(|source| CatalogError::Walk {
                path: self.root.clone(),
                source,
            })?;

            if entry.file_type().is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            debug!("Indexed {}", entry.path().display());
            files.insert(name);
        }

        info!("File index built. Found {} files.", files.len());
        Ok(files.len())
    }

    /// Current catalog contents
    pub fn snapshot(&self) -> HashSet<String> {
        self.files.read().clone()
    }

    /// Current catalog contents as a list, in no particular order
    pub fn file_names(&self) -> Vec<String> {
        self.files.read().iter().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.read().contains(name)
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}
