//! Shared libraries loaded once and visible to every plugin domain.

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::loader::{LibraryHandle, ModuleLoader};

/// One library in the shared set.
#[derive(Debug)]
pub struct SharedLibraryRecord {
    name: String,
    handle: LibraryHandle,
}

impl SharedLibraryRecord {
    pub fn new(name: impl Into<String>, handle: LibraryHandle) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version identity, when the library reports one.
    pub fn version(&self) -> Option<&str> {
        self.handle.version()
    }

    pub fn handle(&self) -> &LibraryHandle {
        &self.handle
    }
}

/// The fixed set of shared libraries. Read-only once built.
#[derive(Debug, Default)]
pub struct SharedLibrarySet {
    records: Vec<Arc<SharedLibraryRecord>>,
}

impl SharedLibrarySet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `<dir>/<name>/<name>.<ext>` under `shared_dir`.
    ///
    /// Subdirectories without the expected file are skipped, as are
    /// libraries that fail to load (logged). A missing `shared_dir` yields
    /// an empty set.
    pub fn load_all(loader: &dyn ModuleLoader, shared_dir: &Path, extension: &str) -> Result<Self> {
        let mut set = Self::new();

        if !shared_dir.exists() {
            tracing::debug!("Shared library directory {:?} does not exist", shared_dir);
            return Ok(set);
        }

        let mut dirs: Vec<_> = std::fs::read_dir(shared_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let lib_path = dir.join(format!("{}.{}", name, extension));
            if !lib_path.exists() {
                continue;
            }

            match loader.load_shared(&lib_path) {
                Ok(handle) => {
                    tracing::info!(
                        library = %name,
                        version = handle.version().unwrap_or("unknown"),
                        "Loaded shared library"
                    );
                    set.insert(SharedLibraryRecord::new(name, handle));
                }
                Err(e) => {
                    tracing::error!(library = %name, error = %e, "Failed to load shared library");
                }
            }
        }

        Ok(set)
    }

    /// Append a record. Earlier records win lookups on duplicate names.
    pub fn insert(&mut self, record: SharedLibraryRecord) {
        self.records.push(Arc::new(record));
    }

    /// First library registered under `name`.
    pub fn resolve(&self, name: &str) -> Option<Arc<SharedLibraryRecord>> {
        self.records.iter().find(|r| r.name == name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
