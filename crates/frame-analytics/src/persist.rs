//! Checkpoint storage handles.
//!
//! A specification owns two suppliers: one producing a [`DataAdder`] that
//! stores runner state, one producing a [`DataSearcher`] that finds state to
//! restore from. The defaults store nothing and find nothing.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

/// Write side of checkpoint storage.
pub trait DataAdder: Send {
    fn add_document(&mut self, document: &str) -> Result<()>;
}

/// Read side of checkpoint storage.
pub trait DataSearcher: Send {
    /// The most recent stored document, if any.
    fn latest(&mut self) -> Result<Option<String>>;
}

pub type PersisterSupplier = Arc<dyn Fn() -> Box<dyn DataAdder> + Send + Sync>;
pub type RestoreSearcherSupplier = Arc<dyn Fn() -> Box<dyn DataSearcher> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPersister;

impl DataAdder for NoopPersister {
    fn add_document(&mut self, _document: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSearcher;

impl DataSearcher for NoopSearcher {
    fn latest(&mut self) -> Result<Option<String>> {
        Ok(None)
    }
}

pub fn noop_persister_supplier() -> PersisterSupplier {
    Arc::new(|| Box::new(NoopPersister))
}

pub fn noop_restore_searcher_supplier() -> RestoreSearcherSupplier {
    Arc::new(|| Box::new(NoopSearcher))
}

// =============================================================================
// In-memory store
// =============================================================================

/// Documents kept in memory, shared by every handle of the store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    documents: Arc<Mutex<Vec<String>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn documents(&self) -> Vec<String> {
        self.documents.lock().clone()
    }

    pub fn persister_supplier(&self) -> PersisterSupplier {
        let store = self.clone();
        Arc::new(move || Box::new(store.clone()))
    }

    pub fn restore_searcher_supplier(&self) -> RestoreSearcherSupplier {
        let store = self.clone();
        Arc::new(move || Box::new(store.clone()))
    }
}

impl DataAdder for MemoryStateStore {
    fn add_document(&mut self, document: &str) -> Result<()> {
        self.documents.lock().push(document.to_string());
        Ok(())
    }
}

impl DataSearcher for MemoryStateStore {
    fn latest(&mut self) -> Result<Option<String>> {
        Ok(self.documents.lock().last().cloned())
    }
}

// =============================================================================
// File store
// =============================================================================

/// A single state file, overwritten on every write.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store `<job_id>_state.json` in `directory`.
    pub fn in_directory(directory: impl AsRef<Path>, job_id: &str) -> Self {
        Self::new(directory.as_ref().join(format!("{job_id}_state.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn persister_supplier(&self) -> PersisterSupplier {
        let store = self.clone();
        Arc::new(move || Box::new(store.clone()))
    }

    pub fn restore_searcher_supplier(&self) -> RestoreSearcherSupplier {
        let store = self.clone();
        Arc::new(move || Box::new(store.clone()))
    }
}

impl DataAdder for FileStateStore {
    fn add_document(&mut self, document: &str) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, document)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl DataSearcher for FileStateStore {
    fn latest(&mut self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(document) => Ok(Some(document)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }
}
