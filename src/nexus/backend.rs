//! File backend factory with automatic feature-based registration.
use super::memory::{MemoryFileView, MemoryNexusFile};
use super::NexusFile;
use crate::error::{WriterError, WriterResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Creates hierarchical files of one storage format.
pub trait FileBackend: Send + Sync {
    /// Backend identifier (e.g. "memory", "hdf5").
    fn name(&self) -> &str;

    /// Create a new file at `path`.
    ///
    /// Fails when the file exists and `overwrite` is false.
    fn create(&self, path: &Path, overwrite: bool) -> WriterResult<Box<dyn NexusFile>>;
}

/// In-memory backend.
///
/// Non-persistent backends keep every created file reachable through
/// [`MemoryBackend::view`], which is how tests inspect what the engine wrote
/// after the file is closed. Persistent backends keep nothing once a file is
/// handed out: the JSON dump on disk is the record.
#[derive(Default)]
pub struct MemoryBackend {
    persist: bool,
    opened: Mutex<HashMap<PathBuf, MemoryFileView>>,
}

impl MemoryBackend {
    /// Backend keeping files in memory only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that dumps each file as JSON to its path when closed.
    ///
    /// Used by the registry, so long-running writers do not accumulate views.
    pub fn persistent() -> Self {
        Self {
            persist: true,
            ..Self::default()
        }
    }

    /// Inspection handle for the most recent file created at `path`.
    pub fn view(&self, path: impl AsRef<Path>) -> Option<MemoryFileView> {
        self.opened.lock().ok()?.get(path.as_ref()).cloned()
    }
}

impl FileBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn create(&self, path: &Path, overwrite: bool) -> WriterResult<Box<dyn NexusFile>> {
        let mut opened = self
            .opened
            .lock()
            .map_err(|_| WriterError::Internal("memory backend lock poisoned".into()))?;
        let exists = if self.persist {
            path.exists()
        } else {
            opened.contains_key(path)
        };
        if exists && !overwrite {
            return Err(WriterError::Storage(format!(
                "file '{}' already exists",
                path.display()
            )));
        }
        let file = MemoryNexusFile::new(path).with_persistence(self.persist);
        if !self.persist {
            opened.insert(path.to_path_buf(), file.view());
        }
        Ok(Box::new(file))
    }
}

/// Registry for file backends.
///
/// The registry automatically registers available backends based on enabled
/// Cargo features:
/// - always → `memory`
/// - `storage_hdf5` → `hdf5`
///
/// # Examples
///
/// ```
/// use nexus_writer::nexus::backend::BackendRegistry;
///
/// let registry = BackendRegistry::new();
/// assert!(registry.is_available("memory"));
/// let backend = registry.get("memory")?;
/// assert_eq!(backend.name(), "memory");
/// # Ok::<(), nexus_writer::error::WriterError>(())
/// ```
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn FileBackend>>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    /// Creates a new registry and registers every compiled-in backend.
    pub fn new() -> Self {
        let mut registry = Self {
            backends: HashMap::new(),
        };

        registry.register(Arc::new(MemoryBackend::persistent()));

        #[cfg(feature = "storage_hdf5")]
        registry.register(Arc::new(super::hdf5::Hdf5Backend));

        registry
    }

    /// Registers (or replaces) a backend under its own name.
    pub fn register(&mut self, backend: Arc<dyn FileBackend>) {
        info!(backend = backend.name(), "file backend registered");
        self.backends.insert(backend.name().to_string(), backend);
    }

    /// Looks up a backend by name.
    ///
    /// # Errors
    ///
    /// Returns `SettingsValidation` if the backend is not registered (feature not
    /// enabled or unknown name).
    pub fn get(&self, name: &str) -> WriterResult<Arc<dyn FileBackend>> {
        self.backends.get(name).cloned().ok_or_else(|| {
            let available = self.list_backends().join(", ");
            WriterError::SettingsValidation(format!(
                "Unsupported storage backend: '{name}'. Available backends: [{available}]"
            ))
        })
    }

    /// Sorted names of all registered backends.
    pub fn list_backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Checks if a specific backend is available.
    pub fn is_available(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }
}
