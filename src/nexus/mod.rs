//! Hierarchical file model (NeXus groups, fields, attributes and links).
//!
//! The writer never encodes bytes itself: it drives a [`NexusFile`], a small
//! object-safe trait implemented by the in-memory backend (always available)
//! and by the HDF5 backend (feature `storage_hdf5`). Backends are created
//! through [`backend::BackendRegistry`].
//!
//! All methods are synchronous and are only ever called while the engine-wide
//! write lock is held, so implementations do not need internal locking for
//! mutation.

pub mod backend;
#[cfg(feature = "storage_hdf5")]
pub mod hdf5;
pub mod memory;

use crate::data::{DataHolder, ElementType};
use crate::error::{WriterError, WriterResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared, lock-guarded handle to the open file.
///
/// The mutex is the single engine-wide write lock: every file-mutating call
/// goes through it, reads from data sources never do.
pub type FileHandle = Arc<Mutex<Box<dyn NexusFile>>>;

/// Absolute path inside the hierarchical file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NexusPath(Vec<String>);

impl NexusPath {
    /// The root group.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Child path `self/name`.
    pub fn join(&self, name: &str) -> Self {
        let mut parts = self.0.clone();
        parts.push(name.to_string());
        Self(parts)
    }

    /// Parent path, `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Last component, `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Path components from the root.
    pub fn components(&self) -> &[String] {
        &self.0
    }

    /// True for the root group.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NexusPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for part in &self.0 {
            write!(f, "/{part}")?;
        }
        Ok(())
    }
}

impl FromStr for NexusPath {
    type Err = WriterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // NeXus link targets may carry ":NXclass" suffixes; only the name is a path component.
        let parts = s
            .split('/')
            .filter(|p| !p.is_empty())
            .map(|p| p.split(':').next().unwrap_or(p).to_string())
            .collect::<Vec<_>>();
        if parts.iter().any(String::is_empty) {
            return Err(WriterError::ConfigSyntax(format!("invalid path '{s}'")));
        }
        Ok(Self(parts))
    }
}

/// Layout of a field as declared by the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Element type of the stored values
    pub element_type: ElementType,
    /// Declared per-write shape; `None` lets the first write decide
    pub shape: Option<Vec<usize>>,
    /// Field grows by one slab per acquisition step
    pub growing: bool,
}

/// Object-safe interface to a hierarchical file.
pub trait NexusFile: Send + Sync {
    /// Location of the file on disk.
    fn path(&self) -> &Path;

    /// Create a group. The parent must exist. Creating an existing group is a no-op.
    fn create_group(&mut self, path: &NexusPath, nx_class: &str) -> WriterResult<()>;

    /// Create an empty field. The parent group must exist.
    fn create_field(&mut self, path: &NexusPath, spec: &FieldSpec) -> WriterResult<()>;

    /// Replace the value of a non-growing field.
    fn write_field(&mut self, path: &NexusPath, value: &DataHolder) -> WriterResult<()>;

    /// Append one step slab to a growing field.
    ///
    /// Fails with `ShapeMismatch` when the slab shape differs from earlier slabs.
    fn append_field(&mut self, path: &NexusPath, value: &DataHolder) -> WriterResult<()>;

    /// Write (or overwrite) an attribute on a group or field.
    fn write_attribute(
        &mut self,
        owner: &NexusPath,
        name: &str,
        value: &DataHolder,
    ) -> WriterResult<()>;

    /// Create a symbolic link at `path` pointing to `target`.
    fn create_link(&mut self, path: &NexusPath, target: &NexusPath) -> WriterResult<()>;

    /// Push buffered data to storage.
    fn flush(&mut self) -> WriterResult<()>;

    /// Flush and release the file. Further calls fail.
    fn close(&mut self) -> WriterResult<()>;
}
