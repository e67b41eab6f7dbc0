//! In-memory hierarchical file.
//!
//! Keeps the complete group/field/attribute/link model in memory. The tree is
//! shared with any number of [`MemoryFileView`]s so tests and tools can inspect
//! what was written, before or after the file is closed. When persistence is
//! enabled, closing the file writes the tree as pretty-printed JSON to the
//! file path.

use super::{FieldSpec, NexusFile, NexusPath};
use crate::data::{DataHolder, ElementType, Value};
use crate::error::{WriterError, WriterResult};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// One object of the in-memory tree.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryNode {
    /// Group with its children
    Group {
        /// `NX_class` of the group
        nx_class: String,
        /// Attributes by name
        attributes: BTreeMap<String, DataHolder>,
        /// Children by name
        children: BTreeMap<String, MemoryNode>,
    },
    /// Field with its stored data
    Field {
        /// Declared layout
        spec: FieldSpec,
        /// Stored data, `None` until the first write
        data: Option<StoredField>,
        /// Attributes by name
        attributes: BTreeMap<String, DataHolder>,
    },
    /// Symbolic link
    Link {
        /// Absolute target path
        target: String,
    },
}

impl MemoryNode {
    fn group(nx_class: &str) -> Self {
        MemoryNode::Group {
            nx_class: nx_class.to_string(),
            attributes: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }
}

/// Data stored in a field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredField {
    /// Element type of `values`
    pub element_type: ElementType,
    /// Full stored shape; growing fields carry the step count first
    pub shape: Vec<usize>,
    /// Flattened values in row-major order
    pub values: Vec<Value>,
}

impl StoredField {
    /// All values as `f64`, skipping non-numeric ones.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.values.iter().filter_map(Value::as_f64).collect()
    }

    /// Number of appended steps for a growing field.
    pub fn steps(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }
}

/// Read-only window onto a memory file's tree.
#[derive(Debug, Clone)]
pub struct MemoryFileView {
    root: Arc<RwLock<MemoryNode>>,
}

impl MemoryFileView {
    fn read(&self) -> WriterResult<RwLockReadGuard<'_, MemoryNode>> {
        self.root
            .read()
            .map_err(|_| WriterError::Internal("memory file lock poisoned".into()))
    }

    /// Look up an object, following links once.
    pub fn node(&self, path: &str) -> Option<MemoryNode> {
        let path: NexusPath = path.parse().ok()?;
        let guard = self.read().ok()?;
        let node = lookup(&guard, &path)?.clone();
        match node {
            MemoryNode::Link { target } => {
                let target: NexusPath = target.parse().ok()?;
                lookup(&guard, &target).cloned()
            }
            other => Some(other),
        }
    }

    /// True when a group exists at `path`.
    pub fn has_group(&self, path: &str) -> bool {
        matches!(self.node(path), Some(MemoryNode::Group { .. }))
    }

    /// True when a field exists at `path` (with or without data).
    pub fn has_field(&self, path: &str) -> bool {
        matches!(self.node(path), Some(MemoryNode::Field { .. }))
    }

    /// Stored data of the field at `path`.
    pub fn field(&self, path: &str) -> Option<StoredField> {
        match self.node(path)? {
            MemoryNode::Field { data, .. } => data,
            _ => None,
        }
    }

    /// Attribute `name` on the group or field at `owner`.
    pub fn attribute(&self, owner: &str, name: &str) -> Option<DataHolder> {
        match self.node(owner)? {
            MemoryNode::Group { attributes, .. } | MemoryNode::Field { attributes, .. } => {
                attributes.get(name).cloned()
            }
            MemoryNode::Link { .. } => None,
        }
    }

    /// Target of the link at `path`, without following it.
    pub fn link_target(&self, path: &str) -> Option<String> {
        let path: NexusPath = path.parse().ok()?;
        let guard = self.read().ok()?;
        match lookup(&guard, &path)? {
            MemoryNode::Link { target } => Some(target.clone()),
            _ => None,
        }
    }

    /// Names of the children of the group at `path`.
    pub fn children(&self, path: &str) -> Vec<String> {
        match self.node(path) {
            Some(MemoryNode::Group { children, .. }) => children.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// JSON rendering of the whole tree.
    pub fn to_json(&self) -> WriterResult<serde_json::Value> {
        let guard = self.read()?;
        Ok(serde_json::to_value(&*guard)?)
    }
}

/// In-memory implementation of [`NexusFile`].
pub struct MemoryNexusFile {
    path: PathBuf,
    root: Arc<RwLock<MemoryNode>>,
    persist: bool,
    closed: bool,
}

impl MemoryNexusFile {
    /// Create an empty file rooted at an `NXroot` group.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            root: Arc::new(RwLock::new(MemoryNode::group("NXroot"))),
            persist: false,
            closed: false,
        }
    }

    /// Write the tree as JSON to the file path on close.
    pub fn with_persistence(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Shared inspection handle.
    pub fn view(&self) -> MemoryFileView {
        MemoryFileView {
            root: self.root.clone(),
        }
    }

    fn write(&self) -> WriterResult<RwLockWriteGuard<'_, MemoryNode>> {
        if self.closed {
            return Err(WriterError::Storage(format!(
                "file '{}' is closed",
                self.path.display()
            )));
        }
        self.root
            .write()
            .map_err(|_| WriterError::Internal("memory file lock poisoned".into()))
    }

    fn insert_child(&mut self, path: &NexusPath, node: MemoryNode) -> WriterResult<()> {
        let name = path
            .name()
            .ok_or_else(|| WriterError::Storage("cannot replace the root group".into()))?
            .to_string();
        let parent = path.parent().unwrap_or_default();
        let mut guard = self.write()?;
        match lookup_mut(&mut guard, &parent) {
            Some(MemoryNode::Group { children, .. }) => {
                children.entry(name).or_insert(node);
                Ok(())
            }
            _ => Err(WriterError::Storage(format!("parent group '{parent}' does not exist"))),
        }
    }

    fn with_field<R>(
        &mut self,
        path: &NexusPath,
        f: impl FnOnce(&FieldSpec, &mut Option<StoredField>) -> WriterResult<R>,
    ) -> WriterResult<R> {
        let mut guard = self.write()?;
        match lookup_mut(&mut guard, path) {
            Some(MemoryNode::Field { spec, data, .. }) => f(spec, data),
            _ => Err(WriterError::Storage(format!("no field at '{path}'"))),
        }
    }
}

impl NexusFile for MemoryNexusFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn create_group(&mut self, path: &NexusPath, nx_class: &str) -> WriterResult<()> {
        if path.is_root() {
            return Ok(());
        }
        self.insert_child(path, MemoryNode::group(nx_class))
    }

    fn create_field(&mut self, path: &NexusPath, spec: &FieldSpec) -> WriterResult<()> {
        self.insert_child(
            path,
            MemoryNode::Field {
                spec: spec.clone(),
                data: None,
                attributes: BTreeMap::new(),
            },
        )
    }

    fn write_field(&mut self, path: &NexusPath, value: &DataHolder) -> WriterResult<()> {
        let display = path.to_string();
        self.with_field(path, |spec, data| {
            let value = cast_for(spec.element_type, value, &display)?;
            *data = Some(StoredField {
                element_type: value.element_type(),
                shape: value.shape().to_vec(),
                values: value.values().to_vec(),
            });
            Ok(())
        })
    }

    fn append_field(&mut self, path: &NexusPath, value: &DataHolder) -> WriterResult<()> {
        let display = path.to_string();
        self.with_field(path, |spec, data| {
            let value = cast_for(spec.element_type, value, &display)?;
            match data {
                Some(stored) => {
                    if &stored.shape[1..] != value.shape() {
                        return Err(WriterError::ShapeMismatch {
                            path: display,
                            declared: stored.shape[1..].to_vec(),
                            actual: value.shape().to_vec(),
                        });
                    }
                    stored.shape[0] += 1;
                    stored.values.extend(value.values().iter().cloned());
                }
                None => {
                    let mut shape = vec![1];
                    shape.extend_from_slice(value.shape());
                    *data = Some(StoredField {
                        element_type: value.element_type(),
                        shape,
                        values: value.values().to_vec(),
                    });
                }
            }
            Ok(())
        })
    }

    fn write_attribute(
        &mut self,
        owner: &NexusPath,
        name: &str,
        value: &DataHolder,
    ) -> WriterResult<()> {
        let mut guard = self.write()?;
        match lookup_mut(&mut guard, owner) {
            Some(MemoryNode::Group { attributes, .. } | MemoryNode::Field { attributes, .. }) => {
                attributes.insert(name.to_string(), value.clone());
                Ok(())
            }
            _ => Err(WriterError::Storage(format!(
                "cannot attach attribute '{name}' to '{owner}'"
            ))),
        }
    }

    fn create_link(&mut self, path: &NexusPath, target: &NexusPath) -> WriterResult<()> {
        self.insert_child(
            path,
            MemoryNode::Link {
                target: target.to_string(),
            },
        )
    }

    fn flush(&mut self) -> WriterResult<()> {
        if self.persist {
            let guard = self.write()?;
            let json = serde_json::to_string_pretty(&*guard)?;
            drop(guard);
            std::fs::write(&self.path, json)?;
            debug!(path = %self.path.display(), "memory file persisted");
        }
        Ok(())
    }

    fn close(&mut self) -> WriterResult<()> {
        self.flush()?;
        self.closed = true;
        Ok(())
    }
}

fn cast_for(target: ElementType, value: &DataHolder, path: &str) -> WriterResult<DataHolder> {
    value
        .clone()
        .cast(target)
        .map_err(|e| WriterError::Storage(format!("cannot store value at '{path}': {e}")))
}

fn lookup<'a>(root: &'a MemoryNode, path: &NexusPath) -> Option<&'a MemoryNode> {
    path.components()
        .iter()
        .try_fold(root, |node, part| match node {
            MemoryNode::Group { children, .. } => children.get(part),
            _ => None,
        })
}

fn lookup_mut<'a>(root: &'a mut MemoryNode, path: &NexusPath) -> Option<&'a mut MemoryNode> {
    path.components()
        .iter()
        .try_fold(root, |node, part| match node {
            MemoryNode::Group { children, .. } => children.get_mut(part),
            _ => None,
        })
}
