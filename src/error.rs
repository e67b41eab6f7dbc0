//! Custom error types for the writer.
//!
//! This module defines the primary error type, `WriterError`, for the whole crate.
//! Using the `thiserror` crate, it gives every layer (configuration compiler,
//! data sources, file backends, phase runner and engine) one consistent error
//! vocabulary.
//!
//! ## Error Hierarchy
//!
//! - **`ConfigSyntax`**: malformed or semantically invalid XML configuration
//!   (tag mismatch, unknown data source variant, unregistered decoder). Fatal
//!   to `open_file`; the engine stays `Ready`.
//! - **`SourceUnavailable`** / **`SourceFormat`**: a data source could not be
//!   reached, or returned something that cannot be classified as
//!   SCALAR/SPECTRUM/IMAGE. Scoped to a single writer node task.
//! - **`ShapeMismatch`** / **`DetachedNode`**: a node could not store its value.
//!   Also scoped to a single task.
//! - **`PhaseFailed`**: aggregate of the per-node failures of one phase.
//! - **`IllegalState`**: operation attempted out of sequence. No side effects.
//! - **`Storage`**, **`Io`**, **`Json`**, **`Settings`**, **`Internal`**:
//!   ambient failures. Storage, I/O and internal failures on the file itself
//!   (outside node tasks) move the engine to `Fault`.

use crate::engine::state::LifecycleState;
use crate::runner::Phase;
use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the writer error type.
pub type WriterResult<T> = std::result::Result<T, WriterError>;

/// Failure of one writer node inside a phase.
#[derive(Debug, Clone)]
pub struct NodeFailure {
    /// File path of the node that failed (e.g. `/entry/instrument/counter`)
    pub node: String,
    /// Rendered error message
    pub message: String,
    /// Error category, kept so callers can filter without parsing messages
    pub kind: FailureKind,
}

/// Category of a per-node failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Endpoint unreachable, timed out, or device-level error
    SourceUnavailable,
    /// Payload could not be classified
    SourceFormat,
    /// Declared shape disagrees with the read value
    ShapeMismatch,
    /// Node has no live file handle
    DetachedNode,
    /// Backend rejected the write
    Storage,
    /// Task panicked or was cancelled
    Internal,
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.node, self.message)
    }
}

/// Error type shared by every layer of the writer.
#[derive(Error, Debug)]
pub enum WriterError {
    /// Malformed or semantically invalid XML configuration
    #[error("Configuration syntax error: {0}")]
    ConfigSyntax(String),

    /// Source endpoint unreachable or timed out
    #[error("Data source '{source_name}' unavailable: {reason}")]
    SourceUnavailable {
        /// Source description
        source_name: String,
        /// Failure reason
        reason: String,
    },

    /// Source payload cannot be classified or converted
    #[error("Data source '{source_name}' returned an unclassifiable payload: {reason}")]
    SourceFormat {
        /// Source description
        source_name: String,
        /// Failure reason
        reason: String,
    },

    /// Declared shape disagrees with the value read
    #[error("Shape mismatch at '{path}': declared {declared:?}, got {actual:?}")]
    ShapeMismatch {
        /// Node label
        path: String,
        /// Declared shape
        declared: Vec<usize>,
        /// Shape of the value
        actual: Vec<usize>,
    },

    /// Node has no live file handle
    #[error("Node '{0}' is not attached to an open file")]
    DetachedNode(String),

    /// Operation attempted out of lifecycle order
    #[error("Operation '{operation}' is illegal in state {state}")]
    IllegalState {
        /// Rejected operation
        operation: &'static str,
        /// Engine state at the time
        state: LifecycleState,
    },

    /// One or more nodes of a phase failed
    #[error("{phase} phase failed for {} node(s): {}", .failures.len(), join_failures(.failures))]
    PhaseFailed {
        /// Phase that ran
        phase: Phase,
        /// Per-node failures, sorted by node label
        failures: Vec<NodeFailure>,
    },

    /// File backend rejected an operation
    #[error("Storage error: {0}")]
    Storage(String),

    /// Settings could not be loaded
    #[error("Settings error: {0}")]
    Settings(#[from] Box<figment::Error>),

    /// Settings loaded but are invalid
    #[error("Settings validation error: {0}")]
    SettingsValidation(String),

    /// Filesystem or process I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON record could not be parsed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invariant violated inside the writer
    #[error("Internal error: {0}")]
    Internal(String),
}

fn join_failures(failures: &[NodeFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<figment::Error> for WriterError {
    fn from(value: figment::Error) -> Self {
        WriterError::Settings(Box::new(value))
    }
}

impl From<quick_xml::Error> for WriterError {
    fn from(value: quick_xml::Error) -> Self {
        WriterError::ConfigSyntax(format!("XML is not well-formed: {value}"))
    }
}

impl WriterError {
    /// Shorthand for an unreachable source.
    pub fn unavailable(source_name: impl Into<String>, reason: impl fmt::Display) -> Self {
        WriterError::SourceUnavailable {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for an unclassifiable payload.
    pub fn format(source_name: impl Into<String>, reason: impl fmt::Display) -> Self {
        WriterError::SourceFormat {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors that leave the file in an unknown condition and move the engine to `Fault`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WriterError::Storage(_) | WriterError::Io(_) | WriterError::Internal(_)
        )
    }

    /// Category used when this error is captured as a [`NodeFailure`].
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            WriterError::SourceUnavailable { .. } => FailureKind::SourceUnavailable,
            WriterError::SourceFormat { .. } => FailureKind::SourceFormat,
            WriterError::ShapeMismatch { .. } => FailureKind::ShapeMismatch,
            WriterError::DetachedNode(_) => FailureKind::DetachedNode,
            WriterError::Storage(_) | WriterError::Io(_) => FailureKind::Storage,
            _ => FailureKind::Internal,
        }
    }

    /// Per-node failures carried by a `PhaseFailed` error, empty otherwise.
    pub fn node_failures(&self) -> &[NodeFailure] {
        match self {
            WriterError::PhaseFailed { failures, .. } => failures,
            _ => &[],
        }
    }
}
