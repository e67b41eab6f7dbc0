//! Writer lifecycle state.
//!
//! Guards which engine operations are legal at any moment. The state is
//! published through a `tokio::sync::watch` channel so remote callers (and the
//! asynchronous operation variants) observe every transition.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`WriterEngine`](super::WriterEngine).
///
/// # State Machine
///
/// ```text
/// NotInitialized ──initialize──> Ready ──openFile──> FileOpen ──openEntry──> EntryOpen
///                                  ▲                   │  ▲                     │  ▲
///                                  └─────closeFile─────┘  └─────closeEntry──────┘  │record
///                                                                                  │
///                                                             EntryOpen ──> Writing┘
///
/// any ──fatal error──> Fault ──initialize──> Ready
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Engine created, `initialize` not called yet
    NotInitialized,
    /// Accepting configuration, no file open
    Ready,
    /// File open and structure materialized, no entry open
    FileOpen,
    /// Entry open, accepting records
    EntryOpen,
    /// A phase is executing
    Writing,
    /// Unrecoverable error; only `initialize` is accepted
    Fault,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::NotInitialized => write!(f, "NotInitialized"),
            LifecycleState::Ready => write!(f, "Ready"),
            LifecycleState::FileOpen => write!(f, "FileOpen"),
            LifecycleState::EntryOpen => write!(f, "EntryOpen"),
            LifecycleState::Writing => write!(f, "Writing"),
            LifecycleState::Fault => write!(f, "Fault"),
        }
    }
}

impl LifecycleState {
    /// `initialize` is accepted before first use and as the reset out of `Fault`.
    pub fn can_initialize(&self) -> bool {
        matches!(self, LifecycleState::NotInitialized | LifecycleState::Fault)
    }

    /// Configuration and file name may change only while no file is open.
    pub fn can_configure(&self) -> bool {
        matches!(self, LifecycleState::Ready)
    }

    /// Check if the state allows opening a file.
    pub fn can_open_file(&self) -> bool {
        matches!(self, LifecycleState::Ready)
    }

    /// Check if the state allows opening an entry.
    pub fn can_open_entry(&self) -> bool {
        matches!(self, LifecycleState::FileOpen)
    }

    /// Check if the state allows recording a step.
    pub fn can_record(&self) -> bool {
        matches!(self, LifecycleState::EntryOpen)
    }

    /// Check if the state allows closing the entry.
    pub fn can_close_entry(&self) -> bool {
        matches!(self, LifecycleState::EntryOpen)
    }

    /// Check if the state allows closing the file.
    pub fn can_close_file(&self) -> bool {
        matches!(self, LifecycleState::FileOpen)
    }

    /// Global client data may be replaced any time the engine is usable.
    pub fn can_set_record(&self) -> bool {
        matches!(
            self,
            LifecycleState::Ready | LifecycleState::FileOpen | LifecycleState::EntryOpen
        )
    }

    /// Human-readable status line for remote pollers.
    pub fn status(&self) -> &'static str {
        match self {
            LifecycleState::NotInitialized => "Writer not initialized",
            LifecycleState::Ready => "Ready: waiting for a file to be opened",
            LifecycleState::FileOpen => "File open: waiting for an entry",
            LifecycleState::EntryOpen => "Entry open: accepting records",
            LifecycleState::Writing => "Writing: phase in progress",
            LifecycleState::Fault => "Fault: reinitialize the writer",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_fault_and_fresh_engines_initialize() {
        assert!(LifecycleState::NotInitialized.can_initialize());
        assert!(LifecycleState::Fault.can_initialize());
        assert!(!LifecycleState::Ready.can_initialize());
        assert!(!LifecycleState::EntryOpen.can_initialize());
    }

    #[test]
    fn fault_blocks_everything_else() {
        let fault = LifecycleState::Fault;
        assert!(!fault.can_configure());
        assert!(!fault.can_open_file());
        assert!(!fault.can_open_entry());
        assert!(!fault.can_record());
        assert!(!fault.can_close_entry());
        assert!(!fault.can_close_file());
        assert!(!fault.can_set_record());
    }

    #[test]
    fn writing_is_not_reentrant() {
        let writing = LifecycleState::Writing;
        assert!(!writing.can_record());
        assert!(!writing.can_close_entry());
        assert!(!writing.can_open_entry());
    }

    #[test]
    fn display_matches_variant_names() {
        assert_eq!(LifecycleState::EntryOpen.to_string(), "EntryOpen");
        assert!(LifecycleState::Fault.status().contains("reinitialize"));
    }
}
