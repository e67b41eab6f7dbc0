//! # NeXus Writer Library
//!
//! Configuration-driven writer turning live acquisition data into NeXus
//! (HDF5) files. An XML descriptor is compiled once per file into a tree of
//! writer nodes, each bound to a data source and a trigger phase; the engine
//! then reads all bound sources of a phase concurrently and stores their
//! values at the matching location of the file.
//!
//! ## Crate Structure
//!
//! - **`compiler`**: streaming XML → [`tree::WriterTree`] compiler with phase partitions.
//! - **`config`**: layered settings (TOML file + `NXSWRITER_` environment).
//! - **`data`**: [`data::DataHolder`], the SCALAR/SPECTRUM/IMAGE value container.
//! - **`engine`**: [`engine::WriterEngine`] and its lifecycle state machine.
//! - **`error`**: the [`error::WriterError`] taxonomy.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`nexus`**: the hierarchical file interface and its backends.
//! - **`runner`**: concurrent phase execution and failure aggregation.
//! - **`sources`**: data source variants, decoders and their registry.
//! - **`tree`**: compiled writer nodes and `store()`.

pub mod compiler;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod logging;
pub mod nexus;
pub mod runner;
pub mod sources;
pub mod tree;

pub use engine::{LifecycleState, WriterEngine};
pub use error::{WriterError, WriterResult};
