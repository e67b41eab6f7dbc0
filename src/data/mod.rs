//! Value containers shared by data sources and file backends.
pub mod holder;

pub use holder::{ConversionError, DataFormat, DataHolder, ElementType, Value};
