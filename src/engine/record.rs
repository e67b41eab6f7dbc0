//! JSON payloads accepted by `setJSONRecord`, `record` and `closeEntry`.

use crate::error::WriterResult;
use crate::sources::CompileOverrides;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Parsed client payload.
///
/// Recognized top-level keys are `data`, `triggers`, `decoders` and
/// `datasources`; anything else is ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RecordPayload {
    /// Client key → value, consumed by CLIENT sources
    pub data: Map<String, Value>,
    /// Events fired by this record
    pub triggers: Vec<String>,
    /// Symbolic decoder name → registered decoder
    pub decoders: HashMap<String, String>,
    /// Symbolic datasource type → variant name
    pub datasources: HashMap<String, String>,
}

impl RecordPayload {
    /// Parse a payload. Empty or whitespace-only text is an empty payload.
    pub fn parse(json: &str) -> WriterResult<Self> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(json)?)
    }

    /// Compile-time overrides carried by this payload.
    pub fn overrides(&self) -> CompileOverrides {
        CompileOverrides {
            decoders: self.decoders.clone(),
            datasources: self.datasources.clone(),
        }
    }
}
