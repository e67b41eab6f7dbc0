//! Client-pushed values and the per-phase read context.

use super::DataSource;
use crate::data::DataHolder;
use crate::error::{WriterError, WriterResult};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Snapshot of the client data visible to one phase execution.
///
/// Local data (the payload of the current record/openEntry/closeEntry call)
/// shadows global data (set once with `setJSONRecord`).
#[derive(Debug, Clone, Default)]
pub struct ReadContext {
    global: Map<String, Value>,
    local: Map<String, Value>,
    triggers: HashSet<String>,
}

impl ReadContext {
    /// Build a context from the `data` maps of the global and local payloads.
    pub fn new(
        global: Map<String, Value>,
        local: Map<String, Value>,
        triggers: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            global,
            local,
            triggers: triggers.into_iter().collect(),
        }
    }

    /// Value pushed for `key`, local first.
    pub fn lookup(&self, key: &str) -> Option<&Value> {
        self.local.get(key).or_else(|| self.global.get(key))
    }

    /// True when the current record fired `name`.
    pub fn has_trigger(&self, name: &str) -> bool {
        self.triggers.contains(name)
    }

    /// Scalar client values rendered as strings, for query templates.
    pub fn parameters(&self) -> HashMap<String, String> {
        let mut params = HashMap::new();
        for (key, value) in self.global.iter().chain(self.local.iter()) {
            let rendered = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => continue,
            };
            params.insert(key.clone(), rendered);
        }
        params
    }
}

/// Reads the value pushed for one client key.
#[derive(Debug, Clone)]
pub struct ClientSource {
    key: String,
}

impl ClientSource {
    /// Source reading client key `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// The client key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl DataSource for ClientSource {
    fn describe(&self) -> String {
        format!("CLIENT:{}", self.key)
    }

    async fn read(&self, ctx: &ReadContext) -> WriterResult<Option<DataHolder>> {
        let Some(value) = ctx.lookup(&self.key) else {
            return Ok(None);
        };
        DataHolder::from_json(value)
            .map(Some)
            .map_err(|e| WriterError::format(self.describe(), e))
    }
}
