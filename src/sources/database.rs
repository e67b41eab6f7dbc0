//! Parametrized database queries.

use super::{DataSource, ReadContext};
use crate::data::{DataFormat, DataHolder, Value};
use crate::error::{WriterError, WriterResult};
use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Rows returned by a query, each a list of cells.
pub type Rows = Vec<Vec<serde_json::Value>>;

/// Black-box query execution against one named database.
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// Run `query` and return the full result set.
    async fn query(&self, query: &str) -> anyhow::Result<Rows>;
}

/// Database answering a fixed set of queries from memory.
#[derive(Debug, Default, Clone)]
pub struct StaticDatabase {
    results: HashMap<String, Rows>,
}

impl StaticDatabase {
    /// Database with no known queries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Database serving the given query → rows table.
    pub fn from_table(results: HashMap<String, Rows>) -> Self {
        Self {
            results: results
                .into_iter()
                .map(|(q, rows)| (normalize(&q), rows))
                .collect(),
        }
    }

    /// Add an answer for `query`.
    pub fn with(mut self, query: &str, rows: Rows) -> Self {
        self.results.insert(normalize(query), rows);
        self
    }
}

fn normalize(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl DatabaseBackend for StaticDatabase {
    async fn query(&self, query: &str) -> anyhow::Result<Rows> {
        self.results
            .get(&normalize(query))
            .cloned()
            .ok_or_else(|| anyhow!("no result for query '{query}'"))
    }
}

/// Runs a query template and shapes the result set.
#[derive(Clone)]
pub struct DatabaseSource {
    dbname: String,
    template: String,
    format: DataFormat,
    backend: Option<Arc<dyn DatabaseBackend>>,
}

impl fmt::Debug for DatabaseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSource")
            .field("dbname", &self.dbname)
            .field("template", &self.template)
            .field("format", &self.format)
            .field("connected", &self.backend.is_some())
            .finish()
    }
}

impl DatabaseSource {
    /// Source running `template` on `dbname`.
    ///
    /// A missing backend is reported at read time, like an unreachable server.
    pub fn new(
        dbname: impl Into<String>,
        template: impl Into<String>,
        format: DataFormat,
        backend: Option<Arc<dyn DatabaseBackend>>,
    ) -> Self {
        Self {
            dbname: dbname.into(),
            template: template.into(),
            format,
            backend,
        }
    }

    fn render(&self, ctx: &ReadContext) -> WriterResult<String> {
        if !self.template.contains('{') {
            return Ok(self.template.clone());
        }
        strfmt::strfmt(&self.template, &ctx.parameters())
            .map_err(|e| WriterError::unavailable(self.describe(), format!("query template: {e}")))
    }
}

#[async_trait]
impl DataSource for DatabaseSource {
    fn describe(&self) -> String {
        format!("DB:{}", self.dbname)
    }

    async fn read(&self, ctx: &ReadContext) -> WriterResult<Option<DataHolder>> {
        let backend = self.backend.as_ref().ok_or_else(|| {
            WriterError::unavailable(self.describe(), "database is not configured")
        })?;
        let query = self.render(ctx)?;
        let rows = backend
            .query(&query)
            .await
            .map_err(|e| WriterError::unavailable(self.describe(), format!("{e:#}")))?;
        shape_rows(rows, self.format)
            .map(Some)
            .map_err(|reason| WriterError::format(self.describe(), reason))
    }
}

/// Coerce a result set into the requested format.
///
/// - SCALAR: first cell of the first row
/// - SPECTRUM: the single row if only one row came back, else the first column
/// - IMAGE: the full row/column grid
pub fn shape_rows(rows: Rows, format: DataFormat) -> Result<DataHolder, String> {
    let first = rows
        .first()
        .and_then(|row| row.first())
        .ok_or_else(|| "empty result set".to_string())?;
    let cell = |v: &serde_json::Value| {
        Value::from_json(v).ok_or_else(|| format!("unsupported cell value {v}"))
    };
    match format {
        DataFormat::Scalar => Ok(DataHolder::scalar(cell(first)?)),
        DataFormat::Spectrum => {
            let values = if rows.len() == 1 {
                rows[0].iter().map(cell).collect::<Result<Vec<_>, _>>()?
            } else {
                rows.iter()
                    .map(|row| row.first().ok_or_else(|| "empty row".to_string()).and_then(cell))
                    .collect::<Result<Vec<_>, _>>()?
            };
            DataHolder::spectrum(values).map_err(|e| e.to_string())
        }
        DataFormat::Image => {
            let grid = rows
                .iter()
                .map(|row| row.iter().map(cell).collect::<Result<Vec<_>, _>>())
                .collect::<Result<Vec<_>, _>>()?;
            DataHolder::image(grid).map_err(|e| e.to_string())
        }
    }
}
