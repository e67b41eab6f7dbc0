//! Data sources bound to writer nodes.
//!
//! A [`DataSource`] produces one [`DataHolder`] per read. Four variants exist:
//!
//! - [`client::ClientSource`]: values pushed by the caller with each record
//! - [`device::DeviceSource`]: attribute read on a remote device endpoint
//! - [`database::DatabaseSource`]: parametrized query against a named backend
//! - [`program::ProgramSource`]: raw payload run through a registered decoder
//!
//! Sources are built from the verbatim body of a `<datasource>` tag by the
//! immutable [`registry::SourceRegistry`].

pub mod client;
pub mod database;
pub mod device;
pub mod program;
pub mod registry;

pub use client::ReadContext;
pub use registry::{SourceRegistry, SourceRegistryBuilder};

use crate::data::DataHolder;
use crate::error::{WriterError, WriterResult};
use crate::runner::Phase;
use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Kind of data source a node is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceVariant {
    /// Values pushed with each record
    ClientPush,
    /// Remote device attribute
    DeviceAttribute,
    /// Database query
    DatabaseQuery,
    /// Decoder over a raw payload
    ExternalProgram,
}

impl fmt::Display for SourceVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceVariant::ClientPush => write!(f, "CLIENT"),
            SourceVariant::DeviceAttribute => write!(f, "TANGO"),
            SourceVariant::DatabaseQuery => write!(f, "DB"),
            SourceVariant::ExternalProgram => write!(f, "PROGRAM"),
        }
    }
}

impl FromStr for SourceVariant {
    type Err = WriterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CLIENT" => Ok(SourceVariant::ClientPush),
            "TANGO" | "DEVICE" => Ok(SourceVariant::DeviceAttribute),
            "DB" | "DATABASE" => Ok(SourceVariant::DatabaseQuery),
            "PROGRAM" | "DECODER" => Ok(SourceVariant::ExternalProgram),
            other => Err(WriterError::ConfigSyntax(format!(
                "unknown datasource type '{other}'"
            ))),
        }
    }
}

/// Polymorphic read capability.
#[async_trait]
pub trait DataSource: Send + Sync + fmt::Debug {
    /// Short description used in failure reports.
    fn describe(&self) -> String;

    /// Produce one value.
    ///
    /// `Ok(None)` means "no data for this phase"; the node skips its store.
    ///
    /// # Errors
    ///
    /// - `SourceUnavailable` when the endpoint cannot be reached
    /// - `SourceFormat` when the payload cannot be classified
    async fn read(&self, ctx: &ReadContext) -> WriterResult<Option<DataHolder>>;
}

/// One node's binding to a data source.
#[derive(Debug, Clone)]
pub struct Binding {
    /// Source variant after overrides
    pub variant: SourceVariant,
    /// Phase the source is read in
    pub phase: Phase,
    /// Trigger gating a STEP read, if any
    pub trigger: Option<String>,
    /// Optional name given on the `<datasource>` tag
    pub name: Option<String>,
    /// The source itself
    pub source: Arc<dyn DataSource>,
}

impl Binding {
    /// True when this binding runs for a record carrying `triggers`.
    pub fn is_triggered(&self, ctx: &ReadContext) -> bool {
        match &self.trigger {
            None => true,
            Some(name) => ctx.has_trigger(name),
        }
    }
}

/// Compile-time substitutions taken from the global client payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOverrides {
    /// Symbolic decoder name → registered decoder name
    pub decoders: HashMap<String, String>,
    /// Symbolic datasource type → variant name
    pub datasources: HashMap<String, String>,
}

impl CompileOverrides {
    /// Resolve a `<datasource type>` through the `datasources` table.
    pub fn variant(&self, declared: &str) -> WriterResult<SourceVariant> {
        match self.datasources.get(declared) {
            Some(mapped) => mapped.parse(),
            None => declared.parse(),
        }
    }

    /// Resolve a decoder name through the `decoders` table.
    pub fn decoder<'a>(&'a self, declared: &'a str) -> &'a str {
        self.decoders
            .get(declared)
            .map(String::as_str)
            .unwrap_or(declared)
    }
}

/// One element of a `<datasource>` body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BodyElement {
    /// Tag name
    pub tag: String,
    /// Attributes
    pub attributes: BTreeMap<String, String>,
    /// Concatenated, trimmed text content
    pub text: String,
}

impl BodyElement {
    /// Attribute lookup.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Required attribute lookup.
    pub fn require(&self, name: &str) -> WriterResult<&str> {
        self.attr(name).ok_or_else(|| {
            WriterError::ConfigSyntax(format!("<{}> requires attribute '{name}'", self.tag))
        })
    }
}

/// Parsed, flat view of a captured `<datasource>` body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceBody {
    elements: Vec<BodyElement>,
}

impl SourceBody {
    /// Parse the verbatim inner content of a `<datasource>` tag.
    ///
    /// Only top-level elements are kept; nested markup inside them contributes
    /// its text.
    pub fn parse(content: &str) -> WriterResult<Self> {
        let mut reader = Reader::from_str(content);
        reader.trim_text(true);
        let mut elements = Vec::new();
        let mut depth = 0usize;
        loop {
            match reader.read_event()? {
                Event::Start(start) => {
                    if depth == 0 {
                        elements.push(body_element(&start)?);
                    }
                    depth += 1;
                }
                Event::Empty(start) => {
                    if depth == 0 {
                        elements.push(body_element(&start)?);
                    }
                }
                Event::End(_) => depth = depth.saturating_sub(1),
                Event::Text(text) => {
                    let text = text.unescape()?;
                    if let (true, Some(last)) = (depth > 0, elements.last_mut()) {
                        if !last.text.is_empty() {
                            last.text.push(' ');
                        }
                        last.text.push_str(text.trim());
                    }
                }
                Event::CData(data) => {
                    if let (true, Some(last)) = (depth > 0, elements.last_mut()) {
                        last.text.push_str(&String::from_utf8_lossy(&data));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(Self { elements })
    }

    /// First element with the given tag.
    pub fn element(&self, tag: &str) -> Option<&BodyElement> {
        self.elements.iter().find(|e| e.tag == tag)
    }

    /// First element with the given tag, or a `ConfigSyntax` error naming the variant.
    pub fn require(&self, tag: &str, variant: SourceVariant) -> WriterResult<&BodyElement> {
        self.element(tag).ok_or_else(|| {
            WriterError::ConfigSyntax(format!("{variant} datasource requires a <{tag}> element"))
        })
    }
}

fn body_element(start: &BytesStart<'_>) -> WriterResult<BodyElement> {
    let tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = BTreeMap::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| WriterError::ConfigSyntax(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attributes.insert(key, value);
    }
    Ok(BodyElement {
        tag,
        attributes,
        text: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_aliases() {
        assert_eq!("client".parse::<SourceVariant>().unwrap(), SourceVariant::ClientPush);
        assert_eq!("DEVICE".parse::<SourceVariant>().unwrap(), SourceVariant::DeviceAttribute);
        assert_eq!("Tango".parse::<SourceVariant>().unwrap(), SourceVariant::DeviceAttribute);
        assert_eq!("DATABASE".parse::<SourceVariant>().unwrap(), SourceVariant::DatabaseQuery);
        assert_eq!("DECODER".parse::<SourceVariant>().unwrap(), SourceVariant::ExternalProgram);
        assert!(matches!(
            "PYEVAL".parse::<SourceVariant>(),
            Err(WriterError::ConfigSyntax(_))
        ));
    }

    #[test]
    fn overrides_remap_types_and_decoders() {
        let overrides = CompileOverrides {
            decoders: HashMap::from([("LIMA".to_string(), "VIDEO_IMAGE".to_string())]),
            datasources: HashMap::from([("MYDB".to_string(), "DB".to_string())]),
        };
        assert_eq!(overrides.variant("MYDB").unwrap(), SourceVariant::DatabaseQuery);
        assert_eq!(overrides.variant("CLIENT").unwrap(), SourceVariant::ClientPush);
        assert_eq!(overrides.decoder("LIMA"), "VIDEO_IMAGE");
        assert_eq!(overrides.decoder("json"), "json");
    }

    #[test]
    fn parses_body_elements() {
        let body = SourceBody::parse(
            r#"<database dbname="mydb"/>
               <query format="SPECTRUM">SELECT x FROM t WHERE id = {scan_id}</query>"#,
        )
        .unwrap();
        assert_eq!(body.element("database").unwrap().attr("dbname"), Some("mydb"));
        let query = body.element("query").unwrap();
        assert_eq!(query.attr("format"), Some("SPECTRUM"));
        assert_eq!(query.text, "SELECT x FROM t WHERE id = {scan_id}");
        assert!(body.require("device", SourceVariant::DeviceAttribute).is_err());
    }
}
