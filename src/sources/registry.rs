//! Immutable registry of decoders, device access and databases.
//!
//! Built once at startup with [`SourceRegistryBuilder`] and shared behind an
//! `Arc`. The compiler consults it to turn each `<datasource>` body into a
//! [`DataSource`].

use super::client::ClientSource;
use super::database::{DatabaseBackend, DatabaseSource, StaticDatabase};
use super::device::{DeviceClient, DeviceEndpoint, DeviceMember, DeviceSource, StaticDeviceClient};
use super::program::{Decoder, JsonDecoder, ProgramInput, ProgramSource, Utf8Decoder, VideoImageDecoder};
use super::{CompileOverrides, DataSource, SourceBody, SourceVariant};
use crate::config::WriterSettings;
use crate::data::DataFormat;
use crate::error::{WriterError, WriterResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Read-only lookup tables used while compiling data source bindings.
pub struct SourceRegistry {
    decoders: HashMap<String, Arc<dyn Decoder>>,
    devices: Arc<dyn DeviceClient>,
    databases: HashMap<String, Arc<dyn DatabaseBackend>>,
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("decoders", &self.decoder_names())
            .field("databases", &self.databases.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        SourceRegistryBuilder::new().build()
    }
}

impl SourceRegistry {
    /// Start a registry with the built-in decoders and no devices or databases.
    pub fn builder() -> SourceRegistryBuilder {
        SourceRegistryBuilder::new()
    }

    /// Registry serving the `[devices]` and `[databases]` tables of the settings.
    pub fn from_settings(settings: &WriterSettings) -> Self {
        let mut builder = SourceRegistryBuilder::new()
            .device_client(Arc::new(StaticDeviceClient::from_table(&settings.devices)));
        for (name, queries) in &settings.databases {
            builder = builder.database(name, Arc::new(StaticDatabase::from_table(queries.clone())));
        }
        builder.build()
    }

    /// Sorted names of the registered decoders.
    pub fn decoder_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.decoders.keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up a decoder, after applying overrides.
    ///
    /// # Errors
    ///
    /// `ConfigSyntax` for an unregistered name.
    pub fn decoder(
        &self,
        name: &str,
        overrides: &CompileOverrides,
    ) -> WriterResult<Arc<dyn Decoder>> {
        let resolved = overrides.decoder(name);
        self.decoders.get(resolved).cloned().ok_or_else(|| {
            WriterError::ConfigSyntax(format!(
                "decoder '{resolved}' is not registered (available: {})",
                self.decoder_names().join(", ")
            ))
        })
    }

    /// Build the data source described by a `<datasource>` body.
    pub fn build_source(
        &self,
        variant: SourceVariant,
        body: &SourceBody,
        overrides: &CompileOverrides,
    ) -> WriterResult<Arc<dyn DataSource>> {
        let source: Arc<dyn DataSource> = match variant {
            SourceVariant::ClientPush => {
                let record = body.require("record", variant)?;
                Arc::new(ClientSource::new(record.require("name")?))
            }
            SourceVariant::DeviceAttribute => {
                let device = body.require("device", variant)?;
                let record = body.require("record", variant)?;
                let port = device
                    .attr("port")
                    .map(|p| {
                        p.trim().parse::<u16>().map_err(|_| {
                            WriterError::ConfigSyntax(format!("invalid device port '{p}'"))
                        })
                    })
                    .transpose()?;
                let endpoint = DeviceEndpoint {
                    device: device.require("name")?.to_string(),
                    host: device.attr("hostname").map(str::to_string),
                    port,
                };
                let member = device
                    .attr("member")
                    .map(|m| m.parse::<DeviceMember>())
                    .transpose()?
                    .unwrap_or_default();
                Arc::new(DeviceSource::new(
                    endpoint,
                    member,
                    record.require("name")?,
                    self.devices.clone(),
                ))
            }
            SourceVariant::DatabaseQuery => {
                let database = body.require("database", variant)?;
                let query = body.require("query", variant)?;
                if query.text.is_empty() {
                    return Err(WriterError::ConfigSyntax(
                        "DB datasource has an empty <query>".into(),
                    ));
                }
                let format = query
                    .attr("format")
                    .map(|f| f.parse::<DataFormat>().map_err(WriterError::ConfigSyntax))
                    .transpose()?
                    .unwrap_or(DataFormat::Scalar);
                let dbname = database.attr("dbname").unwrap_or("default");
                Arc::new(DatabaseSource::new(
                    dbname,
                    query.text.clone(),
                    format,
                    self.databases.get(dbname).cloned(),
                ))
            }
            SourceVariant::ExternalProgram => {
                let decoder = body.require("decoder", variant)?;
                let decoder = self.decoder(decoder.require("name")?, overrides)?;
                let input = if let Some(record) = body.element("record") {
                    ProgramInput::Record(record.require("name")?.to_string())
                } else if let Some(command) = body.element("command") {
                    let argv: Vec<String> =
                        command.text.split_whitespace().map(str::to_string).collect();
                    if argv.is_empty() {
                        return Err(WriterError::ConfigSyntax(
                            "PROGRAM datasource has an empty <command>".into(),
                        ));
                    }
                    ProgramInput::Command(argv)
                } else {
                    return Err(WriterError::ConfigSyntax(
                        "PROGRAM datasource requires a <record> or <command> input".into(),
                    ));
                };
                Arc::new(ProgramSource::new(decoder, input))
            }
        };
        debug!(source = %source.describe(), "data source built");
        Ok(source)
    }
}

/// Builder for [`SourceRegistry`].
pub struct SourceRegistryBuilder {
    decoders: HashMap<String, Arc<dyn Decoder>>,
    devices: Arc<dyn DeviceClient>,
    databases: HashMap<String, Arc<dyn DatabaseBackend>>,
}

impl Default for SourceRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceRegistryBuilder {
    /// Builder pre-loaded with the `json`, `utf8` and `VIDEO_IMAGE` decoders.
    pub fn new() -> Self {
        let builtin: [Arc<dyn Decoder>; 3] = [
            Arc::new(JsonDecoder),
            Arc::new(Utf8Decoder),
            Arc::new(VideoImageDecoder),
        ];
        Self {
            decoders: builtin
                .into_iter()
                .map(|d| (d.name().to_string(), d))
                .collect(),
            devices: Arc::new(StaticDeviceClient::new()),
            databases: HashMap::new(),
        }
    }

    /// Register (or replace) a decoder under its own name.
    pub fn decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
        self.decoders.insert(decoder.name().to_string(), decoder);
        self
    }

    /// Device client used by every DeviceAttribute source.
    pub fn device_client(mut self, client: Arc<dyn DeviceClient>) -> Self {
        self.devices = client;
        self
    }

    /// Register a named database.
    pub fn database(mut self, name: &str, backend: Arc<dyn DatabaseBackend>) -> Self {
        self.databases.insert(name.to_string(), backend);
        self
    }

    /// Freeze the registry.
    pub fn build(self) -> SourceRegistry {
        SourceRegistry {
            decoders: self.decoders,
            devices: self.devices,
            databases: self.databases,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::ReadContext;
    use serde_json::json;

    fn body(xml: &str) -> SourceBody {
        SourceBody::parse(xml).unwrap()
    }

    #[test]
    fn builtin_decoders_are_registered() {
        let registry = SourceRegistry::default();
        assert_eq!(registry.decoder_names(), vec!["VIDEO_IMAGE", "json", "utf8"]);
    }

    #[test]
    fn unregistered_decoder_is_a_config_error() {
        let registry = SourceRegistry::default();
        let err = registry
            .build_source(
                SourceVariant::ExternalProgram,
                &body(r#"<decoder name="MP4"/><record name="raw"/>"#),
                &CompileOverrides::default(),
            )
            .unwrap_err();
        assert!(matches!(err, WriterError::ConfigSyntax(_)));
    }

    #[test]
    fn decoder_overrides_resolve_symbolic_names() {
        let registry = SourceRegistry::default();
        let overrides = CompileOverrides {
            decoders: HashMap::from([("LIMA_VIDEO".to_string(), "VIDEO_IMAGE".to_string())]),
            ..CompileOverrides::default()
        };
        assert!(registry
            .build_source(
                SourceVariant::ExternalProgram,
                &body(r#"<decoder name="LIMA_VIDEO"/><record name="raw"/>"#),
                &overrides,
            )
            .is_ok());
    }

    #[tokio::test]
    async fn builds_device_sources_with_the_shared_client() {
        let client = StaticDeviceClient::new().with("sys/tg_test/1", "ampli", json!(3));
        let registry = SourceRegistry::builder().device_client(Arc::new(client)).build();
        let source = registry
            .build_source(
                SourceVariant::DeviceAttribute,
                &body(r#"<device name="sys/tg_test/1" member="attribute" port="10000"/><record name="ampli"/>"#),
                &CompileOverrides::default(),
            )
            .unwrap();
        let holder = source.read(&ReadContext::default()).await.unwrap().unwrap();
        assert_eq!(holder.as_scalar().and_then(|v| v.as_i64()), Some(3));
    }

    #[test]
    fn malformed_bodies_are_config_errors() {
        let registry = SourceRegistry::default();
        let none = CompileOverrides::default();
        for (variant, xml) in [
            (SourceVariant::ClientPush, "<record/>"),
            (SourceVariant::DeviceAttribute, r#"<record name="a"/>"#),
            (SourceVariant::DeviceAttribute, r#"<device name="d" port="x"/><record name="a"/>"#),
            (SourceVariant::DatabaseQuery, r#"<database dbname="x"/><query/>"#),
            (SourceVariant::DatabaseQuery, r#"<database/><query format="CUBE">SELECT 1</query>"#),
            (SourceVariant::ExternalProgram, r#"<decoder name="json"/>"#),
        ] {
            assert!(
                matches!(registry.build_source(variant, &body(xml), &none), Err(WriterError::ConfigSyntax(_))),
                "{variant} body {xml} should be rejected"
            );
        }
    }
}
