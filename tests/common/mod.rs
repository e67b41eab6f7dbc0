//! Shared fixtures for engine integration tests.
#![allow(dead_code)]

use nexus_writer::config::StorageSettings;
use nexus_writer::nexus::backend::MemoryBackend;
use nexus_writer::nexus::memory::MemoryFileView;
use nexus_writer::sources::SourceRegistry;
use nexus_writer::WriterEngine;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Scan layout with one client-pushed counter.
pub const SCAN_XML: &str = r#"
<definition>
  <group type="NXentry" name="entry">
    <field name="title" type="NX_CHAR">
      <strategy mode="INIT"/>
      <datasource type="CLIENT"><record name="title"/></datasource>
    </field>
    <group type="NXinstrument">
      <field name="x" type="NX_FLOAT64" units="mm">
        <strategy mode="STEP"/>
        <datasource type="CLIENT"><record name="x"/></datasource>
      </field>
      <field name="wavelength" type="NX_FLOAT64" units="angstrom">1.54</field>
    </group>
    <group type="NXdata" name="data">
      <link name="x" target="/entry/instrument/x"/>
    </group>
  </group>
</definition>"#;

/// Engine writing in-memory files under a temporary directory.
pub struct Harness {
    pub engine: WriterEngine,
    pub backend: Arc<MemoryBackend>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(sources: SourceRegistry) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let engine = WriterEngine::builder()
            .sources(Arc::new(sources))
            .backend(backend.clone())
            .storage(StorageSettings {
                output_dir: dir.path().to_path_buf(),
                ..StorageSettings::default()
            })
            .build();
        Self { engine, backend, dir }
    }

    /// Harness already initialized with `xml` and file `scan.nxs`.
    pub async fn ready(sources: SourceRegistry, xml: &str) -> Self {
        let harness = Self::new(sources);
        harness.engine.initialize().await.unwrap();
        harness.engine.set_xml_settings(xml).await.unwrap();
        harness.engine.set_file_name("scan.nxs").await.unwrap();
        harness
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().join("scan.nxs")
    }

    pub fn view(&self) -> MemoryFileView {
        self.backend.view(self.path()).unwrap()
    }
}
