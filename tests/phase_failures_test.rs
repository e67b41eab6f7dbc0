//! Per-node failure aggregation and fault handling.

mod common;

use common::Harness;
use nexus_writer::data::DataHolder;
use nexus_writer::error::{FailureKind, WriterResult};
use nexus_writer::nexus::backend::FileBackend;
use nexus_writer::nexus::memory::MemoryNexusFile;
use nexus_writer::nexus::{FieldSpec, NexusFile, NexusPath};
use nexus_writer::runner::Phase;
use nexus_writer::sources::database::StaticDatabase;
use nexus_writer::sources::device::StaticDeviceClient;
use nexus_writer::sources::SourceRegistry;
use nexus_writer::{LifecycleState, WriterEngine, WriterError};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

const DETECTOR_XML: &str = r#"
<definition>
  <group type="NXentry" name="entry">
    <group type="NXdetector" name="mca">
      <field name="spectrum" type="NX_INT32">
        <dimensions rank="1"><dim index="1" value="2048"/></dimensions>
        <strategy mode="STEP"/>
        <datasource type="TANGO">
          <device name="p09/mca/1" hostname="haso.desy.de" port="10000"/>
          <record name="Data"/>
        </datasource>
      </field>
      <field name="count_time">
        <datasource type="TANGO"><device name="p09/mca/1"/><record name="CountTime"/></datasource>
      </field>
      <field name="dead_time">
        <datasource type="TANGO"><device name="p09/mca/1"/><record name="DeadTime"/></datasource>
      </field>
    </group>
  </group>
</definition>"#;

fn detector(client: Arc<StaticDeviceClient>) -> SourceRegistry {
    SourceRegistry::builder().device_client(client).build()
}

#[tokio::test]
async fn test_spectrum_shape_mismatch_keeps_entry_open() {
    let client = Arc::new(
        StaticDeviceClient::new()
            .with("p09/mca/1", "Data", json!(vec![1; 2000]))
            .with("p09/mca/1", "CountTime", json!(1.0))
            .with("p09/mca/1", "DeadTime", json!(0.02)),
    );
    let h = Harness::ready(detector(client.clone()), DETECTOR_XML).await;
    h.engine.open_file().await.unwrap();
    h.engine.open_entry().await.unwrap();

    let err = h.engine.record("{}").await.unwrap_err();
    let failures = err.node_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].node, "/entry/mca/spectrum");
    assert_eq!(failures[0].kind, FailureKind::ShapeMismatch);
    assert!(matches!(err, WriterError::PhaseFailed { phase: Phase::Step, .. }));
    assert_eq!(h.engine.state(), LifecycleState::EntryOpen);

    // The caller may retry once the device delivers the declared length.
    client.set("p09/mca/1", "Data", json!(vec![1; 2048]));
    let report = h.engine.record("{}").await.unwrap();
    assert_eq!(report.stored, 3);

    let view = h.view();
    assert_eq!(view.field("/entry/mca/spectrum").unwrap().shape, vec![1, 2048]);
    assert_eq!(view.field("/entry/mca/count_time").unwrap().steps(), 2);
}

#[tokio::test]
async fn test_one_unavailable_source_out_of_n() {
    let client = Arc::new(
        StaticDeviceClient::new()
            .with("p09/mca/1", "Data", json!(vec![7; 2048]))
            .with("p09/mca/1", "CountTime", json!(1.0)),
    );
    let h = Harness::ready(detector(client), DETECTOR_XML).await;
    h.engine.open_file().await.unwrap();
    h.engine.open_entry().await.unwrap();

    let err = h.engine.record("{}").await.unwrap_err();
    assert_eq!(err.node_failures().len(), 1);
    assert_eq!(err.node_failures()[0].node, "/entry/mca/dead_time");
    assert_eq!(err.node_failures()[0].kind, FailureKind::SourceUnavailable);
    assert_eq!(h.engine.steps().await, 1);

    let view = h.view();
    assert_eq!(view.field("/entry/mca/count_time").unwrap().to_f64_vec(), vec![1.0]);
    assert_eq!(view.field("/entry/mca/spectrum").unwrap().values.len(), 2048);
    assert!(view.field("/entry/mca/dead_time").is_none());
}

#[tokio::test]
async fn test_every_source_failing_still_leaves_entry_open() {
    let h = Harness::ready(detector(Arc::new(StaticDeviceClient::new())), DETECTOR_XML).await;
    h.engine.open_file().await.unwrap();
    h.engine.open_entry().await.unwrap();

    let err = h.engine.record("{}").await.unwrap_err();
    assert_eq!(err.node_failures().len(), 3);
    // Failures come back sorted by node.
    let nodes: Vec<&str> = err.node_failures().iter().map(|f| f.node.as_str()).collect();
    assert_eq!(
        nodes,
        vec!["/entry/mca/count_time", "/entry/mca/dead_time", "/entry/mca/spectrum"]
    );
    assert_eq!(h.engine.state(), LifecycleState::EntryOpen);
    // The step is counted even though nothing was stored.
    assert_eq!(h.engine.steps().await, 1);
    let view = h.view();
    assert!(view.has_field("/entry/mca/spectrum"));
    assert!(view.field("/entry/mca/spectrum").is_none());
    h.engine.close_entry(None).await.unwrap();
    h.engine.close_file().await.unwrap();
}

#[tokio::test]
async fn test_database_query_uses_client_parameters() {
    const XML: &str = r#"
<definition>
  <group type="NXentry" name="entry">
    <group type="NXsample" name="sample">
      <field name="name" type="NX_CHAR">
        <strategy mode="INIT"/>
        <datasource type="DB">
          <database dbname="beamline"/>
          <query format="SCALAR">SELECT name FROM samples WHERE id = {sample_id}</query>
        </datasource>
      </field>
      <field name="temperatures">
        <strategy mode="FINAL"/>
        <datasource type="DB">
          <database dbname="beamline"/>
          <query format="SPECTRUM">SELECT t FROM log WHERE scan = {scan_id}</query>
        </datasource>
      </field>
    </group>
  </group>
</definition>"#;
    let db = StaticDatabase::new()
        .with("SELECT name FROM samples WHERE id = 42", vec![vec![json!("LaB6")]])
        .with(
            "SELECT t FROM log WHERE scan = 7",
            vec![vec![json!(291.5)], vec![json!(292.0)], vec![json!(292.5)]],
        );
    let sources = SourceRegistry::builder().database("beamline", Arc::new(db)).build();
    let h = Harness::ready(sources, XML).await;
    h.engine
        .set_json_record(r#"{"data": {"sample_id": 42, "scan_id": 7}}"#)
        .await
        .unwrap();

    assert_eq!(h.engine.open_file().await.unwrap().stored, 1);
    h.engine.open_entry().await.unwrap();
    assert_eq!(h.engine.close_entry(None).await.unwrap().stored, 1);

    let view = h.view();
    assert_eq!(
        view.field("/entry/sample/temperatures").unwrap().to_f64_vec(),
        vec![291.5, 292.0, 292.5]
    );
    assert!(view.field("/entry/sample/name").is_some());
}

/// File whose flush always fails.
struct BrokenFlush(MemoryNexusFile);

impl NexusFile for BrokenFlush {
    fn path(&self) -> &Path {
        self.0.path()
    }
    fn create_group(&mut self, path: &NexusPath, nx_class: &str) -> WriterResult<()> {
        self.0.create_group(path, nx_class)
    }
    fn create_field(&mut self, path: &NexusPath, spec: &FieldSpec) -> WriterResult<()> {
        self.0.create_field(path, spec)
    }
    fn write_field(&mut self, path: &NexusPath, value: &DataHolder) -> WriterResult<()> {
        self.0.write_field(path, value)
    }
    fn append_field(&mut self, path: &NexusPath, value: &DataHolder) -> WriterResult<()> {
        self.0.append_field(path, value)
    }
    fn write_attribute(
        &mut self,
        owner: &NexusPath,
        name: &str,
        value: &DataHolder,
    ) -> WriterResult<()> {
        self.0.write_attribute(owner, name, value)
    }
    fn create_link(&mut self, path: &NexusPath, target: &NexusPath) -> WriterResult<()> {
        self.0.create_link(path, target)
    }
    fn flush(&mut self) -> WriterResult<()> {
        Err(WriterError::Storage("disk full".into()))
    }
    fn close(&mut self) -> WriterResult<()> {
        self.0.close()
    }
}

struct BrokenBackend;

impl FileBackend for BrokenBackend {
    fn name(&self) -> &str {
        "broken"
    }
    fn create(&self, path: &Path, _overwrite: bool) -> WriterResult<Box<dyn NexusFile>> {
        Ok(Box::new(BrokenFlush(MemoryNexusFile::new(path))))
    }
}

#[tokio::test]
async fn test_storage_failure_moves_engine_to_fault() {
    let engine = WriterEngine::builder().backend(Arc::new(BrokenBackend)).build();
    engine.initialize().await.unwrap();
    engine.set_xml_settings(common::SCAN_XML).await.unwrap();
    engine.set_file_name("broken.nxs").await.unwrap();
    engine.open_file().await.unwrap();
    engine.open_entry().await.unwrap();
    engine.record(r#"{"data": {"x": 1.0}}"#).await.unwrap();

    assert!(matches!(
        engine.close_entry(None).await,
        Err(WriterError::Storage(_))
    ));
    assert_eq!(engine.state(), LifecycleState::Fault);

    // Everything but initialize is refused while faulted.
    assert!(matches!(
        engine.record("{}").await,
        Err(WriterError::IllegalState { state: LifecycleState::Fault, .. })
    ));
    assert!(engine.close_file().await.is_err());
    assert!(engine.set_json_record("{}").await.is_err());

    engine.initialize().await.unwrap();
    assert_eq!(engine.state(), LifecycleState::Ready);
}
