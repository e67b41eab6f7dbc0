//! Lifecycle state machine and end-to-end writes through the engine.

mod common;

use common::{Harness, SCAN_XML};
use nexus_writer::sources::SourceRegistry;
use nexus_writer::{LifecycleState, WriterError};

#[tokio::test]
async fn test_record_before_open_entry_is_illegal() {
    let h = Harness::ready(SourceRegistry::default(), SCAN_XML).await;
    h.engine.open_file().await.unwrap();

    let err = h.engine.record(r#"{"data": {"x": 1.0}}"#).await.unwrap_err();
    assert!(matches!(
        err,
        WriterError::IllegalState {
            operation: "record",
            state: LifecycleState::FileOpen
        }
    ));
    assert_eq!(h.engine.state(), LifecycleState::FileOpen);
    assert_eq!(h.engine.steps().await, 0);
}

#[tokio::test]
async fn test_open_file_twice_is_illegal() {
    let h = Harness::ready(SourceRegistry::default(), SCAN_XML).await;
    h.engine.open_file().await.unwrap();
    assert!(matches!(
        h.engine.open_file().await,
        Err(WriterError::IllegalState { operation: "openFile", .. })
    ));
    assert_eq!(h.engine.state(), LifecycleState::FileOpen);
}

#[tokio::test]
async fn test_open_entry_without_file_is_illegal() {
    let h = Harness::ready(SourceRegistry::default(), SCAN_XML).await;
    assert!(h.engine.open_entry().await.is_err());
    assert_eq!(h.engine.state(), LifecycleState::Ready);
}

#[tokio::test]
async fn test_configuration_is_locked_while_file_is_open() {
    let h = Harness::ready(SourceRegistry::default(), SCAN_XML).await;
    h.engine.open_file().await.unwrap();
    assert!(h.engine.set_xml_settings(SCAN_XML).await.is_err());
    assert!(h.engine.set_file_name("other.nxs").await.is_err());
    // Global data may still change between steps.
    assert!(h.engine.set_json_record(r#"{"data": {"x": 0.0}}"#).await.is_ok());
}

#[tokio::test]
async fn test_scalar_steps_round_trip() {
    let h = Harness::ready(SourceRegistry::default(), SCAN_XML).await;
    h.engine.open_file().await.unwrap();
    h.engine.open_entry().await.unwrap();
    for x in [1.0, 2.0, 3.0] {
        let report = h
            .engine
            .record(&format!(r#"{{"data": {{"x": {x}}}}}"#))
            .await
            .unwrap();
        assert_eq!(report.stored, 1);
    }
    h.engine.close_entry(None).await.unwrap();
    h.engine.close_file().await.unwrap();
    assert_eq!(h.engine.state(), LifecycleState::Ready);

    let view = h.view();
    let x = view.field("/entry/instrument/x").unwrap();
    assert_eq!(x.to_f64_vec(), vec![1.0, 2.0, 3.0]);
    assert_eq!(x.steps(), 3);
    assert_eq!(view.link_target("/entry/data/x").as_deref(), Some("/entry/instrument/x"));
    assert_eq!(view.field("/entry/data/x").unwrap().to_f64_vec(), vec![1.0, 2.0, 3.0]);
}

#[tokio::test]
async fn test_empty_history_still_produces_structure() {
    let h = Harness::ready(SourceRegistry::default(), SCAN_XML).await;
    h.engine.open_file().await.unwrap();
    h.engine.open_entry().await.unwrap();
    h.engine.close_entry(None).await.unwrap();
    h.engine.close_file().await.unwrap();

    let view = h.view();
    assert!(view.has_group("/entry"));
    assert!(view.has_group("/entry/instrument"));
    assert!(view.has_group("/entry/data"));
    assert!(view.has_field("/entry/instrument/x"));
    assert!(view.field("/entry/instrument/x").is_none());
    assert_eq!(
        view.field("/entry/instrument/wavelength").unwrap().to_f64_vec(),
        vec![1.54]
    );
    assert!(view.attribute("/entry/instrument/x", "units").is_some());
    assert!(view.attribute("/entry", "start_time").is_some());
    assert!(view.attribute("/entry", "end_time").is_some());
    assert!(view.attribute("/", "file_time").is_some());
    assert!(view.attribute("/", "creator").is_some());
}

#[tokio::test]
async fn test_global_data_feeds_init_and_local_data_shadows_it() {
    let h = Harness::ready(SourceRegistry::default(), SCAN_XML).await;
    h.engine
        .set_json_record(r#"{"data": {"title": "powder scan", "x": -1.0}}"#)
        .await
        .unwrap();
    let init = h.engine.open_file().await.unwrap();
    assert_eq!(init.stored, 1);
    h.engine.open_entry().await.unwrap();
    h.engine.record("{}").await.unwrap();
    h.engine.record(r#"{"data": {"x": 5.0}}"#).await.unwrap();
    h.engine.close_entry(None).await.unwrap();
    h.engine.close_file().await.unwrap();

    let view = h.view();
    let title = view.field("/entry/title").unwrap();
    assert_eq!(title.values, vec![nexus_writer::data::Value::Text("powder scan".into())]);
    assert_eq!(view.field("/entry/instrument/x").unwrap().to_f64_vec(), vec![-1.0, 5.0]);
}

#[tokio::test]
async fn test_missing_client_value_skips_the_step() {
    let h = Harness::ready(SourceRegistry::default(), SCAN_XML).await;
    h.engine.open_file().await.unwrap();
    h.engine.open_entry().await.unwrap();
    let report = h.engine.record(r#"{"data": {"y": 1.0}}"#).await.unwrap();
    assert_eq!(report.stored, 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(h.engine.steps().await, 1);
}

#[tokio::test]
async fn test_config_syntax_error_keeps_engine_ready() {
    let h = Harness::ready(SourceRegistry::default(), "<definition><group type=\"NXentry\"></definition>").await;
    assert!(matches!(h.engine.open_file().await, Err(WriterError::ConfigSyntax(_))));
    assert_eq!(h.engine.state(), LifecycleState::Ready);

    // A corrected configuration opens normally.
    h.engine.set_xml_settings(SCAN_XML).await.unwrap();
    h.engine.open_file().await.unwrap();
    assert_eq!(h.engine.state(), LifecycleState::FileOpen);
}

#[tokio::test]
async fn test_existing_file_is_not_overwritten() {
    let h = Harness::ready(SourceRegistry::default(), SCAN_XML).await;
    h.engine.open_file().await.unwrap();
    h.engine.close_file().await.unwrap();

    assert!(matches!(h.engine.open_file().await, Err(WriterError::Storage(_))));
    assert_eq!(h.engine.state(), LifecycleState::Ready);
}

#[tokio::test]
async fn test_trigger_gates_step_nodes() {
    const XML: &str = r#"
<definition>
  <group type="NXentry" name="entry">
    <field name="x"><datasource type="CLIENT"><record name="x"/></datasource></field>
    <field name="mca">
      <strategy mode="STEP" trigger="mca"/>
      <datasource type="CLIENT"><record name="mca"/></datasource>
    </field>
  </group>
</definition>"#;
    let h = Harness::ready(SourceRegistry::default(), XML).await;
    h.engine.open_file().await.unwrap();
    h.engine.open_entry().await.unwrap();
    h.engine
        .record(r#"{"data": {"x": 1.0, "mca": 10.0}}"#)
        .await
        .unwrap();
    h.engine
        .record(r#"{"data": {"x": 2.0, "mca": 20.0}, "triggers": ["mca"]}"#)
        .await
        .unwrap();

    let view = h.view();
    assert_eq!(view.field("/entry/x").unwrap().to_f64_vec(), vec![1.0, 2.0]);
    assert_eq!(view.field("/entry/mca").unwrap().to_f64_vec(), vec![20.0]);
}

#[tokio::test]
async fn test_datasource_overrides_from_global_record() {
    const XML: &str = r#"
<definition>
  <group type="NXentry" name="entry">
    <field name="pos"><datasource type="MOTOR"><record name="pos"/></datasource></field>
  </group>
</definition>"#;
    let h = Harness::ready(SourceRegistry::default(), XML).await;
    assert!(matches!(h.engine.open_file().await, Err(WriterError::ConfigSyntax(_))));

    h.engine
        .set_json_record(r#"{"datasources": {"MOTOR": "CLIENT"}}"#)
        .await
        .unwrap();
    h.engine.open_file().await.unwrap();
    h.engine.open_entry().await.unwrap();
    h.engine.record(r#"{"data": {"pos": 0.25}}"#).await.unwrap();
    assert_eq!(h.view().field("/entry/pos").unwrap().to_f64_vec(), vec![0.25]);
}

#[tokio::test]
async fn test_final_phase_runs_on_close_entry() {
    const XML: &str = r#"
<definition>
  <group type="NXentry" name="entry">
    <field name="note" type="NX_CHAR">
      <datasource type="CLIENT" strategy="FINAL"><record name="note"/></datasource>
    </field>
  </group>
</definition>"#;
    let h = Harness::ready(SourceRegistry::default(), XML).await;
    h.engine.open_file().await.unwrap();
    h.engine.open_entry().await.unwrap();
    let report = h
        .engine
        .close_entry(Some(r#"{"data": {"note": "sample moved"}}"#))
        .await
        .unwrap();
    assert_eq!(report.stored, 1);
    assert_eq!(h.engine.state(), LifecycleState::FileOpen);
    assert!(h.view().field("/entry/note").is_some());
}
