//! The bundled demo configuration and settings, end to end.

use nexus_writer::compiler::ConfigCompiler;
use nexus_writer::config::WriterSettings;
use nexus_writer::nexus::backend::MemoryBackend;
use nexus_writer::runner::{Phase, PhaseRunner};
use nexus_writer::sources::SourceRegistry;
use nexus_writer::WriterEngine;
use serial_test::serial;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn manifest(path: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join(path)
}

fn settings() -> WriterSettings {
    let settings = WriterSettings::load_from(manifest("config/nxswriter.toml")).unwrap();
    settings.validate().unwrap();
    settings
}

#[test]
#[serial]
fn test_compiling_twice_gives_identical_partitions() {
    let xml = std::fs::read_to_string(manifest("demos/scan.xml")).unwrap();
    let compiler = ConfigCompiler::new(Arc::new(SourceRegistry::from_settings(&settings())));
    let first = compiler.compile(&xml).unwrap();
    let second = compiler.compile(&xml).unwrap();

    for phase in [Phase::Init, Phase::Step, Phase::Final] {
        let labels = |c: &nexus_writer::compiler::CompiledConfig| {
            c.partitions
                .get(phase)
                .iter()
                .map(|&id| (c.tree.node(id).tag().to_string(), c.tree.node(id).label()))
                .collect::<Vec<_>>()
        };
        assert_eq!(labels(&first), labels(&second));
    }
    assert_eq!(first.tree.outline(), second.tree.outline());
    assert_eq!(first.partitions.init.len(), 2);
    assert_eq!(first.partitions.step.len(), 2);
    assert_eq!(first.partitions.final_.len(), 1);
}

#[tokio::test]
#[serial]
async fn test_demo_scan_writes_every_phase() {
    let settings = settings();
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let mut storage = settings.storage.clone();
    storage.output_dir = dir.path().to_path_buf();
    let engine = WriterEngine::builder()
        .sources(Arc::new(SourceRegistry::from_settings(&settings)))
        .backend(backend.clone())
        .runner(PhaseRunner::new(
            settings.runner.max_concurrency,
            Some(settings.runner.read_timeout),
        ))
        .storage(storage)
        .build();

    let xml = std::fs::read_to_string(manifest("demos/scan.xml")).unwrap();
    let global = std::fs::read_to_string(manifest("demos/global.json")).unwrap();
    let steps = std::fs::read_to_string(manifest("demos/steps.jsonl")).unwrap();

    engine.initialize().await.unwrap();
    engine.set_xml_settings(&xml).await.unwrap();
    engine.set_file_name("demo.nxs").await.unwrap();
    engine.set_json_record(&global).await.unwrap();
    assert_eq!(engine.open_file().await.unwrap().stored, 2);
    engine.open_entry().await.unwrap();
    for line in steps.lines() {
        assert_eq!(engine.record(line).await.unwrap().stored, 2);
    }
    assert_eq!(engine.close_entry(None).await.unwrap().stored, 1);
    engine.close_file().await.unwrap();

    let view = backend.view(dir.path().join("demo.nxs")).unwrap();
    assert_eq!(
        view.field("/entry/data/energy").unwrap().to_f64_vec(),
        vec![8.950, 8.975, 9.000]
    );
    assert_eq!(view.field("/entry/data/counts").unwrap().steps(), 3);
    assert_eq!(
        view.field("/entry/instrument/source/current").unwrap().to_f64_vec(),
        vec![99.8]
    );
    assert!(view.attribute("/entry", "default").is_some());
    assert!(view.attribute("/entry", "doc").is_some());
    assert_eq!(
        view.children("/entry/instrument"),
        vec!["diode".to_string(), "mono".to_string(), "source".to_string()]
    );
}
