//! CLI Entry Point for nxswriter
//!
//! Provides command-line access to the writer without a control system:
//! - Compile a configuration and show its tree and phase partitions
//! - Drive a full acquisition from recorded JSON steps
//!
//! # Usage
//!
//! Check a configuration:
//! ```bash
//! nxswriter check --xml demos/scan.xml
//! ```
//!
//! Write a file from one JSON record per line:
//! ```bash
//! nxswriter run --xml demos/scan.xml --output scan.nxs --records demos/steps.jsonl
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nexus_writer::compiler::ConfigCompiler;
use nexus_writer::config::{WriterSettings, DEFAULT_SETTINGS_PATH};
use nexus_writer::runner::{Phase, PhaseReport};
use nexus_writer::sources::SourceRegistry;
use nexus_writer::{logging, WriterEngine, WriterError, WriterResult};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "nxswriter")]
#[command(about = "Configuration-driven NeXus file writer", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a configuration and print its tree and phase partitions
    Check {
        /// XML configuration
        #[arg(long)]
        xml: PathBuf,
    },

    /// Write one file from recorded steps
    Run {
        /// XML configuration
        #[arg(long)]
        xml: PathBuf,

        /// Output file name (relative to storage.output_dir)
        #[arg(long)]
        output: String,

        /// JSON lines file, one record payload per step
        #[arg(long)]
        records: Option<PathBuf>,

        /// JSON file with the global record
        #[arg(long)]
        global: Option<PathBuf>,

        /// Override storage.backend
        #[arg(long)]
        backend: Option<String>,

        /// Replace an existing output file
        #[arg(long)]
        overwrite: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = WriterSettings::load_from(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;
    if let Commands::Run {
        backend, overwrite, ..
    } = &cli.command
    {
        if let Some(backend) = backend {
            settings.storage.backend = backend.clone();
        }
        settings.storage.overwrite |= *overwrite;
    }
    settings.validate().context("invalid settings")?;
    logging::init_from_settings(&settings)?;

    match cli.command {
        Commands::Check { xml } => check(&settings, xml).await,
        Commands::Run {
            xml,
            output,
            records,
            global,
            ..
        } => run(&settings, xml, output, records, global).await,
    }
}

async fn check(settings: &WriterSettings, xml_path: PathBuf) -> Result<()> {
    let xml = tokio::fs::read_to_string(&xml_path)
        .await
        .with_context(|| format!("reading {}", xml_path.display()))?;
    let registry = Arc::new(SourceRegistry::from_settings(settings));
    let compiled = ConfigCompiler::new(registry)
        .compile(&xml)
        .with_context(|| format!("compiling {}", xml_path.display()))?;

    println!("✅ {} compiles ({} nodes)", xml_path.display(), compiled.tree.len());
    println!();
    print!("{}", compiled.tree.outline());
    println!();
    for phase in [Phase::Init, Phase::Step, Phase::Final] {
        let ids = compiled.partitions.get(phase);
        println!("{phase}: {} node(s)", ids.len());
        for &id in ids {
            println!("   {}", compiled.tree.node(id).label());
        }
    }
    Ok(())
}

async fn run(
    settings: &WriterSettings,
    xml_path: PathBuf,
    output: String,
    records: Option<PathBuf>,
    global: Option<PathBuf>,
) -> Result<()> {
    let xml = tokio::fs::read_to_string(&xml_path)
        .await
        .with_context(|| format!("reading {}", xml_path.display()))?;

    let engine = WriterEngine::from_settings(settings)?;
    engine.initialize().await?;
    engine.set_xml_settings(&xml).await?;
    engine.set_file_name(&output).await?;
    if let Some(path) = global {
        let json = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        engine.set_json_record(&json).await?;
    }

    println!("📝 Writing {}", settings.storage.resolve(&output).display());
    report("openFile", engine.open_file().await)?;
    engine.open_entry().await?;

    if let Some(path) = records {
        let lines = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        for (n, line) in lines.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
            report(&format!("record {}", n + 1), engine.record(line).await)?;
        }
    }

    report("closeEntry", engine.close_entry(None).await)?;
    engine.close_file().await?;
    info!(steps = engine.steps().await, "acquisition finished");
    println!("✅ Done ({} step(s))", engine.steps().await);
    Ok(())
}

/// Print a phase outcome. Node failures are reported and tolerated; any
/// other error aborts the run.
fn report(label: &str, result: WriterResult<PhaseReport>) -> Result<()> {
    match result {
        Ok(report) => {
            println!("   {label}: {report}");
            Ok(())
        }
        Err(WriterError::PhaseFailed { phase, failures }) => {
            eprintln!("⚠️  {label}: {phase} phase had {} failure(s)", failures.len());
            for failure in &failures {
                eprintln!("     {failure}");
            }
            Ok(())
        }
        Err(e) => Err(e).context(label.to_string()),
    }
}
