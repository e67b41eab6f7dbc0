//! Writer orchestration.
//!
//! [`WriterEngine`] owns the file lifecycle. It compiles the configuration when
//! the file is opened, drives the [`PhaseRunner`] for the INIT, STEP and FINAL
//! partitions and guards every operation with the [`LifecycleState`] machine.
//!
//! # Lifecycle
//!
//! ```text
//! initialize → set_xml_settings / set_file_name / set_json_record
//!            → open_file   (compile, create file, materialize, INIT)
//!            → open_entry  (stamp start_time)
//!            → record × n  (STEP)
//!            → close_entry (FINAL, stamp end_time, flush)
//!            → close_file
//! ```
//!
//! Per-node failures never abort a phase: the phase completes, the state
//! transition happens, and the operation returns `PhaseFailed` listing every
//! failed node. Failures of the file itself (creation aside) move the engine
//! to `Fault`, which only [`WriterEngine::initialize`] leaves.
//!
//! # Example
//!
//! ```no_run
//! use nexus_writer::engine::WriterEngine;
//!
//! # async fn demo(xml: &str) -> nexus_writer::error::WriterResult<()> {
//! let engine = WriterEngine::builder().build();
//! engine.initialize().await?;
//! engine.set_xml_settings(xml).await?;
//! engine.set_file_name("scan_0001.nxs").await?;
//! engine.open_file().await?;
//! engine.open_entry().await?;
//! for x in [1.0, 2.0, 3.0] {
//!     engine.record(&format!(r#"{{"data": {{"x": {x}}}}}"#)).await?;
//! }
//! engine.close_entry(None).await?;
//! engine.close_file().await?;
//! # Ok(())
//! # }
//! ```

pub mod record;
pub mod state;

pub use record::RecordPayload;
pub use state::LifecycleState;

use crate::compiler::{CompiledConfig, ConfigCompiler};
use crate::config::{StorageSettings, WriterSettings};
use crate::data::DataHolder;
use crate::error::{WriterError, WriterResult};
use crate::nexus::backend::{BackendRegistry, FileBackend, MemoryBackend};
use crate::nexus::{FileHandle, NexusPath};
use crate::runner::{Phase, PhaseReport, PhaseRunner};
use crate::sources::{ReadContext, SourceRegistry};
use crate::tree::NodeKind;
use chrono::Utc;
use serde_json::Map;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

const CREATOR: &str = concat!("nexus_writer ", env!("CARGO_PKG_VERSION"));

/// Result of the most recent phase operation, kept for asynchronous callers.
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    /// Operation name (`openEntry`, `record`, `closeEntry`)
    pub operation: &'static str,
    /// Phase report, or the error the operation returned
    pub result: Result<Option<PhaseReport>, Arc<WriterError>>,
}

impl OperationOutcome {
    /// True when the operation completed without any failure.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    OpenEntry,
    Record,
    CloseEntry,
}

impl Operation {
    fn name(self) -> &'static str {
        match self {
            Operation::OpenEntry => "openEntry",
            Operation::Record => "record",
            Operation::CloseEntry => "closeEntry",
        }
    }

    fn phase(self) -> Option<Phase> {
        match self {
            Operation::OpenEntry => None,
            Operation::Record => Some(Phase::Step),
            Operation::CloseEntry => Some(Phase::Final),
        }
    }

    fn allowed(self, state: LifecycleState) -> bool {
        match self {
            Operation::OpenEntry => state.can_open_entry(),
            Operation::Record => state.can_record(),
            Operation::CloseEntry => state.can_close_entry(),
        }
    }

    /// State once the operation has run.
    fn settled(self) -> LifecycleState {
        match self {
            Operation::OpenEntry | Operation::Record => LifecycleState::EntryOpen,
            Operation::CloseEntry => LifecycleState::FileOpen,
        }
    }
}

/// Everything a phase needs once the session lock is released.
struct PhaseJob {
    operation: Operation,
    compiled: CompiledConfig,
    ctx: Arc<ReadContext>,
}

#[derive(Default)]
struct Session {
    file_name: Option<String>,
    xml: Option<String>,
    global: RecordPayload,
    compiled: Option<CompiledConfig>,
    file: Option<FileHandle>,
    entry: Option<NexusPath>,
    steps: usize,
}

struct EngineInner {
    sources: Arc<SourceRegistry>,
    backend: Arc<dyn FileBackend>,
    runner: PhaseRunner,
    storage: StorageSettings,
    state: watch::Sender<LifecycleState>,
    session: Mutex<Session>,
    last_outcome: std::sync::Mutex<Option<OperationOutcome>>,
}

/// Configuration-driven NeXus writer.
///
/// Cheap to clone; clones share the same session.
///
/// # Examples
///
/// ```
/// use nexus_writer::{LifecycleState, WriterEngine};
///
/// # tokio_test::block_on(async {
/// let engine = WriterEngine::builder().build();
/// engine.initialize().await.unwrap();
/// engine
///     .set_xml_settings(r#"<definition><group type="NXentry" name="entry"/></definition>"#)
///     .await
///     .unwrap();
/// engine.set_file_name("doc.nxs").await.unwrap();
/// engine.open_file().await.unwrap();
/// assert_eq!(engine.state(), LifecycleState::FileOpen);
/// engine.close_file().await.unwrap();
/// # })
/// ```
#[derive(Clone)]
pub struct WriterEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for WriterEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterEngine")
            .field("state", &self.state())
            .field("backend", &self.inner.backend.name())
            .finish_non_exhaustive()
    }
}

/// Builder for [`WriterEngine`].
pub struct WriterEngineBuilder {
    sources: Option<Arc<SourceRegistry>>,
    backend: Option<Arc<dyn FileBackend>>,
    runner: PhaseRunner,
    storage: StorageSettings,
}

impl WriterEngineBuilder {
    /// Registry used to compile data source bindings.
    pub fn sources(mut self, sources: Arc<SourceRegistry>) -> Self {
        self.sources = Some(sources);
        self
    }

    /// Backend creating the output file.
    pub fn backend(mut self, backend: Arc<dyn FileBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Phase runner settings.
    pub fn runner(mut self, runner: PhaseRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Output directory and overwrite policy.
    pub fn storage(mut self, storage: StorageSettings) -> Self {
        self.storage = storage;
        self
    }

    /// Build the engine in `NotInitialized`.
    ///
    /// Defaults: built-in decoders only, in-memory files, unbounded runner.
    pub fn build(self) -> WriterEngine {
        let (state, _) = watch::channel(LifecycleState::NotInitialized);
        WriterEngine {
            inner: Arc::new(EngineInner {
                sources: self.sources.unwrap_or_default(),
                backend: self
                    .backend
                    .unwrap_or_else(|| Arc::new(MemoryBackend::new())),
                runner: self.runner,
                storage: self.storage,
                state,
                session: Mutex::new(Session::default()),
                last_outcome: std::sync::Mutex::new(None),
            }),
        }
    }
}

impl WriterEngine {
    /// Start building an engine.
    pub fn builder() -> WriterEngineBuilder {
        WriterEngineBuilder {
            sources: None,
            backend: None,
            runner: PhaseRunner::default(),
            storage: StorageSettings::default(),
        }
    }

    /// Engine wired from loaded settings: static devices and databases, the
    /// configured backend and runner limits.
    pub fn from_settings(settings: &WriterSettings) -> WriterResult<Self> {
        settings.validate()?;
        let backend = BackendRegistry::new().get(&settings.storage.backend)?;
        Ok(Self::builder()
            .sources(Arc::new(SourceRegistry::from_settings(settings)))
            .backend(backend)
            .runner(PhaseRunner::new(
                settings.runner.max_concurrency,
                Some(settings.runner.read_timeout),
            ))
            .storage(settings.storage.clone())
            .build())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    /// Status line describing the current state.
    pub fn status(&self) -> &'static str {
        self.state().status()
    }

    /// Receiver observing every state transition.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    /// Outcome of the most recent `openEntry`, `record` or `closeEntry`.
    pub fn last_outcome(&self) -> Option<OperationOutcome> {
        self.inner
            .last_outcome
            .lock()
            .ok()
            .and_then(|outcome| outcome.clone())
    }

    /// Wait until no phase is executing and return the settled state.
    pub async fn wait_until_idle(&self) -> LifecycleState {
        let mut rx = self.subscribe();
        let settled = match rx.wait_for(|state| *state != LifecycleState::Writing).await {
            Ok(state) => *state,
            // The sender lives as long as the engine.
            Err(_) => self.state(),
        };
        settled
    }

    /// Number of `record` calls that ran the STEP phase since the file was
    /// opened.
    ///
    /// A record whose nodes all failed or were skipped still counts: each
    /// call advances the step index, so growing fields that did receive data
    /// may hold fewer slabs than this.
    pub async fn steps(&self) -> usize {
        self.inner.session.lock().await.steps
    }

    /// Reset the engine to `Ready`, releasing any file left open by a fault.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> WriterResult<()> {
        let mut session = self.inner.session.lock().await;
        self.ensure("initialize", LifecycleState::can_initialize)?;
        if let Some(compiled) = session.compiled.take() {
            compiled.tree.detach_all();
        }
        if let Some(handle) = session.file.take() {
            if let Err(e) = handle.lock().await.close() {
                warn!(error = %e, "releasing the previous file failed");
            }
        }
        *session = Session::default();
        self.set_state(LifecycleState::Ready);
        info!("writer initialized");
        Ok(())
    }

    /// Name of the file the next `open_file` creates, relative to the output
    /// directory unless absolute.
    pub async fn set_file_name(&self, file_name: &str) -> WriterResult<()> {
        let mut session = self.inner.session.lock().await;
        self.ensure("setFileName", LifecycleState::can_configure)?;
        session.file_name = Some(file_name.to_string());
        debug!(file_name, "file name set");
        Ok(())
    }

    /// Store the XML configuration. It is compiled by `open_file`.
    pub async fn set_xml_settings(&self, xml: &str) -> WriterResult<()> {
        let mut session = self.inner.session.lock().await;
        self.ensure("setXMLSettings", LifecycleState::can_configure)?;
        session.xml = Some(xml.to_string());
        debug!(bytes = xml.len(), "configuration stored");
        Ok(())
    }

    /// Replace the global client payload.
    ///
    /// Its `data` is visible to every phase; its `decoders` and `datasources`
    /// overrides apply to the next compilation.
    pub async fn set_json_record(&self, json: &str) -> WriterResult<()> {
        let mut session = self.inner.session.lock().await;
        self.ensure("setJSONRecord", LifecycleState::can_set_record)?;
        session.global = RecordPayload::parse(json)?;
        debug!(keys = session.global.data.len(), "global record set");
        Ok(())
    }

    /// Compile the configuration, create the file, materialize its layout and
    /// run the INIT phase.
    ///
    /// # Errors
    ///
    /// - `IllegalState` outside `Ready`
    /// - `ConfigSyntax` when no configuration is set or it does not compile;
    ///   the state stays `Ready`
    /// - `SettingsValidation` when no file name is set
    /// - `Storage` when the file cannot be created (state stays `Ready`) or
    ///   its layout cannot be written (state becomes `Fault`)
    /// - `PhaseFailed` when INIT nodes failed; the file is open regardless
    #[instrument(skip(self), err)]
    pub async fn open_file(&self) -> WriterResult<PhaseReport> {
        let mut session = self.inner.session.lock().await;
        self.ensure("openFile", LifecycleState::can_open_file)?;

        let xml = session
            .xml
            .clone()
            .ok_or_else(|| WriterError::ConfigSyntax("no XML configuration has been set".into()))?;
        let file_name = session
            .file_name
            .clone()
            .ok_or_else(|| WriterError::SettingsValidation("no file name has been set".into()))?;

        let compiled = ConfigCompiler::new(Arc::clone(&self.inner.sources))
            .with_overrides(session.global.overrides())
            .compile(&xml)?;

        let path = self.inner.storage.resolve(&file_name);
        let file = self.inner.backend.create(&path, self.inner.storage.overwrite)?;
        let handle: FileHandle = Arc::new(Mutex::new(file));
        let session_id = Uuid::new_v4();
        info!(
            %session_id,
            path = %path.display(),
            backend = self.inner.backend.name(),
            nodes = compiled.tree.len(),
            bound = compiled.partitions.len(),
            "file created"
        );

        compiled.tree.attach(&handle);
        session.entry = compiled
            .tree
            .iter()
            .find(|node| {
                matches!(node.kind(), NodeKind::Group { nx_class } if nx_class == "NXentry")
            })
            .map(|node| node.path().clone());
        session.compiled = Some(compiled.clone());
        session.file = Some(Arc::clone(&handle));
        session.steps = 0;

        if let Err(e) = prepare(&compiled, &handle, &file_name).await {
            self.fault(&e);
            return Err(e);
        }

        self.set_state(LifecycleState::Writing);
        let ctx = ReadContext::new(session.global.data.clone(), Map::new(), Vec::new());
        let init = compiled.partitions.get(Phase::Init);
        let report = self
            .inner
            .runner
            .run_and_wait(Phase::Init, &compiled.tree, init, Arc::new(ctx))
            .await;
        self.inner.runner.close(&compiled.tree, init);
        self.set_state(LifecycleState::FileOpen);
        info!(%report, "file open");
        report.into_result()
    }

    /// Open the entry: stamp `start_time` on the first `NXentry` group.
    pub async fn open_entry(&self) -> WriterResult<()> {
        let job = self.begin(Operation::OpenEntry, None).await?;
        self.execute(job).await.map(|_| ())
    }

    /// Run the STEP phase with `json` as the local payload.
    ///
    /// A failed step leaves the entry open; the caller may record again.
    pub async fn record(&self, json: &str) -> WriterResult<PhaseReport> {
        let job = self.begin(Operation::Record, Some(json)).await?;
        let report = self.execute(job).await?;
        report.ok_or_else(|| WriterError::Internal("record produced no phase report".into()))
    }

    /// Run the FINAL phase, stamp `end_time` and flush.
    pub async fn close_entry(&self, json: Option<&str>) -> WriterResult<PhaseReport> {
        let job = self.begin(Operation::CloseEntry, json).await?;
        let report = self.execute(job).await?;
        report.ok_or_else(|| WriterError::Internal("closeEntry produced no phase report".into()))
    }

    /// Like [`open_entry`](Self::open_entry), returning once the operation is
    /// accepted. Completion is observable through the state and
    /// [`last_outcome`](Self::last_outcome).
    pub async fn open_entry_async(&self) -> WriterResult<()> {
        let job = self.begin(Operation::OpenEntry, None).await?;
        self.spawn(job);
        Ok(())
    }

    /// Like [`record`](Self::record), returning once the step is accepted.
    pub async fn record_async(&self, json: &str) -> WriterResult<()> {
        let job = self.begin(Operation::Record, Some(json)).await?;
        self.spawn(job);
        Ok(())
    }

    /// Like [`close_entry`](Self::close_entry), returning once accepted.
    pub async fn close_entry_async(&self, json: Option<&str>) -> WriterResult<()> {
        let job = self.begin(Operation::CloseEntry, json).await?;
        self.spawn(job);
        Ok(())
    }

    /// Release per-node resources and close the file.
    #[instrument(skip(self), err)]
    pub async fn close_file(&self) -> WriterResult<()> {
        let mut session = self.inner.session.lock().await;
        self.ensure("closeFile", LifecycleState::can_close_file)?;

        if let Some(compiled) = session.compiled.take() {
            let runner = &self.inner.runner;
            runner.close(&compiled.tree, compiled.partitions.get(Phase::Step));
            runner.close(&compiled.tree, compiled.partitions.get(Phase::Final));
            compiled.tree.detach_all();
        }
        session.entry = None;
        if let Some(handle) = session.file.take() {
            let mut file = handle.lock().await;
            if let Err(e) = file.close() {
                self.fault(&e);
                return Err(e);
            }
            info!(path = %file.path().display(), steps = session.steps, "file closed");
        }
        self.set_state(LifecycleState::Ready);
        Ok(())
    }

    /// Validate the operation, parse its payload and switch to `Writing`.
    async fn begin(&self, operation: Operation, json: Option<&str>) -> WriterResult<PhaseJob> {
        let session = self.inner.session.lock().await;
        let state = self.state();
        if !operation.allowed(state) {
            return Err(WriterError::IllegalState {
                operation: operation.name(),
                state,
            });
        }
        let local = match json {
            Some(json) => RecordPayload::parse(json)?,
            None => RecordPayload::default(),
        };
        let compiled = session
            .compiled
            .clone()
            .ok_or_else(|| {
                WriterError::Internal("file open without a compiled configuration".into())
            })?;
        let ctx = ReadContext::new(session.global.data.clone(), local.data, local.triggers);
        self.set_state(LifecycleState::Writing);
        Ok(PhaseJob {
            operation,
            compiled,
            ctx: Arc::new(ctx),
        })
    }

    /// Run the phase of `job`, apply the entry bookkeeping and settle the state.
    async fn execute(&self, job: PhaseJob) -> WriterResult<Option<PhaseReport>> {
        let report = match job.operation.phase() {
            Some(phase) => Some(
                self.inner
                    .runner
                    .run_and_wait(
                        phase,
                        &job.compiled.tree,
                        job.compiled.partitions.get(phase),
                        job.ctx,
                    )
                    .await,
            ),
            None => None,
        };

        let mut session = self.inner.session.lock().await;
        let bookkeeping = self.after_phase(&mut session, job.operation).await;
        let (next, result) = match bookkeeping {
            Ok(()) => {
                if let Some(report) = &report {
                    info!(operation = job.operation.name(), %report, "phase finished");
                }
                let result = match report {
                    Some(report) => report.into_result().map(Some),
                    None => Ok(None),
                };
                (job.operation.settled(), result)
            }
            Err(e) if e.is_fatal() => {
                error!(operation = job.operation.name(), error = %e, "writer entered Fault");
                (LifecycleState::Fault, Err(e))
            }
            Err(e) => (job.operation.settled(), Err(e)),
        };

        let outcome = OperationOutcome {
            operation: job.operation.name(),
            result: match &result {
                Ok(report) => Ok(report.clone()),
                Err(e) => Err(Arc::new(clone_error(e))),
            },
        };
        // Published before the state so waiters always see it.
        if let Ok(mut slot) = self.inner.last_outcome.lock() {
            *slot = Some(outcome);
        }
        self.set_state(next);
        result
    }

    fn spawn(&self, job: PhaseJob) {
        let engine = self.clone();
        let span = tracing::info_span!("async_phase", operation = job.operation.name());
        tokio::spawn(
            async move {
                // The outcome is published through last_outcome.
                let _ = engine.execute(job).await;
            }
            .instrument(span),
        );
    }

    async fn after_phase(&self, session: &mut Session, operation: Operation) -> WriterResult<()> {
        let handle = session
            .file
            .clone()
            .ok_or_else(|| WriterError::Internal("phase finished without an open file".into()))?;
        match operation {
            Operation::OpenEntry => {
                if let Some(entry) = &session.entry {
                    let now = DataHolder::scalar(Utc::now().to_rfc3339());
                    handle.lock().await.write_attribute(entry, "start_time", &now)?;
                }
                info!(entry = ?session.entry.as_ref().map(ToString::to_string), "entry open");
            }
            Operation::Record => session.steps += 1,
            Operation::CloseEntry => {
                let mut file = handle.lock().await;
                if let Some(entry) = &session.entry {
                    let now = DataHolder::scalar(Utc::now().to_rfc3339());
                    file.write_attribute(entry, "end_time", &now)?;
                }
                file.flush()?;
                info!(steps = session.steps, "entry closed");
            }
        }
        Ok(())
    }

    fn ensure(
        &self,
        operation: &'static str,
        allowed: fn(&LifecycleState) -> bool,
    ) -> WriterResult<()> {
        let state = self.state();
        if allowed(&state) {
            Ok(())
        } else {
            Err(WriterError::IllegalState { operation, state })
        }
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "state changed");
        }
    }

    fn fault(&self, err: &WriterError) {
        error!(error = %err, "writer entered Fault");
        self.set_state(LifecycleState::Fault);
    }
}

/// Write the file-level attributes and the layout of `compiled`.
async fn prepare(
    compiled: &CompiledConfig,
    handle: &FileHandle,
    file_name: &str,
) -> WriterResult<()> {
    {
        let mut file = handle.lock().await;
        let root = NexusPath::root();
        file.write_attribute(&root, "file_name", &DataHolder::scalar(file_name))?;
        file.write_attribute(&root, "file_time", &DataHolder::scalar(Utc::now().to_rfc3339()))?;
        file.write_attribute(&root, "creator", &DataHolder::scalar(CREATOR))?;
    }
    compiled.tree.materialize().await?;
    Ok(())
}

/// Copy of an error for the shared outcome slot; source chains are flattened.
fn clone_error(err: &WriterError) -> WriterError {
    match err {
        WriterError::ConfigSyntax(m) => WriterError::ConfigSyntax(m.clone()),
        WriterError::SourceUnavailable { source_name, reason } => WriterError::SourceUnavailable {
            source_name: source_name.clone(),
            reason: reason.clone(),
        },
        WriterError::SourceFormat { source_name, reason } => WriterError::SourceFormat {
            source_name: source_name.clone(),
            reason: reason.clone(),
        },
        WriterError::ShapeMismatch {
            path,
            declared,
            actual,
        } => WriterError::ShapeMismatch {
            path: path.clone(),
            declared: declared.clone(),
            actual: actual.clone(),
        },
        WriterError::DetachedNode(n) => WriterError::DetachedNode(n.clone()),
        WriterError::IllegalState { operation, state } => WriterError::IllegalState {
            operation: *operation,
            state: *state,
        },
        WriterError::PhaseFailed { phase, failures } => WriterError::PhaseFailed {
            phase: *phase,
            failures: failures.clone(),
        },
        WriterError::Storage(m) => WriterError::Storage(m.clone()),
        other => WriterError::Internal(other.to_string()),
    }
}
