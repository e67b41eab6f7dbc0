//! Phase execution.
//!
//! A phase is one pass over the nodes bound to a trigger phase (INIT, STEP or
//! FINAL). [`PhaseRunner::run_and_wait`] spawns one task per node on a
//! `JoinSet`; every task reads its data source and stores the result in the
//! file. The call returns only after every task has finished, successfully or
//! not, so phases never overlap. Per-node failures are captured individually
//! and aggregated into a [`PhaseReport`].

use crate::error::{FailureKind, NodeFailure, WriterError, WriterResult};
use crate::sources::ReadContext;
use crate::tree::{NodeId, WriterTree};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

/// Trigger phase of a bound node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Once, when the file is opened
    Init,
    /// Once per record
    Step,
    /// Once, when the entry is closed
    Final,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Init => write!(f, "INIT"),
            Phase::Step => write!(f, "STEP"),
            Phase::Final => write!(f, "FINAL"),
        }
    }
}

impl FromStr for Phase {
    type Err = WriterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INIT" => Ok(Phase::Init),
            "STEP" => Ok(Phase::Step),
            "FINAL" => Ok(Phase::Final),
            other => Err(WriterError::ConfigSyntax(format!(
                "unknown strategy '{other}', expected INIT, STEP or FINAL"
            ))),
        }
    }
}

/// Outcome of one phase execution.
#[derive(Debug, Clone)]
pub struct PhaseReport {
    /// Phase that ran
    pub phase: Phase,
    /// Nodes whose value was written
    pub stored: usize,
    /// Nodes that had no data or were not triggered
    pub skipped: usize,
    /// Captured per-node failures
    pub failures: Vec<NodeFailure>,
    /// Wall-clock duration of the phase
    pub elapsed: Duration,
}

impl PhaseReport {
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            stored: 0,
            skipped: 0,
            failures: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// True when no node failed.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Convert into an error when any node failed.
    pub fn into_result(self) -> WriterResult<PhaseReport> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(WriterError::PhaseFailed {
                phase: self.phase,
                failures: self.failures,
            })
        }
    }
}

impl fmt::Display for PhaseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} stored, {} skipped, {} failed in {:?}",
            self.phase,
            self.stored,
            self.skipped,
            self.failures.len(),
            self.elapsed
        )
    }
}

enum TaskOutcome {
    Stored,
    Skipped,
}

/// Runs the nodes of one phase concurrently.
#[derive(Debug, Clone)]
pub struct PhaseRunner {
    max_concurrency: usize,
    read_timeout: Option<Duration>,
}

impl Default for PhaseRunner {
    fn default() -> Self {
        Self::new(0, None)
    }
}

impl PhaseRunner {
    /// Runner allowing `max_concurrency` simultaneous tasks (0 = one task per
    /// node, no bound), each read limited by `read_timeout`.
    pub fn new(max_concurrency: usize, read_timeout: Option<Duration>) -> Self {
        Self {
            max_concurrency,
            read_timeout,
        }
    }

    /// Execute every node of `partition` and wait for all of them.
    ///
    /// Never fails as a whole: every failure is recorded in the report. Tasks
    /// that panic are reported as `Internal` failures of their node.
    #[instrument(skip_all, fields(phase = %phase, nodes = partition.len()))]
    pub async fn run_and_wait(
        &self,
        phase: Phase,
        tree: &Arc<WriterTree>,
        partition: &[NodeId],
        ctx: Arc<ReadContext>,
    ) -> PhaseReport {
        let started = Instant::now();
        let mut report = PhaseReport::new(phase);
        let permits = (self.max_concurrency > 0)
            .then(|| Arc::new(Semaphore::new(self.max_concurrency)));
        let mut tasks = JoinSet::new();
        let mut pending = std::collections::HashSet::new();

        for &id in partition {
            pending.insert(id);
            let tree = Arc::clone(tree);
            let ctx = Arc::clone(&ctx);
            let permits = permits.clone();
            let timeout = self.read_timeout;
            tasks.spawn(async move {
                let _permit = match permits {
                    Some(semaphore) => match semaphore.acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(e) => return (id, Err(WriterError::Internal(e.to_string()))),
                    },
                    None => None,
                };
                (id, run_node(&tree, id, &ctx, timeout).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, outcome)) => {
                    pending.remove(&id);
                    match outcome {
                        Ok(TaskOutcome::Stored) => report.stored += 1,
                        Ok(TaskOutcome::Skipped) => report.skipped += 1,
                        Err(err) => {
                            let node = tree.node(id).label();
                            warn!(node = %node, error = %err, "node failed");
                            report.failures.push(NodeFailure {
                                node,
                                message: err.to_string(),
                                kind: err.failure_kind(),
                            });
                        }
                    }
                }
                Err(join_err) => warn!(error = %join_err, "node task aborted"),
            }
        }

        // Tasks that never reported back panicked or were cancelled.
        for id in pending {
            report.failures.push(NodeFailure {
                node: tree.node(id).label(),
                message: "task panicked or was cancelled".into(),
                kind: FailureKind::Internal,
            });
        }

        // Completion order is arbitrary; keep reports stable.
        report.failures.sort_by(|a, b| a.node.cmp(&b.node));
        report.elapsed = started.elapsed();
        debug!(%report, "phase finished");
        report
    }

    /// Release the per-node resources of a partition that will never run again.
    pub fn close(&self, tree: &WriterTree, partition: &[NodeId]) {
        for &id in partition {
            tree.node(id).detach();
        }
    }
}

async fn run_node(
    tree: &WriterTree,
    id: NodeId,
    ctx: &ReadContext,
    timeout: Option<Duration>,
) -> WriterResult<TaskOutcome> {
    let node = tree.node(id);
    let Some(binding) = node.binding() else {
        return Ok(TaskOutcome::Skipped);
    };
    if !binding.is_triggered(ctx) {
        return Ok(TaskOutcome::Skipped);
    }
    let read = binding.source.read(ctx);
    let value = match timeout {
        Some(limit) => tokio::time::timeout(limit, read).await.map_err(|_| {
            WriterError::unavailable(
                binding.source.describe(),
                format!("read timed out after {limit:?}"),
            )
        })??,
        None => read.await?,
    };
    match value {
        Some(holder) => {
            node.store(&holder).await?;
            Ok(TaskOutcome::Stored)
        }
        None => Ok(TaskOutcome::Skipped),
    }
}
