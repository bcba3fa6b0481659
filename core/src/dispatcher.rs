//! The dispatcher — the top-level run sequence.
//!
//! Validates the configuration, probes the cluster, loads the task queue,
//! propagates shared resources, then runs the worker pool under a
//! cancellation watcher. On completion (or cancellation) it writes the
//! recovery file and hands back a report for the caller to print. All
//! fatal errors surface here as `FatalError`; per-task failures never do.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::channel::RemoteChannel;
use crate::cluster;
use crate::cluster::probe::{self, ProbeOptions, ProbedNode};
use crate::errors::FatalError;
use crate::log::Logger;
use crate::pool::{self, JobSpec};
use crate::queue::TaskQueue;
use crate::runner::{CommandRunner, ShellRunner};
use crate::sink::ResultSink;
use crate::state::RunState;
use crate::watcher;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// One `source:destination` pair copied to every node before any task runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySpec {
    pub source: PathBuf,
    pub destination: String,
}

impl CopySpec {
    /// Parse `local:remote`. The split is on the first colon, so remote
    /// paths may contain colons but local ones may not.
    pub fn parse(spec: &str) -> Result<CopySpec, FatalError> {
        let (source, destination) = spec
            .split_once(':')
            .ok_or_else(|| FatalError::CopySpec(format!("'{}' is not source:destination", spec)))?;
        if source.is_empty() || destination.is_empty() {
            return Err(FatalError::CopySpec(format!(
                "'{}' has an empty source or destination",
                spec
            )));
        }
        if source == destination {
            return Err(FatalError::CopySpec(format!(
                "'{}' copies a path onto itself",
                spec
            )));
        }
        Ok(CopySpec {
            source: PathBuf::from(source),
            destination: destination.to_string(),
        })
    }
}

/// Everything a run needs, assembled by the CLI layer.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Cluster descriptor (YAML).
    pub cluster_path: PathBuf,
    /// Worker-script path on the nodes.
    pub script: String,
    /// Task file, one JSON payload per line.
    pub task_path: PathBuf,
    /// Per-task timeout in seconds; 0 disables the timeout.
    pub timeout_secs: u64,
    /// Result file; defaults to a pid-keyed file under the temp dir.
    pub result_path: Option<PathBuf>,
    /// Allow list of node names (empty = all).
    pub only: Vec<String>,
    /// Deny list of node names.
    pub exclude: Vec<String>,
    /// Cores reserved on every node unless overridden per node.
    pub reserved_cores: u32,
    /// Resources pushed to every node before dispatch.
    pub copies: Vec<CopySpec>,
    /// Environment injected into every worker invocation.
    pub env: Vec<(String, String)>,
    /// Sentinel path polled for cancellation.
    pub sentinel: PathBuf,
    /// Remote scratch directory.
    pub remote_scratch: String,
    /// Local scratch directory.
    pub local_scratch: PathBuf,
    pub verbose: bool,
    /// Probe and count, but dispatch nothing.
    pub dry_run: bool,
}

impl RunConfig {
    /// Check that every referenced local path exists before touching any
    /// node.
    pub fn validate(&self) -> Result<(), FatalError> {
        if !self.cluster_path.exists() {
            return Err(FatalError::MissingPath(self.cluster_path.clone()));
        }
        if !self.task_path.exists() {
            return Err(FatalError::MissingPath(self.task_path.clone()));
        }
        for copy in &self.copies {
            if !copy.source.exists() {
                return Err(FatalError::MissingPath(copy.source.clone()));
            }
        }
        Ok(())
    }
}

/// What the run did, for the CLI to print.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// `(name, slots)` per schedulable node, in descriptor order.
    pub node_slots: Vec<(String, u32)>,
    /// Total worker threads (sum of slots).
    pub workers: u32,
    /// Tasks loaded from the task file.
    pub tasks: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: bool,
    pub dry_run: bool,
    pub result_path: PathBuf,
    /// Written only when cancellation left unstarted tasks behind.
    pub recovery_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    config: RunConfig,
    runner: Arc<dyn CommandRunner>,
    log: Logger,
}

impl Dispatcher {
    pub fn new(config: RunConfig) -> Self {
        let log = Logger::new(config.verbose);
        Dispatcher {
            config,
            runner: Arc::new(ShellRunner),
            log,
        }
    }

    /// Swap the command runner (tests).
    pub fn with_runner(config: RunConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let log = Logger::new(config.verbose);
        Dispatcher {
            config,
            runner,
            log,
        }
    }

    /// Execute the full run sequence.
    pub fn run(&self) -> Result<RunReport, FatalError> {
        self.config.validate()?;

        let nodes = cluster::load(&self.config.cluster_path).map_err(FatalError::Descriptor)?;
        let opts = ProbeOptions {
            only: self.config.only.clone(),
            exclude: self.config.exclude.clone(),
            reserved_cores: self.config.reserved_cores,
        };
        let probed = probe::probe(nodes, &opts, &self.runner, &self.log)?;

        let queue = TaskQueue::load(&self.config.task_path).map_err(FatalError::TaskFile)?;
        let tasks = queue.len() as u64;
        let node_slots: Vec<(String, u32)> = probed
            .iter()
            .map(|p| (p.node.name.clone(), p.slots))
            .collect();
        let workers: u32 = node_slots.iter().map(|(_, s)| s).sum();
        if workers == 0 {
            return Err(FatalError::NoUsableSlots);
        }
        let result_path = self.result_path();

        if self.config.dry_run {
            return Ok(RunReport {
                node_slots,
                workers,
                tasks,
                completed: 0,
                failed: 0,
                cancelled: false,
                dry_run: true,
                result_path,
                recovery_path: None,
            });
        }

        std::fs::create_dir_all(&self.config.local_scratch)?;
        let sink = ResultSink::create(&result_path)
            .map_err(|e| FatalError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        self.propagate(&probed)?;
        let state = Arc::new(RunState::new(queue, sink));

        let watcher = watcher::start(&self.config.sentinel, &state, &self.log);
        let job = self.job_spec();
        let outcome = pool::run(&probed, &job, &state, &self.runner, &self.log);
        // Join the watcher even when the pool errored out.
        watcher.finish();
        let outcome = outcome.map_err(FatalError::Worker)?;

        let cancelled = state.is_cancelled();
        let recovery_path = self.write_recovery(&state)?;
        self.log.info(&format!(
            "run finished: {} completed, {} failed{}",
            outcome.completed,
            outcome.failed,
            if cancelled { ", cancelled" } else { "" }
        ));

        Ok(RunReport {
            node_slots,
            workers,
            tasks,
            completed: outcome.completed,
            failed: outcome.failed,
            cancelled,
            dry_run: false,
            result_path,
            recovery_path,
        })
    }

    fn result_path(&self) -> PathBuf {
        match &self.config.result_path {
            Some(path) => path.clone(),
            None => std::env::temp_dir().join(format!("fanout-{}.results", std::process::id())),
        }
    }

    fn job_spec(&self) -> JobSpec {
        let run_id = format!("{}-{:x}", std::process::id(), unix_seconds());
        JobSpec {
            script: self.config.script.clone(),
            env: self.config.env.clone(),
            timeout_secs: self.config.timeout_secs,
            remote_scratch: self.config.remote_scratch.clone(),
            local_scratch: self.config.local_scratch.clone(),
            run_id,
        }
    }

    /// Push every copy spec to every schedulable node, nodes in parallel.
    /// Any single failure aborts the run before a task is dispatched.
    fn propagate(&self, nodes: &[ProbedNode]) -> Result<(), FatalError> {
        for copy in &self.config.copies {
            self.log.info(&format!(
                "copying {} to {} on {} node(s)",
                copy.source.display(),
                copy.destination,
                nodes.len()
            ));
            let handles: Vec<_> = nodes
                .iter()
                .map(|probed| {
                    let channel =
                        RemoteChannel::new(probed.node.clone(), Arc::clone(&self.runner));
                    let copy = copy.clone();
                    std::thread::spawn(move || {
                        let name = channel.node().name.clone();
                        channel
                            .push(&copy.source, &copy.destination)
                            .map_err(|detail| (name, detail))
                    })
                })
                .collect();
            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err((node, detail))) => {
                        return Err(FatalError::Propagation { node, detail })
                    }
                    Err(_) => {
                        return Err(FatalError::Worker("copy thread panicked".into()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Persist unstarted tasks next to the task file so a cancelled run can
    /// be resubmitted as-is. Nothing is written when the queue drained.
    fn write_recovery(&self, state: &RunState) -> Result<Option<PathBuf>, FatalError> {
        let remaining = state.queue.drain_remaining();
        if remaining.is_empty() {
            return Ok(None);
        }
        let path = recovery_path_for(&self.config.task_path);
        let mut file = std::fs::File::create(&path)?;
        for task in &remaining {
            let line = serde_json::to_string(&task.payload)
                .map_err(|e| FatalError::TaskFile(e.to_string()))?;
            writeln!(file, "{}", line)?;
        }
        self.log.warn(&format!(
            "{} unstarted task(s) written to {}",
            remaining.len(),
            path.display()
        ));
        Ok(Some(path))
    }
}

/// The recovery file sits next to the task file: `<tasks>.recovery`.
pub fn recovery_path_for(task_path: &Path) -> PathBuf {
    let mut name = task_path.as_os_str().to_os_string();
    name.push(".recovery");
    PathBuf::from(name)
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
