//! Cluster probing — liveness, filtering, and core discovery.
//!
//! Turns the declared node list into the set of schedulable nodes. Each
//! step is a hard precondition for the next: unreachable nodes are dropped
//! (zero survivors aborts), the allow/deny lists are applied (empty result
//! aborts), and any surviving node without a static core count must answer
//! `nproc` over SSH (a node that cannot report its own concurrency cannot
//! be scheduled against safely, so that failure aborts the whole run).

use std::sync::Arc;

use crate::channel::RemoteChannel;
use crate::cluster::ClusterNode;
use crate::errors::FatalError;
use crate::log::Logger;
use crate::runner::CommandRunner;

/// Remote command used to read a node's logical core count.
const CORE_COUNT_COMMAND: &str = "nproc";

/// Timeout for the core-count command; generous, it is a trivial read.
const DISCOVERY_TIMEOUT_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// ProbeOptions / ProbedNode
// ---------------------------------------------------------------------------

/// Filtering and reservation knobs applied while probing.
#[derive(Debug, Clone, Default)]
pub struct ProbeOptions {
    /// Keep only nodes with these names (empty = keep all).
    pub only: Vec<String>,
    /// Drop nodes with these names (empty = drop none).
    pub exclude: Vec<String>,
    /// Cores reserved on every node unless the node overrides it.
    pub reserved_cores: u32,
}

/// A node that survived probing, with its resolved concurrency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbedNode {
    pub node: ClusterNode,
    /// Logical cores, static or discovered.
    pub logical_cores: u32,
    /// Worker threads to schedule on this node (`logical - reserved`).
    pub slots: u32,
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// Run the full probe sequence. Node order from the descriptor is preserved.
pub fn probe(
    nodes: Vec<ClusterNode>,
    opts: &ProbeOptions,
    runner: &Arc<dyn CommandRunner>,
    log: &Logger,
) -> Result<Vec<ProbedNode>, FatalError> {
    let alive = liveness_filter(nodes, runner, log)?;
    let kept = name_filter(alive, opts, log)?;
    let discovered = discover_cores(kept, runner)?;

    let mut probed = Vec::with_capacity(discovered.len());
    for (node, logical_cores) in discovered {
        let reserved = node.unused_cores.unwrap_or(opts.reserved_cores);
        let slots = logical_cores.saturating_sub(reserved);
        log.info(&format!(
            "node '{}': {} cores, {} usable slots",
            node.name, logical_cores, slots
        ));
        probed.push(ProbedNode {
            node,
            logical_cores,
            slots,
        });
    }
    Ok(probed)
}

/// Ping every node concurrently; drop and log the unreachable ones.
fn liveness_filter(
    nodes: Vec<ClusterNode>,
    runner: &Arc<dyn CommandRunner>,
    log: &Logger,
) -> Result<Vec<ClusterNode>, FatalError> {
    let handles: Vec<_> = nodes
        .iter()
        .map(|node| {
            let channel = RemoteChannel::new(node.clone(), Arc::clone(runner));
            std::thread::spawn(move || channel.ping())
        })
        .collect();

    let mut alive = Vec::new();
    for (node, handle) in nodes.into_iter().zip(handles) {
        let reachable = handle.join().unwrap_or(false);
        if reachable {
            alive.push(node);
        } else {
            log.warn(&format!("node '{}' unreachable, skipping", node.name));
        }
    }
    if alive.is_empty() {
        return Err(FatalError::NoReachableNodes);
    }
    Ok(alive)
}

/// Apply the allow list (default: all) intersected with the deny list
/// (default: none).
fn name_filter(
    nodes: Vec<ClusterNode>,
    opts: &ProbeOptions,
    log: &Logger,
) -> Result<Vec<ClusterNode>, FatalError> {
    let mut kept = Vec::new();
    for node in nodes {
        let allowed = opts.only.is_empty() || opts.only.iter().any(|n| *n == node.name);
        let denied = opts.exclude.iter().any(|n| *n == node.name);
        if allowed && !denied {
            kept.push(node);
        } else {
            log.info(&format!("node '{}' filtered out", node.name));
        }
    }
    if kept.is_empty() {
        return Err(FatalError::EmptyAfterFilter);
    }
    Ok(kept)
}

/// Resolve every node's logical core count, running `nproc` concurrently on
/// the ones without a static value.
fn discover_cores(
    nodes: Vec<ClusterNode>,
    runner: &Arc<dyn CommandRunner>,
) -> Result<Vec<(ClusterNode, u32)>, FatalError> {
    let handles: Vec<_> = nodes
        .iter()
        .map(|node| {
            if node.logical_cores.is_some() {
                return None;
            }
            let channel = RemoteChannel::new(node.clone(), Arc::clone(runner));
            Some(std::thread::spawn(move || {
                channel.exec(CORE_COUNT_COMMAND, DISCOVERY_TIMEOUT_SECS)
            }))
        })
        .collect();

    let mut out = Vec::with_capacity(nodes.len());
    for (node, handle) in nodes.into_iter().zip(handles) {
        let cores = match (node.logical_cores, handle) {
            (Some(cores), _) => cores,
            (None, Some(handle)) => {
                let result = handle.join().unwrap_or_else(|_| Err("probe thread panicked".into()));
                parse_core_count(result).map_err(|detail| FatalError::CoreDiscovery {
                    node: node.name.clone(),
                    detail,
                })?
            }
            (None, None) => unreachable!("handle spawned for every node without static cores"),
        };
        out.push((node, cores));
    }
    Ok(out)
}

fn parse_core_count(
    result: Result<crate::channel::ExecOutcome, String>,
) -> Result<u32, String> {
    let outcome = result?;
    if !outcome.success() {
        return Err(format!(
            "exit {}: {}",
            outcome.exit_code,
            outcome.output.trim()
        ));
    }
    let cores: u32 = outcome
        .output
        .trim()
        .parse()
        .map_err(|_| format!("unparsable core count '{}'", outcome.output.trim()))?;
    if cores == 0 {
        return Err("reported zero cores".into());
    }
    Ok(cores)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
