use std::fmt;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Fatal errors
// ---------------------------------------------------------------------------

/// Errors that abort the entire run before (or instead of) doing work.
///
/// Per-task failures are deliberately NOT represented here: a task that
/// fails on a remote node becomes a `success: false` result record and the
/// run carries on.
#[derive(Debug)]
pub enum FatalError {
    /// The cluster descriptor is unreadable or structurally invalid.
    Descriptor(String),
    /// Every declared node failed the liveness check.
    NoReachableNodes,
    /// The allow/deny lists filtered out every reachable node.
    EmptyAfterFilter,
    /// Core reservations clamped every surviving node to zero slots.
    NoUsableSlots,
    /// A surviving node could not report its core count.
    CoreDiscovery { node: String, detail: String },
    /// The task file is unreadable or contains a malformed line.
    TaskFile(String),
    /// The `source:destination` copy spec is invalid.
    CopySpec(String),
    /// The shared-resource copy to a node failed before any task ran.
    Propagation { node: String, detail: String },
    /// A worker thread died instead of reporting back.
    Worker(String),
    /// The result stream or recovery file could not be written.
    Io(std::io::Error),
    /// A path expected to exist does not.
    MissingPath(PathBuf),
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalError::Descriptor(msg) => {
                write!(f, "invalid cluster descriptor: {}", msg)
            }
            FatalError::NoReachableNodes => {
                write!(f, "no reachable nodes in cluster")
            }
            FatalError::EmptyAfterFilter => {
                write!(f, "no nodes left after allow/deny filtering")
            }
            FatalError::NoUsableSlots => {
                write!(f, "no usable worker slots: reservations consume every core")
            }
            FatalError::CoreDiscovery { node, detail } => {
                write!(f, "node '{}' cannot report its core count: {}", node, detail)
            }
            FatalError::TaskFile(msg) => write!(f, "invalid task file: {}", msg),
            FatalError::CopySpec(msg) => write!(f, "invalid copy spec: {}", msg),
            FatalError::Propagation { node, detail } => {
                write!(f, "failed to propagate resource to '{}': {}", node, detail)
            }
            FatalError::Worker(msg) => write!(f, "worker pool failure: {}", msg),
            FatalError::Io(e) => write!(f, "I/O error: {}", e),
            FatalError::MissingPath(path) => {
                write!(f, "path not found: {}", path.display())
            }
        }
    }
}

impl std::error::Error for FatalError {}

impl From<std::io::Error> for FatalError {
    fn from(e: std::io::Error) -> Self {
        FatalError::Io(e)
    }
}
