//! The result sink — one JSON record per completed job.
//!
//! A single append-only stream shared by every worker thread. Records land
//! in completion order, which is explicitly not submission order; each
//! record carries its task so consumers can re-index by id. The sink is
//! the only externally durable trace of a task's execution besides the
//! recovery file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::queue::Task;

// ---------------------------------------------------------------------------
// FailureKind
// ---------------------------------------------------------------------------

/// Why a task failed. Distinguishing timeout from other failures lets
/// downstream tooling treat overruns differently from crashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The worker script ran and exited non-zero (or ssh itself failed).
    Exec,
    /// The client-side timeout killed the job.
    Timeout,
    /// A scratch-file transfer to or from the node failed.
    Transfer,
}

// ---------------------------------------------------------------------------
// ResultRecord
// ---------------------------------------------------------------------------

/// The durable record of one task's execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// The task as submitted (id + payload).
    pub task: Task,
    /// Worker identity, `"<node>:<slot>"`.
    pub worker: String,
    pub success: bool,
    /// Worker-script stdout, present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Human-readable failure description, present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure classification, present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Wall-clock duration of the push-execute-pull cycle.
    pub duration_ms: u64,
}

impl ResultRecord {
    /// A successful execution with the pulled output.
    pub fn ok(task: Task, worker: &str, output: String, duration_ms: u64) -> Self {
        ResultRecord {
            task,
            worker: worker.to_string(),
            success: true,
            output: Some(output),
            error: None,
            failure: None,
            duration_ms,
        }
    }

    /// A failed execution. No output is recorded, only the error.
    pub fn failed(
        task: Task,
        worker: &str,
        kind: FailureKind,
        error: String,
        duration_ms: u64,
    ) -> Self {
        ResultRecord {
            task,
            worker: worker.to_string(),
            success: false,
            output: None,
            error: Some(error),
            failure: Some(kind),
            duration_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// ResultSink
// ---------------------------------------------------------------------------

/// Append-only, synchronized NDJSON writer.
#[derive(Debug)]
pub struct ResultSink {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl ResultSink {
    /// Create (or truncate) the result file.
    pub fn create(path: &Path) -> Result<ResultSink, String> {
        let file = File::create(path)
            .map_err(|e| format!("cannot create {}: {}", path.display(), e))?;
        Ok(ResultSink {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    /// Append one record and flush, so a crash loses at most the record
    /// being written.
    pub fn append(&self, record: &ResultRecord) -> Result<(), String> {
        let line = serde_json::to_string(record).map_err(|e| e.to_string())?;
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(writer, "{}", line).map_err(|e| e.to_string())?;
        writer.flush().map_err(|e| e.to_string())
    }

    /// Where the records are being written.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
