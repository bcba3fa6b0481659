//! The shared task queue.
//!
//! Loaded exactly once from a line-delimited JSON task file, then drained
//! concurrently by the worker threads. `pop` returning `None` is the
//! permanent "no more work" sentinel: no task is ever added after load, so
//! an empty queue means the run is winding down, not that a worker should
//! wait.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One unit of submitted work. The payload is opaque to the dispatcher;
/// only the worker script interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// 1-indexed, monotonically increasing submission id.
    pub id: u64,
    /// Job-specific data, one JSON value per task-file line.
    pub payload: Value,
}

// ---------------------------------------------------------------------------
// TaskQueue
// ---------------------------------------------------------------------------

/// A mutation-safe FIFO of pending tasks under a single queue-wide lock.
#[derive(Debug)]
pub struct TaskQueue {
    inner: Mutex<VecDeque<Task>>,
}

impl TaskQueue {
    /// Parse a task file's contents: one JSON payload per line, blank lines
    /// skipped, ids assigned sequentially from 1 in file order.
    pub fn parse(content: &str) -> Result<Vec<Task>, String> {
        let mut tasks = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let payload: Value = serde_json::from_str(line)
                .map_err(|e| format!("line {}: invalid task payload: {}", line_no + 1, e))?;
            tasks.push(Task {
                id: tasks.len() as u64 + 1,
                payload,
            });
        }
        Ok(tasks)
    }

    /// Load the queue from a task file.
    pub fn load(path: &Path) -> Result<TaskQueue, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        Ok(Self::from_tasks(Self::parse(&content)?))
    }

    /// Build a queue from already-parsed tasks (testing, resubmission).
    pub fn from_tasks(tasks: Vec<Task>) -> TaskQueue {
        TaskQueue {
            inner: Mutex::new(tasks.into()),
        }
    }

    /// Remove and return the head task; `None` means permanently empty.
    pub fn pop(&self) -> Option<Task> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Pop until empty. Only valid after every worker has stopped
    /// dequeuing; used to recover unstarted work on cancellation.
    pub fn drain_remaining(&self) -> Vec<Task> {
        let mut remaining = Vec::new();
        while let Some(task) = self.pop() {
            remaining.push(task);
        }
        remaining
    }

    /// Number of tasks still queued.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
