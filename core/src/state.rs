//! Shared run state threaded into every thread entry point.
//!
//! Three independently synchronized regions: the task queue (its own
//! mutex), the result sink (its own mutex), and the cancellation flag (an
//! atomic). No operation ever holds two of them at once, so lock-ordering
//! deadlocks are impossible by construction. Held behind `Arc`, never
//! behind module-level statics.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::queue::TaskQueue;
use crate::sink::ResultSink;

/// Process-wide state for one dispatch run.
#[derive(Debug)]
pub struct RunState {
    pub queue: TaskQueue,
    pub sink: ResultSink,
    cancelled: AtomicBool,
}

impl RunState {
    pub fn new(queue: TaskQueue, sink: ResultSink) -> Self {
        RunState {
            queue,
            sink,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Flip the cancellation flag. Workers observe it before their next
    /// dequeue; in-flight tasks finish.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_state(tag: &str) -> (RunState, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!(
            "fanout-state-{}-{}.ndjson",
            tag,
            std::process::id()
        ));
        let sink = ResultSink::create(&path).unwrap();
        let queue = TaskQueue::from_tasks(TaskQueue::parse("1\n2\n").unwrap());
        (RunState::new(queue, sink), path)
    }

    #[test]
    fn starts_uncancelled() {
        let (state, path) = make_state("fresh");
        assert!(!state.is_cancelled());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn cancel_is_sticky() {
        let (state, path) = make_state("sticky");
        state.cancel();
        assert!(state.is_cancelled());
        state.cancel();
        assert!(state.is_cancelled());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn cancel_visible_across_threads() {
        use std::sync::Arc;

        let (state, path) = make_state("threads");
        let state = Arc::new(state);
        let s = Arc::clone(&state);
        std::thread::spawn(move || s.cancel()).join().unwrap();
        assert!(state.is_cancelled());
        let _ = std::fs::remove_file(&path);
    }
}
