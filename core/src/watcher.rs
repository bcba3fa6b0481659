//! Sentinel-file cancellation.
//!
//! A background thread polls for a sentinel path; the moment the file
//! exists, the shared run state is cancelled and the thread exits. Workers
//! finish their in-flight tasks and stop at their next dequeue, so
//! cancellation is cooperative and never kills a running job. The main
//! thread stops the watcher once the pool has drained, whichever came
//! first.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::log::Logger;
use crate::state::RunState;

/// How often the sentinel path is checked.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Handle to a running watcher thread.
pub struct WatcherHandle {
    done: Arc<AtomicBool>,
    handle: JoinHandle<bool>,
}

impl WatcherHandle {
    /// Stop the watcher and report whether the sentinel was ever seen.
    pub fn finish(self) -> bool {
        self.done.store(true, Ordering::SeqCst);
        self.handle.join().unwrap_or(false)
    }
}

/// Start watching `sentinel` at the default poll interval.
pub fn start(sentinel: &Path, state: &Arc<RunState>, log: &Logger) -> WatcherHandle {
    start_with_poll(sentinel, state, log, POLL_INTERVAL)
}

/// Start watching with an explicit poll interval (shortened in tests).
pub fn start_with_poll(
    sentinel: &Path,
    state: &Arc<RunState>,
    log: &Logger,
    poll: Duration,
) -> WatcherHandle {
    let done = Arc::new(AtomicBool::new(false));
    let handle = {
        let sentinel: PathBuf = sentinel.to_path_buf();
        let state = Arc::clone(state);
        let done = Arc::clone(&done);
        let log = log.clone();
        std::thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                if sentinel.exists() {
                    log.warn(&format!(
                        "sentinel {} found, cancelling run",
                        sentinel.display()
                    ));
                    state.cancel();
                    return true;
                }
                std::thread::sleep(poll);
            }
            false
        })
    };
    WatcherHandle { done, handle }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
