//! Stderr logging with a verbosity gate.
//!
//! All diagnostics go to stderr with a `fanout:` prefix so the result
//! stream (stdout or the result file) stays machine-readable. `warn` always
//! prints; `info` only when the run is verbose.

/// Cheap cloneable logger handed to every thread entry point.
#[derive(Debug, Clone)]
pub struct Logger {
    verbose: bool,
}

impl Logger {
    /// Create a logger. `verbose` enables `info` output.
    pub fn new(verbose: bool) -> Self {
        Logger { verbose }
    }

    /// A logger that only prints warnings (used as the test default).
    pub fn quiet() -> Self {
        Logger { verbose: false }
    }

    /// Progress output, suppressed unless verbose.
    pub fn info(&self, message: &str) {
        if self.verbose {
            eprintln!("fanout: {}", message);
        }
    }

    /// Always-printed diagnostics (skipped nodes, cleanup failures, ...).
    pub fn warn(&self, message: &str) {
        eprintln!("fanout: {}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_is_not_verbose() {
        let log = Logger::quiet();
        assert!(!log.verbose);
    }

    #[test]
    fn new_respects_flag() {
        assert!(Logger::new(true).verbose);
        assert!(!Logger::new(false).verbose);
    }

    #[test]
    fn logger_is_clone() {
        let log = Logger::new(true);
        let copy = log.clone();
        assert!(copy.verbose);
    }
}
