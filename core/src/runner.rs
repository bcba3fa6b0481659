//! Command runner abstraction for executing shell commands.
//!
//! `CommandRunner` is the seam every remote operation goes through.
//! `ShellRunner` is the production implementation that spawns `sh -c`.
//! `MockRunner` is the test double that records calls and returns preset
//! responses. Unlike a plain success/failure split, runners report the raw
//! exit code: callers need it to recognise the `timeout(1)` convention of
//! exiting 124 when the wrapped command overran its limit.

use std::process::Command;
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// RunOutput
// ---------------------------------------------------------------------------

/// The captured result of one spawned command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    /// Process exit code (-1 if terminated by a signal).
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl RunOutput {
    /// Convenience constructor for a clean exit with the given stdout.
    pub fn ok(stdout: &str) -> Self {
        RunOutput {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    /// Convenience constructor for a non-zero exit.
    pub fn exit(code: i32, stderr: &str) -> Self {
        RunOutput {
            exit_code: code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    /// Whether the command exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// ---------------------------------------------------------------------------
// CommandRunner
// ---------------------------------------------------------------------------

/// Trait for executing shell command strings.
///
/// `Err` means the command could not be spawned at all; a command that ran
/// and exited non-zero is `Ok` with `exit_code != 0`.
pub trait CommandRunner: Send + Sync {
    fn run(&self, cmd: &str) -> Result<RunOutput, String>;
}

/// Production runner that spawns `sh -c <cmd>` and blocks until it exits.
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, cmd: &str) -> Result<RunOutput, String> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .output()
            .map_err(|e| format!("failed to execute: {}", e))?;
        Ok(RunOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// MockRunner
// ---------------------------------------------------------------------------

/// Test-double runner that records commands and returns pre-configured
/// responses in order. Internally locked so it can be shared across the
/// worker threads spawned in tests.
pub struct MockRunner {
    responses: Mutex<Vec<Result<RunOutput, String>>>,
    commands: Mutex<Vec<String>>,
}

impl MockRunner {
    pub fn with_responses(responses: Vec<Result<RunOutput, String>>) -> Self {
        let mut reversed = responses;
        reversed.reverse();
        MockRunner {
            responses: Mutex::new(reversed),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn new() -> Self {
        MockRunner {
            responses: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Every command string run so far, in call order.
    pub fn executed_commands(&self) -> Vec<String> {
        self.commands.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, cmd: &str) -> Result<RunOutput, String> {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(cmd.to_string());
        let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(response) = responses.pop() {
            response
        } else {
            Ok(RunOutput::ok(""))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
