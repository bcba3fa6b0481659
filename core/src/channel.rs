//! Remote command channel — the sole I/O primitive of the dispatcher.
//!
//! `RemoteChannel` pairs one cluster node with a `CommandRunner` and turns
//! high-level operations (execute, push, pull, remove) into ssh/scp command
//! lines. Timeouts are enforced client-side: the remote command is wrapped
//! in `timeout <n>s sh -c '...'` so that multi-statement commands cannot
//! escape the limit. Nothing here retries; callers decide whether a failure
//! discards a task or aborts the run.

use std::path::Path;
use std::sync::Arc;

use crate::cluster::ClusterNode;
use crate::runner::CommandRunner;

/// ConnectTimeout for ordinary exec/transfer operations.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// ConnectTimeout for the liveness ping; short so dead nodes fail fast.
const PING_TIMEOUT_SECS: u64 = 1;

/// Exit code `timeout(1)` uses when the wrapped command overran.
const TIMEOUT_EXIT_CODE: i32 = 124;

// ---------------------------------------------------------------------------
// ExecOutcome
// ---------------------------------------------------------------------------

/// The result of one remote command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    /// Remote exit code (124 when the client-side timeout fired).
    pub exit_code: i32,
    /// Combined stdout/stderr of the ssh invocation.
    pub output: String,
    /// Whether the client-side timeout killed the command.
    pub timed_out: bool,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

// ---------------------------------------------------------------------------
// RemoteChannel
// ---------------------------------------------------------------------------

/// Executes commands on, and copies files to/from, a single node.
#[derive(Clone)]
pub struct RemoteChannel {
    node: ClusterNode,
    runner: Arc<dyn CommandRunner>,
}

impl RemoteChannel {
    pub fn new(node: ClusterNode, runner: Arc<dyn CommandRunner>) -> Self {
        RemoteChannel { node, runner }
    }

    /// The node this channel talks to.
    pub fn node(&self) -> &ClusterNode {
        &self.node
    }

    /// Liveness check: `ssh ... echo ok` with a 1-second connect timeout.
    pub fn ping(&self) -> bool {
        let cmd = format!(
            "ssh {} echo ok",
            self.node.ssh_base_args(PING_TIMEOUT_SECS).join(" ")
        );
        match self.runner.run(&cmd) {
            Ok(out) => out.success() && out.stdout.trim() == "ok",
            Err(_) => false,
        }
    }

    /// Execute `command` on the node, blocking for the round trip.
    ///
    /// `timeout_secs == 0` means unbounded. `Err` is an infrastructure
    /// failure (ssh could not be spawned); a remote non-zero exit comes back
    /// as `Ok` with the code so callers can distinguish timeout (124) from
    /// ordinary failure.
    pub fn exec(&self, command: &str, timeout_secs: u64) -> Result<ExecOutcome, String> {
        let wrapped = if timeout_secs > 0 {
            format!("timeout {}s sh -c {}", timeout_secs, shell_quote(command))
        } else {
            format!("sh -c {}", shell_quote(command))
        };
        let cmd = format!(
            "ssh {} {}",
            self.node.ssh_base_args(CONNECT_TIMEOUT_SECS).join(" "),
            shell_quote(&wrapped)
        );
        let out = self.runner.run(&cmd)?;
        let timed_out = timeout_secs > 0 && out.exit_code == TIMEOUT_EXIT_CODE;
        let mut output = out.stdout;
        if !out.stderr.is_empty() {
            output.push_str(&out.stderr);
        }
        Ok(ExecOutcome {
            exit_code: out.exit_code,
            output,
            timed_out,
        })
    }

    /// Copy a local file or directory to a remote path (recursive).
    pub fn push(&self, local: &Path, remote: &str) -> Result<(), String> {
        let cmd = format!(
            "scp {} {} {}:{}",
            self.node.scp_base_args(CONNECT_TIMEOUT_SECS).join(" "),
            shell_quote(&local.to_string_lossy()),
            self.node.user_at_host(),
            shell_quote(remote)
        );
        self.transfer(&cmd)
    }

    /// Copy a remote file or directory to a local path (recursive).
    pub fn pull(&self, remote: &str, local: &Path) -> Result<(), String> {
        let cmd = format!(
            "scp {} {}:{} {}",
            self.node.scp_base_args(CONNECT_TIMEOUT_SECS).join(" "),
            self.node.user_at_host(),
            shell_quote(remote),
            shell_quote(&local.to_string_lossy())
        );
        self.transfer(&cmd)
    }

    /// Delete remote paths. Callers treat failure as best-effort and only log.
    pub fn remove(&self, remote_paths: &[String]) -> Result<(), String> {
        let quoted: Vec<String> = remote_paths.iter().map(|p| shell_quote(p)).collect();
        let outcome = self.exec(&format!("rm -f {}", quoted.join(" ")), CONNECT_TIMEOUT_SECS)?;
        if outcome.success() {
            Ok(())
        } else {
            Err(format!("rm exit {}: {}", outcome.exit_code, outcome.output.trim()))
        }
    }

    fn transfer(&self, cmd: &str) -> Result<(), String> {
        let out = self.runner.run(cmd)?;
        if out.success() {
            Ok(())
        } else {
            Err(format!(
                "scp exit {}: {}",
                out.exit_code,
                out.stderr.trim()
            ))
        }
    }
}

/// Quote a string for the shell (single quotes, embedded quotes escaped).
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{MockRunner, RunOutput};

    fn make_node() -> ClusterNode {
        ClusterNode {
            name: "r1".to_string(),
            host: "10.0.0.1".to_string(),
            port: 22,
            user: "ubuntu".to_string(),
            logical_cores: None,
            unused_cores: None,
        }
    }

    fn channel_with(runner: MockRunner) -> (RemoteChannel, Arc<MockRunner>) {
        let runner = Arc::new(runner);
        let channel = RemoteChannel::new(make_node(), Arc::clone(&runner) as Arc<dyn CommandRunner>);
        (channel, runner)
    }

    // -- Quoting --

    #[test]
    fn shell_quote_plain() {
        assert_eq!(shell_quote("abc"), "'abc'");
    }

    #[test]
    fn shell_quote_embedded_quote() {
        assert_eq!(shell_quote("a'b"), r"'a'\''b'");
    }

    // -- Ping --

    #[test]
    fn ping_ok() {
        let (channel, runner) =
            channel_with(MockRunner::with_responses(vec![Ok(RunOutput::ok("ok\n"))]));
        assert!(channel.ping());
        let cmds = runner.executed_commands();
        assert!(cmds[0].starts_with("ssh "));
        assert!(cmds[0].contains("ConnectTimeout=1"));
        assert!(cmds[0].contains("ubuntu@10.0.0.1"));
        assert!(cmds[0].ends_with("echo ok"));
    }

    #[test]
    fn ping_unexpected_output_is_dead() {
        let (channel, _) = channel_with(MockRunner::with_responses(vec![Ok(RunOutput::ok(
            "Warning: banner\n",
        ))]));
        assert!(!channel.ping());
    }

    #[test]
    fn ping_spawn_failure_is_dead() {
        let (channel, _) =
            channel_with(MockRunner::with_responses(vec![Err("no ssh binary".into())]));
        assert!(!channel.ping());
    }

    #[test]
    fn ping_nonzero_exit_is_dead() {
        let (channel, _) = channel_with(MockRunner::with_responses(vec![Ok(RunOutput::exit(
            255,
            "Connection timed out",
        ))]));
        assert!(!channel.ping());
    }

    // -- Exec --

    #[test]
    fn exec_wraps_in_timeout() {
        let (channel, runner) =
            channel_with(MockRunner::with_responses(vec![Ok(RunOutput::ok("hi\n"))]));
        let outcome = channel.exec("echo hi", 30).unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.output, "hi\n");
        let cmd = &runner.executed_commands()[0];
        assert!(cmd.contains("timeout 30s sh -c"));
        assert!(cmd.contains("echo hi"));
    }

    #[test]
    fn exec_zero_timeout_is_unbounded() {
        let (channel, runner) =
            channel_with(MockRunner::with_responses(vec![Ok(RunOutput::ok(""))]));
        channel.exec("echo hi", 0).unwrap();
        let cmd = &runner.executed_commands()[0];
        assert!(!cmd.contains("timeout "));
        assert!(cmd.contains("sh -c"));
    }

    #[test]
    fn exec_detects_timeout_exit() {
        let (channel, _) =
            channel_with(MockRunner::with_responses(vec![Ok(RunOutput::exit(124, ""))]));
        let outcome = channel.exec("sleep 999", 1).unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success());
    }

    #[test]
    fn exec_124_without_timeout_is_not_timeout() {
        // Unbounded runs cannot time out even if the script itself exits 124.
        let (channel, _) =
            channel_with(MockRunner::with_responses(vec![Ok(RunOutput::exit(124, ""))]));
        let outcome = channel.exec("exit 124", 0).unwrap();
        assert!(!outcome.timed_out);
        assert_eq!(outcome.exit_code, 124);
    }

    #[test]
    fn exec_combines_stdout_and_stderr() {
        let (channel, _) = channel_with(MockRunner::with_responses(vec![Ok(RunOutput {
            exit_code: 1,
            stdout: "partial\n".into(),
            stderr: "boom\n".into(),
        })]));
        let outcome = channel.exec("cmd", 0).unwrap();
        assert_eq!(outcome.output, "partial\nboom\n");
        assert!(!outcome.success());
    }

    #[test]
    fn exec_propagates_spawn_failure() {
        let (channel, _) = channel_with(MockRunner::with_responses(vec![Err("fork failed".into())]));
        assert!(channel.exec("cmd", 0).is_err());
    }

    // -- Transfers --

    #[test]
    fn push_builds_scp_command() {
        let (channel, runner) =
            channel_with(MockRunner::with_responses(vec![Ok(RunOutput::ok(""))]));
        channel
            .push(Path::new("/local/task.json"), "/tmp/task.json")
            .unwrap();
        let cmd = &runner.executed_commands()[0];
        assert!(cmd.starts_with("scp -r"));
        assert!(cmd.contains("'/local/task.json'"));
        assert!(cmd.contains("ubuntu@10.0.0.1:'/tmp/task.json'"));
    }

    #[test]
    fn pull_reverses_direction() {
        let (channel, runner) =
            channel_with(MockRunner::with_responses(vec![Ok(RunOutput::ok(""))]));
        channel
            .pull("/tmp/out.json", Path::new("/local/out.json"))
            .unwrap();
        let cmd = &runner.executed_commands()[0];
        let remote_pos = cmd.find("ubuntu@10.0.0.1:'/tmp/out.json'").unwrap();
        let local_pos = cmd.find("'/local/out.json'").unwrap();
        assert!(remote_pos < local_pos, "remote must be the scp source");
    }

    #[test]
    fn transfer_failure_reports_stderr() {
        let (channel, _) = channel_with(MockRunner::with_responses(vec![Ok(RunOutput::exit(
            1,
            "No such file or directory\n",
        ))]));
        let err = channel
            .push(Path::new("/local/x"), "/remote/x")
            .unwrap_err();
        assert!(err.contains("No such file"));
    }

    // -- Remove --

    #[test]
    fn remove_joins_paths() {
        let (channel, runner) =
            channel_with(MockRunner::with_responses(vec![Ok(RunOutput::ok(""))]));
        channel
            .remove(&["/tmp/a.task".to_string(), "/tmp/a.out".to_string()])
            .unwrap();
        let cmd = &runner.executed_commands()[0];
        assert!(cmd.contains("rm -f"));
        assert!(cmd.contains("/tmp/a.task"));
        assert!(cmd.contains("/tmp/a.out"));
    }

    #[test]
    fn remove_failure_is_reported_not_fatal() {
        let (channel, _) = channel_with(MockRunner::with_responses(vec![Ok(RunOutput::exit(
            1,
            "permission denied",
        ))]));
        assert!(channel
            .remove(&["/tmp/a.task".to_string()])
            .is_err());
    }
}
