//! The worker pool — one local thread per (node, core slot).
//!
//! Every thread owns a `RemoteChannel` to its node and repeatedly pulls
//! from the shared queue until it is empty or cancellation fires. A task
//! is driven through a push → execute → pull → cleanup cycle; exactly one
//! result record is appended per dequeued task, success or not. No task is
//! retried and no task is ever seen by two workers. Joining every thread
//! is the run's sole synchronization barrier.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::channel::{shell_quote, RemoteChannel};
use crate::cluster::probe::ProbedNode;
use crate::log::Logger;
use crate::queue::Task;
use crate::runner::CommandRunner;
use crate::sink::{FailureKind, ResultRecord};
use crate::state::RunState;

// ---------------------------------------------------------------------------
// JobSpec
// ---------------------------------------------------------------------------

/// Everything a worker thread needs to run one task besides the task
/// itself. Cloned into each thread.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Worker-script path, deployed identically on every node.
    pub script: String,
    /// `KEY=value` pairs prefixed to every invocation.
    pub env: Vec<(String, String)>,
    /// Per-task timeout in seconds; 0 means unbounded.
    pub timeout_secs: u64,
    /// Remote directory for scratch files.
    pub remote_scratch: String,
    /// Local directory for scratch files.
    pub local_scratch: PathBuf,
    /// Run-unique tag; combined with node and slot it keys every scratch
    /// path, so concurrent workers never collide without any locking.
    pub run_id: String,
}

/// Totals reported after every worker has joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolOutcome {
    pub completed: u64,
    pub failed: u64,
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Spawn `slots` worker threads per node, run the queue dry (or until
/// cancellation), and join them all.
pub fn run(
    nodes: &[ProbedNode],
    job: &JobSpec,
    state: &Arc<RunState>,
    runner: &Arc<dyn CommandRunner>,
    log: &Logger,
) -> Result<PoolOutcome, String> {
    let mut handles = Vec::new();
    for probed in nodes {
        for slot in 0..probed.slots {
            let channel = RemoteChannel::new(probed.node.clone(), Arc::clone(runner));
            let state = Arc::clone(state);
            let job = job.clone();
            let log = log.clone();
            handles.push(std::thread::spawn(move || {
                worker_loop(channel, slot, &job, &state, &log)
            }));
        }
    }

    let mut outcome = PoolOutcome::default();
    let mut panicked = 0usize;
    for handle in handles {
        match handle.join() {
            Ok((completed, failed)) => {
                outcome.completed += completed;
                outcome.failed += failed;
            }
            Err(_) => panicked += 1,
        }
    }
    if panicked > 0 {
        return Err(format!("{} worker thread(s) panicked", panicked));
    }
    Ok(outcome)
}

/// One worker thread: check cancellation, pop, execute, record, repeat.
fn worker_loop(
    channel: RemoteChannel,
    slot: u32,
    job: &JobSpec,
    state: &RunState,
    log: &Logger,
) -> (u64, u64) {
    let worker = format!("{}:{}", channel.node().name, slot);
    let mut completed = 0u64;
    let mut failed = 0u64;

    loop {
        if state.is_cancelled() {
            log.info(&format!("worker {} stopping on cancellation", worker));
            break;
        }
        let task = match state.queue.pop() {
            Some(task) => task,
            None => break,
        };

        let task_id = task.id;
        let record = execute_task(&channel, slot, job, task, &worker, log);
        if record.success {
            completed += 1;
        } else {
            failed += 1;
            log.info(&format!(
                "task {} failed on {}: {}",
                task_id,
                worker,
                record.error.as_deref().unwrap_or("unknown")
            ));
        }
        if let Err(e) = state.sink.append(&record) {
            log.warn(&format!("cannot record result for task {}: {}", task_id, e));
        }
    }
    (completed, failed)
}

/// Drive one task through push → execute → pull → cleanup.
fn execute_task(
    channel: &RemoteChannel,
    slot: u32,
    job: &JobSpec,
    task: Task,
    worker: &str,
    log: &Logger,
) -> ResultRecord {
    let started = Instant::now();
    let node = &channel.node().name;
    let tag = format!("fanout-{}-{}-{}", job.run_id, node, slot);
    let local_task = job.local_scratch.join(format!("{}.task", tag));
    let local_out = job.local_scratch.join(format!("{}.out", tag));
    let remote_task = format!("{}/{}.task", job.remote_scratch, tag);
    let remote_out = format!("{}/{}.out", job.remote_scratch, tag);

    let record = run_cycle(
        channel, slot, job, &task, worker, &local_task, &local_out, &remote_task, &remote_out,
        started,
    );

    // Best-effort cleanup on both sides; failures are logged, never fatal.
    let _ = std::fs::remove_file(&local_task);
    let _ = std::fs::remove_file(&local_out);
    if let Err(e) = channel.remove(&[remote_task, remote_out]) {
        log.info(&format!("scratch cleanup on '{}' failed: {}", node, e));
    }

    record
}

#[allow(clippy::too_many_arguments)]
fn run_cycle(
    channel: &RemoteChannel,
    slot: u32,
    job: &JobSpec,
    task: &Task,
    worker: &str,
    local_task: &PathBuf,
    local_out: &PathBuf,
    remote_task: &str,
    remote_out: &str,
    started: Instant,
) -> ResultRecord {
    let elapsed = |started: Instant| started.elapsed().as_millis() as u64;
    let fail = |kind, error: String| {
        ResultRecord::failed(task.clone(), worker, kind, error, elapsed(started))
    };

    // 1. Serialize the payload to a local scratch file.
    let line = match serde_json::to_string(&task.payload) {
        Ok(line) => line,
        Err(e) => return fail(FailureKind::Transfer, format!("cannot serialize payload: {}", e)),
    };
    if let Err(e) = std::fs::write(local_task, line) {
        return fail(FailureKind::Transfer, format!("cannot write scratch file: {}", e));
    }

    // 2. Push it to the node-and-slot-unique remote path.
    if let Err(e) = channel.push(local_task, remote_task) {
        return fail(FailureKind::Transfer, e);
    }

    // 3. Invoke the worker script, core-pinned, stdout to the out file,
    //    stderr discarded, wrapped in the run timeout.
    let command = job_command(job, slot, remote_task, remote_out);
    let outcome = match channel.exec(&command, job.timeout_secs) {
        Ok(outcome) => outcome,
        Err(e) => return fail(FailureKind::Exec, e),
    };
    if outcome.timed_out {
        return fail(
            FailureKind::Timeout,
            format!("timed out after {}s", job.timeout_secs),
        );
    }
    if !outcome.success() {
        return fail(
            FailureKind::Exec,
            format!("exit {}: {}", outcome.exit_code, outcome.output.trim()),
        );
    }

    // 4. Pull the stdout file back and read it as the task's output.
    if let Err(e) = channel.pull(remote_out, local_out) {
        return fail(FailureKind::Transfer, e);
    }
    match std::fs::read_to_string(local_out) {
        Ok(output) => ResultRecord::ok(task.clone(), worker, output, elapsed(started)),
        Err(e) => fail(FailureKind::Transfer, format!("cannot read pulled output: {}", e)),
    }
}

/// Build the remote invocation: env prefix, CPU-affinity pin to the slot,
/// the task file as sole argument, stdout redirected, stderr discarded.
fn job_command(job: &JobSpec, slot: u32, remote_task: &str, remote_out: &str) -> String {
    let mut prefix = String::new();
    if !job.env.is_empty() {
        prefix.push_str("env");
        for (key, value) in &job.env {
            prefix.push_str(&format!(" {}={}", key, shell_quote(value)));
        }
        prefix.push(' ');
    }
    format!(
        "{}taskset -c {} {} {} > {} 2>/dev/null",
        prefix,
        slot,
        shell_quote(&job.script),
        shell_quote(remote_task),
        shell_quote(remote_out)
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterNode;
    use crate::queue::TaskQueue;
    use crate::runner::RunOutput;
    use crate::sink::ResultSink;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Simulates a node's filesystem and script behind the `CommandRunner`
    /// seam: scp pushes record file content, exec "runs" the script against
    /// the pushed payload, scp pulls write the produced output locally.
    struct SimRunner {
        /// Remote path -> content.
        files: Mutex<HashMap<String, String>>,
        /// Payload lines in execution order.
        executed: Mutex<Vec<String>>,
        /// Payloads whose execution exits 1.
        fail_payloads: Vec<String>,
        /// Payloads whose execution hits the timeout (exit 124).
        slow_payloads: Vec<String>,
        /// Artificial per-exec latency.
        delay: Option<Duration>,
    }

    impl SimRunner {
        fn new() -> Self {
            SimRunner {
                files: Mutex::new(HashMap::new()),
                executed: Mutex::new(Vec::new()),
                fail_payloads: Vec::new(),
                slow_payloads: Vec::new(),
                delay: None,
            }
        }

        fn executed_payloads(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }

        fn unquote(token: &str) -> String {
            token.trim_matches('\'').to_string()
        }

        fn handle_scp(&self, cmd: &str) -> Result<RunOutput, String> {
            let tokens: Vec<&str> = cmd.split_whitespace().collect();
            let src = tokens[tokens.len() - 2];
            let dst = tokens[tokens.len() - 1];
            if dst.contains('@') {
                // Push: read the local file, store under the remote path.
                let local = Self::unquote(src);
                let remote = Self::unquote(dst.splitn(2, ':').nth(1).unwrap_or(""));
                match std::fs::read_to_string(&local) {
                    Ok(content) => {
                        self.files.lock().unwrap().insert(remote, content);
                        Ok(RunOutput::ok(""))
                    }
                    Err(e) => Ok(RunOutput::exit(1, &e.to_string())),
                }
            } else {
                // Pull: write the stored remote content to the local path.
                let remote = Self::unquote(src.splitn(2, ':').nth(1).unwrap_or(""));
                let local = Self::unquote(dst);
                match self.files.lock().unwrap().get(&remote) {
                    Some(content) => {
                        std::fs::write(&local, content).map_err(|e| e.to_string())?;
                        Ok(RunOutput::ok(""))
                    }
                    None => Ok(RunOutput::exit(1, "No such file or directory")),
                }
            }
        }

        fn handle_exec(&self, cmd: &str) -> Result<RunOutput, String> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            // Find which pushed task file this invocation references.
            let files = self.files.lock().unwrap().clone();
            let task_path = files
                .keys()
                .find(|path| path.ends_with(".task") && cmd.contains(path.as_str()))
                .cloned();
            let task_path = match task_path {
                Some(p) => p,
                None => return Ok(RunOutput::exit(1, "task file not pushed")),
            };
            let payload = files[&task_path].clone();
            self.executed.lock().unwrap().push(payload.clone());

            if self.slow_payloads.iter().any(|p| *p == payload) && cmd.contains("timeout ") {
                return Ok(RunOutput::exit(124, ""));
            }
            if self.fail_payloads.iter().any(|p| *p == payload) {
                return Ok(RunOutput::exit(1, "script blew up"));
            }
            let out_path = task_path.replace(".task", ".out");
            self.files
                .lock()
                .unwrap()
                .insert(out_path, format!("did:{}", payload));
            Ok(RunOutput::ok(""))
        }
    }

    impl CommandRunner for SimRunner {
        fn run(&self, cmd: &str) -> Result<RunOutput, String> {
            if cmd.starts_with("scp") {
                return self.handle_scp(cmd);
            }
            if cmd.contains("rm -f") {
                let mut files = self.files.lock().unwrap();
                files.retain(|path, _| !cmd.contains(path.as_str()));
                return Ok(RunOutput::ok(""));
            }
            if cmd.contains("taskset") {
                return self.handle_exec(cmd);
            }
            if cmd.contains("echo ok") {
                return Ok(RunOutput::ok("ok\n"));
            }
            Ok(RunOutput::ok(""))
        }
    }

    fn make_node(name: &str, slots: u32) -> ProbedNode {
        ProbedNode {
            node: ClusterNode {
                name: name.to_string(),
                host: format!("{}.local", name),
                port: 22,
                user: "u".to_string(),
                logical_cores: Some(slots),
                unused_cores: Some(0),
            },
            logical_cores: slots,
            slots,
        }
    }

    fn make_job(tag: &str, timeout_secs: u64) -> JobSpec {
        let local = std::env::temp_dir().join(format!("fanout-pool-{}-{}", tag, std::process::id()));
        std::fs::create_dir_all(&local).unwrap();
        JobSpec {
            script: "/opt/worker/run-job".to_string(),
            env: Vec::new(),
            timeout_secs,
            remote_scratch: "/tmp".to_string(),
            local_scratch: local,
            run_id: format!("{}-{}", tag, std::process::id()),
        }
    }

    fn make_state(tag: &str, tasks: &str) -> (Arc<RunState>, PathBuf) {
        let path = std::env::temp_dir().join(format!(
            "fanout-pool-{}-{}.results",
            tag,
            std::process::id()
        ));
        let sink = ResultSink::create(&path).unwrap();
        let queue = TaskQueue::from_tasks(TaskQueue::parse(tasks).unwrap());
        (Arc::new(RunState::new(queue, sink)), path)
    }

    fn read_records(path: &PathBuf) -> Vec<ResultRecord> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn cleanup(job: &JobSpec, results: &PathBuf) {
        let _ = std::fs::remove_dir_all(&job.local_scratch);
        let _ = std::fs::remove_file(results);
    }

    // -- Command building --

    #[test]
    fn job_command_pins_and_redirects() {
        let job = make_job("cmd", 60);
        let cmd = job_command(&job, 3, "/tmp/t.task", "/tmp/t.out");
        assert!(cmd.contains("taskset -c 3"));
        assert!(cmd.contains("'/opt/worker/run-job' '/tmp/t.task'"));
        assert!(cmd.ends_with("> '/tmp/t.out' 2>/dev/null"));
        cleanup(&job, &PathBuf::new());
    }

    #[test]
    fn job_command_env_prefix() {
        let mut job = make_job("env", 0);
        job.env = vec![
            ("ANT_HOME".to_string(), "/opt/ant".to_string()),
            ("MODE".to_string(), "all ops".to_string()),
        ];
        let cmd = job_command(&job, 0, "/tmp/t.task", "/tmp/t.out");
        assert!(cmd.starts_with("env ANT_HOME='/opt/ant' MODE='all ops' taskset"));
        cleanup(&job, &PathBuf::new());
    }

    // -- Happy path --

    #[test]
    fn every_task_gets_exactly_one_record() {
        let runner: Arc<dyn CommandRunner> = Arc::new(SimRunner::new());
        let nodes = vec![make_node("a", 1)];
        let job = make_job("happy", 0);
        let (state, results) = make_state("happy", "\"t1\"\n\"t2\"\n\"t3\"\n");

        let outcome = run(&nodes, &job, &state, &runner, &Logger::quiet()).unwrap();
        assert_eq!(outcome.completed, 3);
        assert_eq!(outcome.failed, 0);

        let records = read_records(&results);
        assert_eq!(records.len(), 3);
        let mut ids: Vec<u64> = records.iter().map(|r| r.task.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(records.iter().all(|r| r.success));
        assert!(records
            .iter()
            .any(|r| r.output.as_deref() == Some("did:\"t1\"")));
        cleanup(&job, &results);
    }

    #[test]
    fn multi_slot_pool_claims_each_task_once() {
        let sim = Arc::new(SimRunner::new());
        let runner: Arc<dyn CommandRunner> = sim.clone();
        let nodes = vec![make_node("a", 4)];
        let job = make_job("exclusive", 0);
        let tasks: String = (0..40).map(|i| format!("\"t{}\"\n", i)).collect();
        let (state, results) = make_state("exclusive", &tasks);

        let outcome = run(&nodes, &job, &state, &runner, &Logger::quiet()).unwrap();
        assert_eq!(outcome.completed, 40);

        // Multiset of executed payloads equals the submitted set exactly.
        let mut executed = sim.executed_payloads();
        executed.sort();
        let mut expected: Vec<String> = (0..40).map(|i| format!("\"t{}\"", i)).collect();
        expected.sort();
        assert_eq!(executed, expected);

        let mut ids: Vec<u64> = read_records(&results).iter().map(|r| r.task.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=40).collect::<Vec<u64>>());
        cleanup(&job, &results);
    }

    #[test]
    fn workers_spread_across_nodes() {
        let runner: Arc<dyn CommandRunner> = Arc::new(SimRunner::new());
        let nodes = vec![make_node("a", 2), make_node("b", 2)];
        let job = make_job("nodes", 0);
        let tasks: String = (0..20).map(|i| format!("{}\n", i)).collect();
        let (state, results) = make_state("nodes", &tasks);

        let outcome = run(&nodes, &job, &state, &runner, &Logger::quiet()).unwrap();
        assert_eq!(outcome.completed + outcome.failed, 20);

        let records = read_records(&results);
        let workers: std::collections::HashSet<String> =
            records.iter().map(|r| r.worker.clone()).collect();
        // Worker identities are node:slot pairs from the configured pool.
        for w in &workers {
            assert!(
                ["a:0", "a:1", "b:0", "b:1"].contains(&w.as_str()),
                "unexpected worker {}",
                w
            );
        }
        cleanup(&job, &results);
    }

    // -- Failure handling --

    #[test]
    fn failing_task_recorded_and_run_continues() {
        let mut sim = SimRunner::new();
        sim.fail_payloads = vec!["\"bad\"".to_string()];
        let runner: Arc<dyn CommandRunner> = Arc::new(sim);
        let nodes = vec![make_node("a", 1)];
        let job = make_job("fail", 0);
        let (state, results) = make_state("fail", "\"good\"\n\"bad\"\n\"also-good\"\n");

        let outcome = run(&nodes, &job, &state, &runner, &Logger::quiet()).unwrap();
        assert_eq!(outcome.completed, 2);
        assert_eq!(outcome.failed, 1);

        let records = read_records(&results);
        let bad = records.iter().find(|r| !r.success).unwrap();
        assert_eq!(bad.failure, Some(FailureKind::Exec));
        assert!(bad.error.as_deref().unwrap().contains("exit 1"));
        assert!(bad.output.is_none());
        cleanup(&job, &results);
    }

    #[test]
    fn timeout_recorded_as_timeout_kind() {
        let mut sim = SimRunner::new();
        sim.slow_payloads = vec!["\"slow\"".to_string()];
        let runner: Arc<dyn CommandRunner> = Arc::new(sim);
        let nodes = vec![make_node("a", 1)];
        let job = make_job("timeout", 5);
        let (state, results) = make_state("timeout", "\"slow\"\n\"fast\"\n");

        let outcome = run(&nodes, &job, &state, &runner, &Logger::quiet()).unwrap();
        assert_eq!(outcome.completed, 1);
        assert_eq!(outcome.failed, 1);

        let records = read_records(&results);
        let slow = records.iter().find(|r| !r.success).unwrap();
        assert_eq!(slow.failure, Some(FailureKind::Timeout));
        assert!(slow.error.as_deref().unwrap().contains("5s"));
        assert!(slow.output.is_none());
        cleanup(&job, &results);
    }

    #[test]
    fn pull_failure_is_transfer_failure() {
        /// Executes fine but "loses" the output file before the pull.
        struct NoOutput(SimRunner);
        impl CommandRunner for NoOutput {
            fn run(&self, cmd: &str) -> Result<RunOutput, String> {
                let result = self.0.run(cmd)?;
                if cmd.contains("taskset") {
                    self.0.files.lock().unwrap().retain(|p, _| !p.ends_with(".out"));
                }
                Ok(result)
            }
        }
        let runner: Arc<dyn CommandRunner> = Arc::new(NoOutput(SimRunner::new()));
        let nodes = vec![make_node("a", 1)];
        let job = make_job("pull", 0);
        let (state, results) = make_state("pull", "\"t\"\n");

        let outcome = run(&nodes, &job, &state, &runner, &Logger::quiet()).unwrap();
        assert_eq!(outcome.failed, 1);
        let records = read_records(&results);
        assert_eq!(records[0].failure, Some(FailureKind::Transfer));
        cleanup(&job, &results);
    }

    // -- Cancellation --

    #[test]
    fn pre_cancelled_state_stops_before_dequeue() {
        let sim = Arc::new(SimRunner::new());
        let runner: Arc<dyn CommandRunner> = sim.clone();
        let nodes = vec![make_node("a", 2)];
        let job = make_job("cancel", 0);
        let (state, results) = make_state("cancel", "1\n2\n3\n");
        state.cancel();

        let outcome = run(&nodes, &job, &state, &runner, &Logger::quiet()).unwrap();
        assert_eq!(outcome.completed + outcome.failed, 0);
        assert!(sim.executed_payloads().is_empty());
        assert_eq!(state.queue.drain_remaining().len(), 3);
        cleanup(&job, &results);
    }

    #[test]
    fn cancel_mid_run_preserves_remainder() {
        let mut sim = SimRunner::new();
        sim.delay = Some(Duration::from_millis(30));
        let runner: Arc<dyn CommandRunner> = Arc::new(sim);
        let nodes = vec![make_node("a", 1)];
        let job = make_job("midcancel", 0);
        let tasks: String = (0..10).map(|i| format!("{}\n", i)).collect();
        let (state, results) = make_state("midcancel", &tasks);

        let canceller = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(45));
                state.cancel();
            })
        };
        let outcome = run(&nodes, &job, &state, &runner, &Logger::quiet()).unwrap();
        canceller.join().unwrap();

        let recorded = (outcome.completed + outcome.failed) as usize;
        let remaining = state.queue.drain_remaining().len();
        assert_eq!(recorded + remaining, 10, "no task lost or duplicated");
        assert!(remaining > 0, "cancellation should leave unstarted work");
        assert_eq!(read_records(&results).len(), recorded);
        cleanup(&job, &results);
    }

    // -- Scratch hygiene --

    #[test]
    fn remote_scratch_cleaned_after_tasks() {
        let sim = Arc::new(SimRunner::new());
        let runner: Arc<dyn CommandRunner> = sim.clone();
        let nodes = vec![make_node("a", 1)];
        let job = make_job("clean", 0);
        let (state, results) = make_state("clean", "1\n2\n");

        run(&nodes, &job, &state, &runner, &Logger::quiet()).unwrap();
        assert!(
            sim.files.lock().unwrap().is_empty(),
            "remote scratch files should be removed"
        );
        cleanup(&job, &results);
    }

    #[test]
    fn scratch_paths_unique_per_slot() {
        let job = make_job("paths", 0);
        let a0 = format!("fanout-{}-a-0", job.run_id);
        let a1 = format!("fanout-{}-a-1", job.run_id);
        assert_ne!(a0, a1);
        cleanup(&job, &PathBuf::new());
    }
}
