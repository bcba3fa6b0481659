//! Command-line parsing.
//!
//! Hand-rolled flag parsing into a `RunConfig`; the binary stays a thin
//! shell around `parse_args` so every parsing rule is testable here.

use std::path::PathBuf;

use crate::dispatcher::{CopySpec, RunConfig};

/// Default sentinel path, relative to the working directory.
const DEFAULT_SENTINEL: &str = "fanout.stop";

/// Default remote scratch directory.
const DEFAULT_REMOTE_SCRATCH: &str = "/tmp";

/// What the command line asked for.
#[derive(Debug)]
pub enum CliCommand {
    Run(Box<RunConfig>),
    Help,
}

/// Parse the arguments after the binary name.
pub fn parse_args(args: &[String]) -> Result<CliCommand, String> {
    let mut cluster_path: Option<PathBuf> = None;
    let mut script: Option<String> = None;
    let mut task_path: Option<PathBuf> = None;
    let mut timeout_secs = 0u64;
    let mut result_path: Option<PathBuf> = None;
    let mut only = Vec::new();
    let mut exclude = Vec::new();
    let mut reserved_cores = 0u32;
    let mut copies = Vec::new();
    let mut env = Vec::new();
    let mut sentinel = PathBuf::from(DEFAULT_SENTINEL);
    let mut remote_scratch = DEFAULT_REMOTE_SCRATCH.to_string();
    let mut local_scratch: Option<PathBuf> = None;
    let mut verbose = false;
    let mut dry_run = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliCommand::Help),
            "--cluster" => cluster_path = Some(PathBuf::from(take_arg(&mut iter, arg)?)),
            "--script" => script = Some(take_arg(&mut iter, arg)?),
            "--tasks" => task_path = Some(PathBuf::from(take_arg(&mut iter, arg)?)),
            "--timeout" => {
                let value = take_arg(&mut iter, arg)?;
                timeout_secs = value
                    .parse()
                    .map_err(|_| format!("--timeout: '{}' is not a number of seconds", value))?;
            }
            "--results" => result_path = Some(PathBuf::from(take_arg(&mut iter, arg)?)),
            "--only" => only.extend(split_names(&take_arg(&mut iter, arg)?)),
            "--exclude" => exclude.extend(split_names(&take_arg(&mut iter, arg)?)),
            "--reserve" => {
                let value = take_arg(&mut iter, arg)?;
                reserved_cores = value
                    .parse()
                    .map_err(|_| format!("--reserve: '{}' is not a core count", value))?;
            }
            "--copy" => {
                let spec = take_arg(&mut iter, arg)?;
                copies.push(CopySpec::parse(&spec).map_err(|e| e.to_string())?);
            }
            "--env" => env.push(parse_env(&take_arg(&mut iter, arg)?)?),
            "--sentinel" => sentinel = PathBuf::from(take_arg(&mut iter, arg)?),
            "--scratch" => remote_scratch = take_arg(&mut iter, arg)?,
            "--local-scratch" => local_scratch = Some(PathBuf::from(take_arg(&mut iter, arg)?)),
            "--verbose" | "-v" => verbose = true,
            "--dry-run" => dry_run = true,
            other => return Err(format!("unknown argument '{}'", other)),
        }
    }

    let cluster_path = cluster_path.ok_or("--cluster is required")?;
    let script = script.ok_or("--script is required")?;
    let task_path = task_path.ok_or("--tasks is required")?;
    if script.trim().is_empty() {
        return Err("--script: path is empty".into());
    }

    let local_scratch = local_scratch.unwrap_or_else(std::env::temp_dir);
    Ok(CliCommand::Run(Box::new(RunConfig {
        cluster_path,
        script,
        task_path,
        timeout_secs,
        result_path,
        only,
        exclude,
        reserved_cores,
        copies,
        env,
        sentinel,
        remote_scratch,
        local_scratch,
        verbose,
        dry_run,
    })))
}

fn take_arg(iter: &mut std::slice::Iter<'_, String>, flag: &str) -> Result<String, String> {
    iter.next()
        .map(|s| s.to_string())
        .ok_or_else(|| format!("{} requires a value", flag))
}

fn split_names(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_env(value: &str) -> Result<(String, String), String> {
    let (key, val) = value
        .split_once('=')
        .ok_or_else(|| format!("--env: '{}' is not KEY=value", value))?;
    if key.is_empty() {
        return Err(format!("--env: '{}' has an empty key", value));
    }
    Ok((key.to_string(), val.to_string()))
}

/// Usage text printed for `--help` and argument errors.
pub fn usage() -> String {
    "\
fanout — dispatch tasks across a cluster over SSH

USAGE:
    fanout --cluster <yaml> --script <path> --tasks <file> [OPTIONS]

REQUIRED:
    --cluster <yaml>        cluster descriptor listing worker nodes
    --script <path>         worker-script path, present on every node
    --tasks <file>          task file, one JSON payload per line

OPTIONS:
    --timeout <secs>        per-task timeout (default: none)
    --results <file>        result file (default: under the temp dir)
    --only <names>          comma-separated allow list of node names
    --exclude <names>       comma-separated deny list of node names
    --reserve <n>           cores left unused on every node (default: 0)
    --copy <src:dst>        copy a local resource to every node first
                            (repeatable)
    --env <KEY=value>       environment for every worker invocation
                            (repeatable)
    --sentinel <path>       cancellation sentinel (default: fanout.stop)
    --scratch <dir>         remote scratch directory (default: /tmp)
    --local-scratch <dir>   local scratch directory (default: temp dir)
    --dry-run               probe the cluster and count tasks, run nothing
    -v, --verbose           progress output on stderr
    -h, --help              this text
"
    .to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
