//! fanout CLI — dispatch shell-level tasks across a cluster over SSH.
//!
//! # Usage
//!
//! ```text
//! fanout --cluster cluster.yaml --script /opt/jobs/run --tasks tasks.ndjson
//! fanout --cluster cluster.yaml --script /opt/jobs/run --tasks tasks.ndjson \
//!        --timeout 300 --reserve 1 --copy model.bin:/opt/model.bin
//! ```

use std::process;

use fanout_core::cli::{parse_args, usage, CliCommand};
use fanout_core::dispatcher::{Dispatcher, RunReport};

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let command = match parse_args(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fanout: {}", e);
            eprintln!("{}", usage());
            process::exit(1);
        }
    };

    let config = match command {
        CliCommand::Help => {
            println!("{}", usage());
            return;
        }
        CliCommand::Run(config) => config,
    };

    match Dispatcher::new(*config).run() {
        Ok(report) => {
            print_report(&report);
            if report.cancelled {
                process::exit(2);
            }
        }
        Err(e) => {
            eprintln!("fanout: {}", e);
            process::exit(1);
        }
    }
}

fn print_report(report: &RunReport) {
    for (name, slots) in &report.node_slots {
        println!("node {}: {} slot(s)", name, slots);
    }
    if report.dry_run {
        println!(
            "dry run: {} task(s) across {} worker(s), nothing dispatched",
            report.tasks, report.workers
        );
        return;
    }
    println!(
        "{} task(s): {} completed, {} failed",
        report.tasks, report.completed, report.failed
    );
    println!("results: {}", report.result_path.display());
    if report.cancelled {
        println!("run cancelled");
        if let Some(recovery) = &report.recovery_path {
            println!("unstarted tasks: {}", recovery.display());
        }
    }
}
