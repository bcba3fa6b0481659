//! fanout-core — a distributed task dispatcher.
//!
//! A master process fans line-delimited JSON jobs out across a cluster of
//! SSH-reachable worker machines, runs a worker script against each job,
//! and collects one JSON result record per completed job into a single
//! stream. A sentinel file cancels a run cooperatively, preserving
//! unstarted work in a recovery file.
//!
//! Layering, leaves first: [`runner`] is the process-spawning seam,
//! [`channel`] builds SSH/scp command lines on top of it, [`cluster`]
//! describes and probes the machines, [`queue`]/[`sink`]/[`state`] hold the
//! shared run state, [`pool`] drives the worker threads, [`watcher`] polls
//! for cancellation, and [`dispatcher`] wires everything together.

pub mod channel;
pub mod cli;
pub mod cluster;
pub mod dispatcher;
pub mod errors;
pub mod log;
pub mod pool;
pub mod queue;
pub mod runner;
pub mod sink;
pub mod state;
pub mod watcher;
