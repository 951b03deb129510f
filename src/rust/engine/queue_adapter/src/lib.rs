// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

//! Capability set that a batch queueing system must implement in order to be driven
//! by the job and process monitors. Mirrors a single translation step: queue
//! concepts in, shell command text out (or vice versa for parsing).
//!
//! There is deliberately no reflective registry here: a caller that needs to pick
//! an adapter for a cluster does so with an explicit match over `Cluster::queue`,
//! one arm per linked-in adapter crate. Adding a queue system means adding a crate
//! and a match arm, not registering into this one.

use model::Job;

/// Where a submitted job currently sits, as reported by the queue system.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueState {
    Queued,
    Running,
    /// The job is no longer known to the queue (it has left `qstat`/equivalent).
    Gone,
}

#[derive(thiserror::Error, Debug)]
pub enum QueueAdapterError {
    #[error("unsupported queuing system: {0}")]
    Unsupported(String),
    #[error("could not interpret queue adapter output: {0}")]
    Protocol(String),
}

/// Key under which the queue-assigned job id is persisted on [`model::Job`],
/// e.g. `"sgeId"` for the SGE adapter.
pub trait QueueAdapter: Send + Sync {
    fn queue_job_id_key(&self) -> &'static str;

    /// Shell command that submits `script` (a path on the head node) to the queue.
    fn submit_job_command(&self, script: &str) -> String;

    /// Parse the queue-assigned job id out of the submit command's stdout.
    fn parse_job_id(&self, submit_output: &str) -> Result<String, QueueAdapterError>;

    /// Shell command that reports the current state of `job`'s queued submission.
    fn job_status_command(&self, job: &Job, queue_job_id: &str) -> String;

    /// Interpret the output of [`QueueAdapter::job_status_command`].
    fn extract_job_status(&self, status_output: &str) -> Result<QueueState, QueueAdapterError>;

    /// Shell command that cancels `job`'s queued submission.
    fn terminate_job_command(&self, queue_job_id: &str) -> String;
}
