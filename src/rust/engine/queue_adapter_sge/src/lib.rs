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

//! Sun/Son of Grid Engine queue adapter: the only queue system the distilled
//! job description format requires, and the default when a cluster's
//! `queue.system` is unset.

use model::Job;
use once_cell_regex::submit_job_id_re;
use queue_adapter::{QueueAdapter, QueueAdapterError, QueueState};

mod once_cell_regex {
    use regex::Regex;
    use std::sync::OnceLock;

    /// Matches SGE's `qsub` confirmation, e.g. `Your job 42 ("run") has been submitted`.
    pub fn submit_job_id_re() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"Your job (\d+) \(").expect("static regex"))
    }
}

pub const QUEUE_JOB_ID_KEY: &str = "sgeId";

#[derive(Clone, Copy, Debug, Default)]
pub struct SgeQueueAdapter;

impl SgeQueueAdapter {
    pub fn new() -> Self {
        SgeQueueAdapter
    }
}

impl QueueAdapter for SgeQueueAdapter {
    fn queue_job_id_key(&self) -> &'static str {
        QUEUE_JOB_ID_KEY
    }

    fn submit_job_command(&self, script: &str) -> String {
        format!("qsub {script}")
    }

    fn parse_job_id(&self, submit_output: &str) -> Result<String, QueueAdapterError> {
        submit_job_id_re()
            .captures(submit_output)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| {
                QueueAdapterError::Protocol(format!(
                    "could not find a job id in qsub output: {submit_output:?}"
                ))
            })
    }

    fn job_status_command(&self, _job: &Job, queue_job_id: &str) -> String {
        format!("qstat | awk -v id={queue_job_id} '$1==id'")
    }

    fn extract_job_status(&self, status_output: &str) -> Result<QueueState, QueueAdapterError> {
        let line = status_output.trim();
        if line.is_empty() {
            return Ok(QueueState::Gone);
        }
        let state = line
            .split_whitespace()
            .nth(4)
            .ok_or_else(|| QueueAdapterError::Protocol(format!("malformed qstat line: {line:?}")))?;
        // SGE encodes queued/hold/error-queued as variants all starting with 'q', and
        // running/transferring as 'r'/'t'. Anything else (e.g. 'd' deleting, 'E' error)
        // is something this adapter doesn't understand well enough to act on.
        if state.starts_with('q') || state.eq_ignore_ascii_case("hqw") || state.eq_ignore_ascii_case("eqw") {
            Ok(QueueState::Queued)
        } else if state.starts_with('r') || state.starts_with('t') {
            Ok(QueueState::Running)
        } else {
            Err(QueueAdapterError::Protocol(format!(
                "unrecognized SGE job state {state:?} in line {line:?}"
            )))
        }
    }

    fn terminate_job_command(&self, queue_job_id: &str) -> String {
        format!("qdel {queue_job_id}")
    }
}

/// Shell command used by the job controller to discover the number of slots in a
/// parallel environment, when the cluster config doesn't pin one down explicitly.
pub fn number_of_slots_command(parallel_environment: &str) -> String {
    format!("qconf -sp {parallel_environment}")
}

/// Parses the `slots  N` line out of `qconf -sp` output.
pub fn parse_number_of_slots(qconf_output: &str) -> Option<u32> {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"^slots\s+(\d+)").expect("static regex"));
    qconf_output
        .lines()
        .find_map(|line| re.captures(line))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_job_id_from_qsub_output() {
        let adapter = SgeQueueAdapter::new();
        let id = adapter
            .parse_job_id("Your job 42 (\"run.sh\") has been submitted\n")
            .unwrap();
        assert_eq!(id, "42");
    }

    #[test]
    fn rejects_unparseable_submit_output() {
        let adapter = SgeQueueAdapter::new();
        assert!(adapter.parse_job_id("qsub: command not found").is_err());
    }

    #[test]
    fn empty_qstat_line_means_gone() {
        let adapter = SgeQueueAdapter::new();
        assert_eq!(adapter.extract_job_status("").unwrap(), QueueState::Gone);
    }

    #[test]
    fn queued_state_is_recognized() {
        let adapter = SgeQueueAdapter::new();
        let line = "  42 0.55500 run.sh     alice        qw    07/27/2026 00:00:00                                    1";
        assert_eq!(adapter.extract_job_status(line).unwrap(), QueueState::Queued);
    }

    #[test]
    fn running_state_is_recognized() {
        let adapter = SgeQueueAdapter::new();
        let line = "  42 0.55500 run.sh     alice        r     07/27/2026 00:00:05 all.q@node001             1";
        assert_eq!(
            adapter.extract_job_status(line).unwrap(),
            QueueState::Running
        );
    }

    #[test]
    fn unrecognized_state_is_a_protocol_error() {
        let adapter = SgeQueueAdapter::new();
        let line = "  42 0.55500 run.sh     alice        zz    07/27/2026 00:00:05";
        assert!(adapter.extract_job_status(line).is_err());
    }

    #[test]
    fn parses_slots_from_qconf_output() {
        let output = "pe_name            orte\nslots              32\nuser_lists         NONE\n";
        assert_eq!(parse_number_of_slots(output), Some(32));
    }

    #[test]
    fn missing_slots_line_is_none() {
        assert_eq!(parse_number_of_slots("pe_name  orte\n"), None);
    }
}
