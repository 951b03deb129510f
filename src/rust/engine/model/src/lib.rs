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

//! Shared data model for jobs, clusters and their statuses, as exchanged with the
//! metadata service and threaded through every component of the controller.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The lifecycle states a job may report to the metadata service.
///
/// Ordering here is advisory: it is used by tests to assert that happy-path
/// transitions only move forward, but nothing at runtime rejects an
/// out-of-order PATCH. The metadata service owns that concern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Created,
    Downloading,
    Queued,
    Running,
    Uploading,
    ErrorUploading,
    Complete,
    Terminating,
    Terminated,
    Error,
}

impl JobStatus {
    /// Relative ordering of the happy path, for test assertions only.
    pub fn rank(self) -> u8 {
        match self {
            JobStatus::Created => 0,
            JobStatus::Downloading => 1,
            JobStatus::Queued => 2,
            JobStatus::Running => 3,
            JobStatus::Uploading => 4,
            JobStatus::Complete => 5,
            JobStatus::ErrorUploading => 4,
            JobStatus::Terminating => 6,
            JobStatus::Terminated => 7,
            JobStatus::Error => 8,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Terminated | JobStatus::Error
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputSpec {
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputSpec {
    pub path: String,
    #[serde(default)]
    pub tail: bool,
    /// Lines tailed from `path` so far. Grows monotonically; never truncated.
    #[serde(default)]
    pub content: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OnComplete {
    pub cluster: Option<String>,
}

impl OnComplete {
    pub fn terminates_cluster(&self) -> bool {
        self.cluster.as_deref() == Some("terminate")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OnTerminate {
    #[serde(default)]
    pub commands: Vec<String>,
}

/// Millisecond timing instrumentation reported on the status-ending PATCH.
/// Serializes as `{}` until at least one field has a value, matching the
/// metadata service's expectation of an always-present but often-empty object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Timings {
    #[serde(rename = "queued", skip_serializing_if = "Option::is_none")]
    pub queued_ms: Option<i64>,
    #[serde(rename = "running", skip_serializing_if = "Option::is_none")]
    pub running_ms: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub input: Vec<InputSpec>,
    #[serde(default)]
    pub output: Vec<OutputSpec>,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(rename = "onComplete", default)]
    pub on_complete: Option<OnComplete>,
    #[serde(rename = "onTerminate", default)]
    pub on_terminate: Option<OnTerminate>,
    pub status: JobStatus,
    #[serde(rename = "sgeId", default)]
    pub queue_job_id: Option<String>,
    #[serde(rename = "queuedTime", default)]
    pub queued_time: Option<DateTime<Utc>>,
    #[serde(rename = "runningTime", default)]
    pub running_time: Option<DateTime<Utc>>,
}

impl Job {
    /// Directory the job's inputs/outputs/script live under on the head node.
    pub fn job_dir(&self, base_dir: &str) -> String {
        format!("{base_dir}/{id}", base_dir = base_dir, id = self.id)
    }

    pub fn has_input(&self) -> bool {
        !self.input.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    Ec2,
    Traditional,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(rename = "parallelEnvironment", default)]
    pub parallel_environment: Option<String>,
    #[serde(rename = "numberOfSlots", default)]
    pub number_of_slots: Option<u32>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    pub system: Option<String>,
}

impl QueueConfig {
    /// Batch system name, defaulting to `"sge"` when the cluster's queue
    /// configuration is silent on the matter.
    pub fn system_or_default(&self) -> &str {
        self.system.as_deref().unwrap_or("sge")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    #[serde(rename = "type")]
    pub cluster_type: ClusterType,
    #[serde(default)]
    pub config: ClusterConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_job(status: JobStatus) -> Job {
        Job {
            id: "A".to_owned(),
            name: "a".to_owned(),
            commands: vec!["echo hi".to_owned()],
            input: Vec::new(),
            output: Vec::new(),
            params: BTreeMap::new(),
            on_complete: None,
            on_terminate: None,
            status,
            queue_job_id: None,
            queued_time: None,
            running_time: None,
        }
    }

    #[test]
    fn job_status_happy_path_is_monotonic() {
        let path = [
            JobStatus::Created,
            JobStatus::Downloading,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Uploading,
            JobStatus::Complete,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
        }
    }

    #[test]
    fn error_and_terminated_and_complete_are_terminal() {
        assert!(JobStatus::Complete.is_terminal());
        assert!(JobStatus::Terminated.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::ErrorUploading.is_terminal());
    }

    #[test]
    fn job_dir_joins_base_and_id() {
        let job = minimal_job(JobStatus::Created);
        assert_eq!(job.job_dir("jobs"), "jobs/A");
        assert_eq!(job.job_dir("."), "./A");
    }

    #[test]
    fn has_input_reflects_input_list() {
        let mut job = minimal_job(JobStatus::Created);
        assert!(!job.has_input());
        job.input.push(InputSpec {
            path: "in.txt".to_owned(),
        });
        assert!(job.has_input());
    }

    #[test]
    fn on_complete_terminates_cluster_only_for_terminate_value() {
        let terminate = OnComplete {
            cluster: Some("terminate".to_owned()),
        };
        assert!(terminate.terminates_cluster());

        let other = OnComplete {
            cluster: Some("keep".to_owned()),
        };
        assert!(!other.terminates_cluster());

        let absent = OnComplete { cluster: None };
        assert!(!absent.terminates_cluster());
    }

    #[test]
    fn queue_config_defaults_to_sge() {
        let config = QueueConfig { system: None };
        assert_eq!(config.system_or_default(), "sge");

        let explicit = QueueConfig {
            system: Some("SLURM".to_owned()),
        };
        assert_eq!(explicit.system_or_default(), "SLURM");
    }

    #[test]
    fn job_round_trips_through_json_with_camel_case_fields() {
        let json = serde_json::json!({
            "id": "A",
            "name": "a",
            "commands": ["echo hi"],
            "input": [],
            "output": [{"path": "out.txt", "tail": true, "content": ["line1"]}],
            "onComplete": {"cluster": "terminate"},
            "status": "queued",
            "sgeId": "42",
        });
        let job: Job = serde_json::from_value(json).expect("job should deserialize");
        assert_eq!(job.queue_job_id.as_deref(), Some("42"));
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.on_complete.unwrap().terminates_cluster());
        assert_eq!(job.output[0].content, vec!["line1".to_owned()]);

        let reserialized = serde_json::to_value(&job).unwrap();
        assert_eq!(reserialized["sgeId"], "42");
        assert_eq!(reserialized["status"], "queued");
    }

    #[test]
    fn timings_serializes_empty_object_when_unset() {
        let timings = Timings::default();
        let value = serde_json::to_value(&timings).unwrap();
        assert_eq!(value, serde_json::json!({}));
    }

    #[test]
    fn timings_serializes_only_set_fields() {
        let timings = Timings {
            queued_ms: Some(1200),
            running_ms: None,
        };
        let value = serde_json::to_value(&timings).unwrap();
        assert_eq!(value, serde_json::json!({"queued": 1200}));
    }
}
