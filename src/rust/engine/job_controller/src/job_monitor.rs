// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Polls a batch-queue submission to completion via its [`QueueAdapter`],
//! driving the job through `queued` -> `running` -> `complete`/`error`, and
//! kicking off upload/termination follow-ups.
//!
//! Every tick ends in exactly one status PATCH, regardless of which branch
//! it took: tailed output and the status/timings decision are folded into
//! the same request, never split across two PATCHes for one tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use model::{Job, JobStatus, OutputSpec, Timings};
use queue_adapter::{QueueAdapter, QueueState};
use status_client::JobUpdate;
use task_executor::{Lane, Task, TaskOutcome};

use crate::controller::ControllerContext;
use crate::error::ControllerError;

pub struct JobMonitorTask {
    pub ctx: Arc<ControllerContext>,
    pub cluster: model::Cluster,
    pub job: Job,
    pub adapter: Arc<dyn QueueAdapter>,
    /// The script name the job was submitted under; SGE's `.o<id>`/`.e<id>`
    /// convention hangs the stdout/stderr capture files off of it.
    pub script_name: String,
}

impl Clone for JobMonitorTask {
    fn clone(&self) -> Self {
        JobMonitorTask {
            ctx: Arc::clone(&self.ctx),
            cluster: self.cluster.clone(),
            job: self.job.clone(),
            adapter: Arc::clone(&self.adapter),
            script_name: self.script_name.clone(),
        }
    }
}

#[async_trait]
impl Task for JobMonitorTask {
    fn label(&self) -> String {
        format!("job-monitor[job={}]", self.job.id)
    }

    async fn run(mut self: Box<Self>, _rt: &task_executor::TaskRuntime) -> TaskOutcome {
        match self.tick().await {
            Ok(Some(after)) => TaskOutcome::Retry { task: self, after },
            Ok(None) => TaskOutcome::Done,
            Err(err) if err.is_transient() => {
                log::warn!("{}: transient error, rescheduling: {err}", self.label());
                let after = self.ctx.poll_interval;
                TaskOutcome::Retry { task: self, after }
            }
            Err(err) => {
                log::error!("{}: {err}", self.label());
                let _ = self
                    .ctx
                    .status_client
                    .patch_job(&self.job.id, JobUpdate::new().status(JobStatus::Error))
                    .await;
                TaskOutcome::Done
            }
        }
    }
}

/// What a tick decided to do with any follow-up work, beyond the single
/// status PATCH every branch ends in.
#[derive(Default)]
struct Followup {
    enqueue_upload: bool,
    enqueue_terminate_cluster: bool,
}

impl JobMonitorTask {
    /// Everything but `status` itself comes from `self.job`, the snapshot
    /// this task was handed at enqueue time and keeps up to date as it
    /// progresses: the metadata service's `/status` endpoint (the only GET
    /// this controller depends on) hands back nothing else.
    async fn tick(&mut self) -> Result<Option<Duration>, ControllerError> {
        let current_status = self.ctx.status_client.get_status(&self.job.id).await?;
        if current_status == JobStatus::Terminated {
            log::debug!("{}: job already terminated, abandoning monitor", self.label());
            return Ok(None);
        }

        let queue_job_id = self
            .job
            .queue_job_id
            .clone()
            .ok_or_else(|| ControllerError::Unexpected("job has no queue id to monitor".to_string()))?;

        let status_cmd = self.adapter.job_status_command(&self.job, &queue_job_id);
        let output = self
            .ctx
            .session
            .execute_ignoring_exit_status(&status_cmd)
            .await?;
        let state = self.adapter.extract_job_status(&output)?;

        let is_terminating = current_status == JobStatus::Terminating;
        let job_dir = self.job.job_dir(&self.ctx.job_output_dir);

        let mut followup = Followup::default();
        let mut reschedule = true;

        let (new_status, timings) = match (state, is_terminating) {
            (QueueState::Gone, true) => {
                // Queue no longer knows about the job and termination was
                // requested: it has actually left the queue now.
                reschedule = false;
                (JobStatus::Terminated, Timings::default())
            }
            (QueueState::Gone, false) => {
                reschedule = false;
                let (status, timings, complete_followup) = self.decide_complete(&job_dir).await?;
                followup = complete_followup;
                (status, timings)
            }
            (_, true) => {
                // Still visible in the queue mid-termination: no transition
                // yet, just keep polling until it disappears.
                (current_status, Timings::default())
            }
            (state, false) => decide_queued_or_running(&mut self.job, state, current_status),
        };

        let tailed = self.tail_outputs(&job_dir).await?;
        let output_changed = tailed
            .iter()
            .zip(self.job.output.iter())
            .any(|(new, old)| new.content.len() != old.content.len());
        self.job.output = tailed;

        let mut update = JobUpdate::new().status(new_status).timings(&timings);
        if output_changed {
            update = update.output(&self.job.output);
        }
        self.ctx.status_client.patch_job(&self.job.id, update).await?;
        self.job.status = new_status;

        if followup.enqueue_upload {
            crate::controller::enqueue_upload(&self.ctx, self.cluster.clone(), self.job.clone());
        }
        if followup.enqueue_terminate_cluster {
            self.ctx.cluster_provisioner.terminate_cluster(&self.cluster).await;
        }

        Ok(reschedule.then_some(self.ctx.poll_interval))
    }

    /// The job has left the queue and termination was not requested:
    /// inspect stderr, then delegate the status/timings/followup decision
    /// to the pure [`finalize_complete`].
    async fn decide_complete(
        &mut self,
        job_dir: &str,
    ) -> Result<(JobStatus, Timings, Followup), ControllerError> {
        // The `pvw` job family is known to leave expected warnings on
        // stderr; skip the failure check for it rather than flooding every
        // such job into `error`.
        let mut errored = false;
        if self.job.name != "pvw" {
            let stderr_path = format!("{job_dir}/{}.e{}", self.script_name, self.job_dir_suffix());
            if let Some(size) = self.ctx.session.stat(&stderr_path).await? {
                if size > 0 {
                    log::warn!("{}: job left {size} bytes of stderr output in {stderr_path}", self.label());
                    errored = true;
                }
            }
        }

        Ok(finalize_complete(&mut self.job, errored))
    }

    /// Downloads each `tail: true` output's remote file and appends any
    /// lines beyond what's already recorded in `content`.
    async fn tail_outputs(&self, job_dir: &str) -> Result<Vec<OutputSpec>, ControllerError> {
        let mut updated = Vec::with_capacity(self.job.output.len());
        for spec in &self.job.output {
            let mut spec = spec.clone();
            if spec.tail {
                let remote_path = format!("{job_dir}/{}", spec.path);
                if self.ctx.session.isfile(&remote_path).await? {
                    let skip = spec.content.len() + 1;
                    let tail_cmd = format!("tail -n +{skip} {remote_path}");
                    // A non-zero exit here (e.g. a permissions hiccup) is
                    // logged and skipped for this tick rather than failing
                    // the whole job, matching the tail step's best-effort
                    // role; only a transport fault reschedules the tick.
                    match self.ctx.session.execute(&tail_cmd).await {
                        Ok(output) => {
                            let new_lines: Vec<String> = output
                                .lines()
                                .filter(|l| !l.is_empty())
                                .map(str::to_string)
                                .collect();
                            spec.content.extend(new_lines);
                        }
                        Err(err) if err.is_transient() => return Err(err.into()),
                        Err(err) => {
                            log::warn!(
                                "{}: failed to tail {remote_path}: {err}",
                                self.label()
                            );
                        }
                    }
                } else {
                    log::info!(
                        "{}: skipping tail of {remote_path} as file doesn't currently exist",
                        self.label()
                    );
                }
            }
            updated.push(spec);
        }
        Ok(updated)
    }

    fn job_dir_suffix(&self) -> String {
        self.job.queue_job_id.clone().unwrap_or_default()
    }
}

/// The job is still visible in the queue: pick `running` or `queued`,
/// capturing the `queued` -> `running` timing exactly at the edge. A free
/// function (rather than a `JobMonitorTask` method) since it only ever
/// touches `job`, never the SSH session or metadata client.
fn decide_queued_or_running(job: &mut Job, state: QueueState, current_status: JobStatus) -> (JobStatus, Timings) {
    if state == QueueState::Running {
        if current_status == JobStatus::Queued {
            let now = Utc::now();
            let queued_ms = job.queued_time.map(|queued| (now - queued).num_milliseconds());
            job.queued_time = None;
            job.running_time = Some(now);
            return (
                JobStatus::Running,
                Timings {
                    queued_ms,
                    running_ms: None,
                },
            );
        }
        (JobStatus::Running, Timings::default())
    } else {
        (JobStatus::Queued, Timings::default())
    }
}

/// The job has left the queue: decide complete vs. error, the `running`
/// timing, and whether an upload or cluster termination should follow.
/// `errored` is already resolved by the caller (the stderr check, skipped
/// for `pvw` jobs) so this stays pure and directly testable.
fn finalize_complete(job: &mut Job, errored: bool) -> (JobStatus, Timings, Followup) {
    let now = Utc::now();
    let running_ms = job.running_time.map(|running| (now - running).num_milliseconds());
    job.running_time = None;
    let timings = Timings {
        queued_ms: None,
        running_ms,
    };

    let mut followup = Followup::default();
    let status = if !job.output.is_empty() {
        followup.enqueue_upload = true;
        if errored {
            JobStatus::ErrorUploading
        } else {
            JobStatus::Uploading
        }
    } else {
        if !errored
            && job
                .on_complete
                .as_ref()
                .map(model::OnComplete::terminates_cluster)
                .unwrap_or(false)
        {
            followup.enqueue_terminate_cluster = true;
        }
        if errored {
            JobStatus::Error
        } else {
            JobStatus::Complete
        }
    };

    (status, timings, followup)
}

pub fn enqueue(ctx: &Arc<ControllerContext>, task: JobMonitorTask) {
    ctx.runtime.enqueue(Lane::Monitor, Box::new(task));
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::OutputSpec;

    fn fixture_job(status: JobStatus) -> Job {
        Job {
            id: "A".to_string(),
            name: "a".to_string(),
            commands: vec!["echo hi".to_string()],
            input: vec![],
            output: vec![],
            params: Default::default(),
            on_complete: None,
            on_terminate: None,
            status,
            queue_job_id: Some("42".to_string()),
            queued_time: None,
            running_time: None,
        }
    }

    #[test]
    fn entering_running_captures_queued_timing_and_clears_queued_time() {
        let queued_at = Utc::now() - chrono::Duration::milliseconds(1500);
        let mut job = fixture_job(JobStatus::Queued);
        job.queued_time = Some(queued_at);

        let (status, timings) = decide_queued_or_running(&mut job, QueueState::Running, JobStatus::Queued);

        assert_eq!(status, JobStatus::Running);
        assert!(timings.queued_ms.unwrap() >= 1500);
        assert!(job.queued_time.is_none());
        assert!(job.running_time.is_some());
    }

    #[test]
    fn already_running_does_not_recapture_queued_timing() {
        let mut job = fixture_job(JobStatus::Running);
        let (status, timings) = decide_queued_or_running(&mut job, QueueState::Running, JobStatus::Running);
        assert_eq!(status, JobStatus::Running);
        assert!(timings.queued_ms.is_none());
    }

    #[test]
    fn queued_state_stays_queued() {
        let mut job = fixture_job(JobStatus::Queued);
        let (status, _timings) = decide_queued_or_running(&mut job, QueueState::Queued, JobStatus::Queued);
        assert_eq!(status, JobStatus::Queued);
    }

    #[test]
    fn complete_with_no_output_and_no_on_complete_is_terminal() {
        let mut job = fixture_job(JobStatus::Running);
        job.running_time = Some(Utc::now());
        let (status, timings, followup) = finalize_complete(&mut job, false);
        assert_eq!(status, JobStatus::Complete);
        assert!(timings.running_ms.is_some());
        assert!(job.running_time.is_none());
        assert!(!followup.enqueue_upload);
        assert!(!followup.enqueue_terminate_cluster);
    }

    #[test]
    fn errored_with_no_output_transitions_to_error() {
        let mut job = fixture_job(JobStatus::Running);
        let (status, _timings, followup) = finalize_complete(&mut job, true);
        assert_eq!(status, JobStatus::Error);
        assert!(!followup.enqueue_upload);
    }

    #[test]
    fn complete_with_declared_output_downgrades_to_uploading() {
        let mut job = fixture_job(JobStatus::Running);
        job.output = vec![OutputSpec {
            path: "out.txt".to_string(),
            tail: true,
            content: vec![],
        }];
        let (status, _timings, followup) = finalize_complete(&mut job, false);
        assert_eq!(status, JobStatus::Uploading);
        assert!(followup.enqueue_upload);
    }

    #[test]
    fn errored_with_declared_output_downgrades_to_error_uploading() {
        let mut job = fixture_job(JobStatus::Running);
        job.output = vec![OutputSpec {
            path: "out.txt".to_string(),
            tail: true,
            content: vec![],
        }];
        let (status, _timings, followup) = finalize_complete(&mut job, true);
        assert_eq!(status, JobStatus::ErrorUploading);
        assert!(followup.enqueue_upload);
    }

    #[test]
    fn complete_with_on_complete_terminate_enqueues_termination() {
        let mut job = fixture_job(JobStatus::Running);
        job.on_complete = Some(model::OnComplete {
            cluster: Some("terminate".to_string()),
        });
        let (status, _timings, followup) = finalize_complete(&mut job, false);
        assert_eq!(status, JobStatus::Complete);
        assert!(followup.enqueue_terminate_cluster);
    }

    #[test]
    fn errored_job_does_not_trigger_on_complete_terminate() {
        let mut job = fixture_job(JobStatus::Running);
        job.on_complete = Some(model::OnComplete {
            cluster: Some("terminate".to_string()),
        });
        let (status, _timings, followup) = finalize_complete(&mut job, true);
        assert_eq!(status, JobStatus::Error);
        assert!(!followup.enqueue_terminate_cluster);
    }
}
