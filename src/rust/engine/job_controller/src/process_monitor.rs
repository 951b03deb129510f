// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Polls a single detached remote process to completion.
//!
//! State machine, polled once per tick:
//!   Observing -> the pid is still alive: reschedule.
//!   Draining  -> the pid has exited: pull down its captured output; a
//!                non-empty file means the command itself failed, so the
//!                job moves to `error` and nothing further runs.
//!   Done      -> no error output: fire the continuation (if any), unlink
//!                the staged script and its output file, and reconcile an
//!                in-flight upload's status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use model::{Cluster, Job, JobStatus};
use status_client::JobUpdate;
use task_executor::{Lane, Task, TaskOutcome};

use crate::continuation::Continuation;
use crate::controller::ControllerContext;
use crate::error::ControllerError;
use crate::stager::StagedScript;

pub struct ProcessMonitorTask {
    pub ctx: Arc<ControllerContext>,
    pub cluster: Cluster,
    pub job: Job,
    pub pid: u64,
    pub staged: StagedScript,
    pub output_file: String,
    /// Format string used when the observed process leaves non-empty
    /// output; `{}` is replaced with the captured content. Distinguishes
    /// `onTerminate` failures from ordinary command failures in the log
    /// and in the job's error status.
    pub output_message: String,
    pub on_complete: Continuation,
}

impl Clone for ProcessMonitorTask {
    fn clone(&self) -> Self {
        ProcessMonitorTask {
            ctx: Arc::clone(&self.ctx),
            cluster: self.cluster.clone(),
            job: self.job.clone(),
            pid: self.pid,
            staged: StagedScript {
                remote_path: self.staged.remote_path.clone(),
            },
            output_file: self.output_file.clone(),
            output_message: self.output_message.clone(),
            on_complete: self.on_complete.clone(),
        }
    }
}

#[async_trait]
impl Task for ProcessMonitorTask {
    fn label(&self) -> String {
        format!("process-monitor[job={}, pid={}]", self.job.id, self.pid)
    }

    async fn run(self: Box<Self>, _rt: &task_executor::TaskRuntime) -> TaskOutcome {
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

impl ProcessMonitorTask {
    /// Returns `Some(delay)` to reschedule, or `None` once the process has
    /// been fully handled (terminal state reached either way).
    async fn tick(&self) -> Result<Option<Duration>, ControllerError> {
        let current_status = self.ctx.status_client.get_status(&self.job.id).await?;
        if matches!(current_status, JobStatus::Terminating | JobStatus::Terminated) {
            log::debug!("{}: job is terminating, abandoning monitor", self.label());
            return Ok(None);
        }

        let alive = self
            .ctx
            .session
            .execute_ignoring_exit_status(&format!("ps -p {} -o pid=", self.pid))
            .await?;
        if !alive.trim().is_empty() {
            return Ok(Some(self.ctx.poll_interval));
        }

        // Draining: the process has exited. Any captured output is an error.
        let output = self.ctx.session.get(&self.output_file).await?;
        let output = output.unwrap_or_default();
        let trimmed = String::from_utf8_lossy(&output).trim().to_string();
        if !trimmed.is_empty() {
            let message = self.output_message.replace("{}", &trimmed);
            log::warn!("{}: {message}", self.label());
            self.ctx
                .status_client
                .patch_job(&self.job.id, JobUpdate::new().status(JobStatus::Error))
                .await?;
            self.cleanup().await?;
            return Ok(None);
        }

        self.on_complete.fire(&self.ctx, &self.cluster, &self.job).await;

        // Reconcile an in-flight upload: by the time its detached process
        // finishes, the job may have moved to `uploading` or
        // `error_uploading`; resolve those into their terminal status.
        let after_continuation = self.ctx.status_client.get_status(&self.job.id).await?;
        match after_continuation {
            JobStatus::Uploading => {
                self.ctx
                    .status_client
                    .patch_job(&self.job.id, JobUpdate::new().status(JobStatus::Complete))
                    .await?;
            }
            JobStatus::ErrorUploading => {
                self.ctx
                    .status_client
                    .patch_job(&self.job.id, JobUpdate::new().status(JobStatus::Error))
                    .await?;
            }
            _ => {}
        }

        self.cleanup().await?;
        Ok(None)
    }

    async fn cleanup(&self) -> Result<(), ControllerError> {
        crate::stager::unlink(&self.ctx.session, &self.staged).await?;
        self.ctx.session.unlink(&self.output_file).await?;
        Ok(())
    }
}

pub fn enqueue(ctx: &Arc<ControllerContext>, task: ProcessMonitorTask) {
    ctx.runtime.enqueue(Lane::Monitor, Box::new(task));
}
