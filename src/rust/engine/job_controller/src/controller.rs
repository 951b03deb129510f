// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The three entry points a caller (the worker binary's job-dispatch loop)
//! drives: [`submit`], [`terminate`], [`remove_output`]. Each enqueues a
//! task rather than running synchronously, so the caller never blocks on
//! SSH or the metadata service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use model::{Cluster, Job, JobStatus};
use queue_adapter::QueueAdapter;
use queue_adapter_sge::SgeQueueAdapter;
use remote_shell::RemoteShellSession;
use status_client::{JobUpdate, StatusClient};
use task_executor::{Lane, Task, TaskOutcome, TaskRuntime};

use crate::continuation::Continuation;
use crate::error::ControllerError;
use crate::job_monitor::JobMonitorTask;
use crate::process_monitor::{self, ProcessMonitorTask};
use crate::stager;
use crate::template::TemplateContext;

/// Everything the task bodies in this crate need: where to reach the
/// metadata service, the (single, reused) SSH session to the cluster's
/// head node, the task runtime to enqueue follow-up work on, and a few
/// ambient settings.
pub struct ControllerContext {
    pub status_client: StatusClient,
    pub session: RemoteShellSession,
    pub runtime: TaskRuntime,
    pub poll_interval: Duration,
    /// Base directory under which every job gets its own subdirectory.
    pub job_output_dir: String,
    /// Local filesystem path to the bundled girder data-transfer client
    /// script; staged onto the head node before each download/upload.
    pub girder_client_path: std::path::PathBuf,
    /// Bearer token the data-transfer client authenticates to the metadata
    /// service with; distinct from the controller's own token since it runs
    /// as a detached remote process outside of this binary's environment.
    pub girder_token: String,
    /// The cluster-provisioning subsystem boundary: `onComplete.cluster ==
    /// "terminate"` dispatches here, never through `terminate`'s job-level
    /// `qdel`/`onTerminate` path.
    pub cluster_provisioner: Arc<dyn crate::cluster::ClusterProvisioner>,
}

/// Resolves the queue adapter for `cluster`, by explicit dispatch over
/// `cluster.queue.system`. There is intentionally no registry to extend:
/// supporting a new queue system means adding a crate and a match arm here.
pub fn select_adapter(cluster: &Cluster) -> Result<Arc<dyn QueueAdapter>, ControllerError> {
    match cluster.queue.system_or_default() {
        "sge" => Ok(Arc::new(SgeQueueAdapter::new())),
        other => Err(ControllerError::UnsupportedQueueSystem(other.to_string())),
    }
}

pub fn submit(ctx: &Arc<ControllerContext>, cluster: Cluster, job: Job) {
    if job.has_input() {
        ctx.runtime.enqueue(
            Lane::Command,
            Box::new(DownloadTask {
                ctx: Arc::clone(ctx),
                cluster,
                job,
            }),
        );
    } else {
        enqueue_submit(ctx, cluster, job);
    }
}

pub fn terminate(ctx: &Arc<ControllerContext>, cluster: Cluster, job: Job) {
    enqueue_terminate(ctx, cluster, job);
}

pub fn remove_output(ctx: &Arc<ControllerContext>, job_dir: String) {
    ctx.runtime.enqueue(
        Lane::Command,
        Box::new(RemoveOutputTask {
            ctx: Arc::clone(ctx),
            job_dir,
            attempt: 0,
        }),
    );
}

pub(crate) fn enqueue_submit(ctx: &Arc<ControllerContext>, cluster: Cluster, job: Job) {
    ctx.runtime.enqueue(
        Lane::Command,
        Box::new(SubmitTask {
            ctx: Arc::clone(ctx),
            cluster,
            job,
        }),
    );
}

pub(crate) fn enqueue_terminate(ctx: &Arc<ControllerContext>, cluster: Cluster, job: Job) {
    ctx.runtime.enqueue(
        Lane::Command,
        Box::new(TerminateTask {
            ctx: Arc::clone(ctx),
            cluster,
            job,
        }),
    );
}

pub(crate) fn enqueue_upload(ctx: &Arc<ControllerContext>, cluster: Cluster, job: Job) {
    ctx.runtime.enqueue(
        Lane::Command,
        Box::new(UploadTask {
            ctx: Arc::clone(ctx),
            cluster,
            job,
        }),
    );
}

// ---------------------------------------------------------------------
// submit
// ---------------------------------------------------------------------

struct SubmitTask {
    ctx: Arc<ControllerContext>,
    cluster: Cluster,
    job: Job,
}

#[async_trait]
impl Task for SubmitTask {
    fn label(&self) -> String {
        format!("submit[job={}]", self.job.id)
    }

    async fn run(self: Box<Self>, _rt: &TaskRuntime) -> TaskOutcome {
        match self.exec().await {
            Ok(()) => TaskOutcome::Done,
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

impl SubmitTask {
    async fn exec(&self) -> Result<(), ControllerError> {
        let current_status = self.ctx.status_client.get_status(&self.job.id).await?;
        if current_status == JobStatus::Terminating {
            log::debug!("{}: job is terminating, skipping submission", self.label());
            return Ok(());
        }

        let current = &self.job;

        let job_dir = current.job_dir(&self.ctx.job_output_dir);
        self.ctx.session.mkdir(&job_dir).await?;

        let parallel_env = self.resolve_parallel_environment(current);
        let number_of_slots = self.resolve_number_of_slots(current, parallel_env.as_deref()).await?;

        let base_url = self.ctx.status_client.base_url().to_string();
        let mut template = TemplateContext::new(&self.cluster, current, &base_url);
        if let Some(pe) = &parallel_env {
            template = template.with_param("parallelEnvironment", pe.clone());
        }
        if let Some(slots) = number_of_slots {
            template = template.with_param("numberOfSlots", slots);
        }

        let script_body = crate::template::render_script(&current.commands, &template)?;
        let script_path = format!("{job_dir}/{}", current.name);
        self.ctx.session.put(&script_path, script_body.as_bytes(), 0o700).await?;

        let adapter = select_adapter(&self.cluster)?;
        let submit_output = self
            .ctx
            .session
            .execute(&adapter.submit_job_command(&script_path))
            .await?;
        let queue_job_id = adapter.parse_job_id(&submit_output)?;
        let queued_at = Utc::now();

        self.ctx
            .status_client
            .patch_job(
                &current.id,
                JobUpdate::new()
                    .status(JobStatus::Queued)
                    .queue_job_id(adapter.queue_job_id_key(), &queue_job_id)
                    .queued_time(queued_at),
            )
            .await?;

        let mut monitored = self.job.clone();
        monitored.queue_job_id = Some(queue_job_id);
        monitored.status = JobStatus::Queued;
        monitored.queued_time = Some(queued_at);

        crate::job_monitor::enqueue(
            &self.ctx,
            JobMonitorTask {
                ctx: Arc::clone(&self.ctx),
                cluster: self.cluster.clone(),
                job: monitored,
                adapter,
                script_name: current.name.clone(),
            },
        );
        Ok(())
    }

    fn resolve_parallel_environment(&self, job: &Job) -> Option<String> {
        if let Some(value) = job.params.get("parallelEnvironment").and_then(|v| v.as_str()) {
            return Some(value.to_string());
        }
        if let Some(pe) = &self.cluster.config.parallel_environment {
            return Some(pe.clone());
        }
        if self.cluster.cluster_type == model::ClusterType::Ec2 {
            return Some("orte".to_string());
        }
        None
    }

    async fn resolve_number_of_slots(
        &self,
        job: &Job,
        parallel_env: Option<&str>,
    ) -> Result<Option<u32>, ControllerError> {
        if let Some(slots) = self.cluster.config.number_of_slots {
            return Ok(Some(slots));
        }
        let Some(pe) = parallel_env else {
            return Ok(None);
        };
        let output = self
            .ctx
            .session
            .execute(&queue_adapter_sge::number_of_slots_command(pe))
            .await?;
        let slots = queue_adapter_sge::parse_number_of_slots(&output)
            .filter(|slots| *slots > 0)
            .ok_or_else(|| {
                ControllerError::Unexpected("Unable to retrieve number of slots".to_string())
            })?;
        log::info!("{}: {slots} slots available in {pe}", job.id);
        Ok(Some(slots))
    }
}

/// Uploads the bundled girder client script to `job_output_dir`, shared by
/// every job on this cluster (`upload`'s `../girderclient.py` reference
/// depends on it living one level above each job's own directory). Re-puts
/// it on every download/upload rather than checking for staleness first,
/// matching the original implementation's unconditional re-put.
async fn stage_girder_client(ctx: &ControllerContext) -> Result<(), ControllerError> {
    let contents = tokio::fs::read(&ctx.girder_client_path).await.map_err(|e| {
        ControllerError::Unexpected(format!(
            "could not read girder client at {}: {e}",
            ctx.girder_client_path.display()
        ))
    })?;
    let remote_path = format!("{}/girderclient.py", ctx.job_output_dir);
    ctx.session.mkdir(&ctx.job_output_dir).await?;
    ctx.session.put(&remote_path, &contents, 0o700).await?;
    Ok(())
}

// ---------------------------------------------------------------------
// download (load-bearing for `submit` whenever a job declares inputs;
// shares the stage-detached-process-then-monitor shape used by upload and
// onTerminate below)
// ---------------------------------------------------------------------

struct DownloadTask {
    ctx: Arc<ControllerContext>,
    cluster: Cluster,
    job: Job,
}

#[async_trait]
impl Task for DownloadTask {
    fn label(&self) -> String {
        format!("download[job={}]", self.job.id)
    }

    async fn run(self: Box<Self>, _rt: &TaskRuntime) -> TaskOutcome {
        match self.exec().await {
            Ok(()) => TaskOutcome::Done,
            Err(err) if err.is_transient() => TaskOutcome::Retry {
                after: self.ctx.poll_interval,
                task: self,
            },
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

impl DownloadTask {
    async fn exec(&self) -> Result<(), ControllerError> {
        self.ctx
            .status_client
            .patch_job(&self.job.id, JobUpdate::new().status(JobStatus::Downloading))
            .await?;

        let job_dir = self.job.job_dir(&self.ctx.job_output_dir);
        self.ctx.session.mkdir(&job_dir).await?;
        stage_girder_client(&self.ctx).await?;

        let command = format!(
            "cd {base} && python girderclient.py --token {token} --url {url} download --dir {job_dir} --job {id}",
            base = self.ctx.job_output_dir,
            token = self.ctx.girder_token,
            url = self.ctx.status_client.base_url(),
            id = self.job.id,
        );
        let output_file = format!("{job_dir}/download.out");
        let staged = stager::stage_detached(&self.ctx.session, &job_dir, &command, &output_file).await?;
        let pid = stager::run_and_capture_pid(&self.ctx.session, &staged).await?;

        process_monitor::enqueue(
            &self.ctx,
            ProcessMonitorTask {
                ctx: Arc::clone(&self.ctx),
                cluster: self.cluster.clone(),
                job: self.job.clone(),
                pid,
                staged,
                output_file,
                output_message: "Error downloading job input: {}".to_string(),
                on_complete: Continuation::SubmitJob,
            },
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------
// upload
// ---------------------------------------------------------------------

struct UploadTask {
    ctx: Arc<ControllerContext>,
    cluster: Cluster,
    job: Job,
}

#[async_trait]
impl Task for UploadTask {
    fn label(&self) -> String {
        format!("upload[job={}]", self.job.id)
    }

    async fn run(self: Box<Self>, _rt: &TaskRuntime) -> TaskOutcome {
        match self.exec().await {
            Ok(()) => TaskOutcome::Done,
            Err(err) if err.is_transient() => TaskOutcome::Retry {
                after: self.ctx.poll_interval,
                task: self,
            },
            Err(err) => {
                log::error!("{}: {err}", self.label());
                let _ = self
                    .ctx
                    .status_client
                    .patch_job(&self.job.id, JobUpdate::new().status(JobStatus::ErrorUploading))
                    .await;
                TaskOutcome::Done
            }
        }
    }
}

impl UploadTask {
    async fn exec(&self) -> Result<(), ControllerError> {
        let job_dir = self.job.job_dir(&self.ctx.job_output_dir);
        stage_girder_client(&self.ctx).await?;

        let command = format!(
            "cd {job_dir} && python ../girderclient.py --token {token} --url {url} upload --job {id}",
            token = self.ctx.girder_token,
            url = self.ctx.status_client.base_url(),
            id = self.job.id,
        );
        let output_file = format!("{job_dir}/upload.out");
        let staged = stager::stage_detached(&self.ctx.session, &job_dir, &command, &output_file).await?;
        let pid = stager::run_and_capture_pid(&self.ctx.session, &staged).await?;

        let on_complete = if self
            .job
            .on_complete
            .as_ref()
            .map(model::OnComplete::terminates_cluster)
            .unwrap_or(false)
        {
            Continuation::TerminateCluster
        } else {
            Continuation::None
        };

        process_monitor::enqueue(
            &self.ctx,
            ProcessMonitorTask {
                ctx: Arc::clone(&self.ctx),
                cluster: self.cluster.clone(),
                job: self.job.clone(),
                pid,
                staged,
                output_file,
                output_message: "Error uploading job output: {}".to_string(),
                on_complete,
            },
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------
// terminate
// ---------------------------------------------------------------------

struct TerminateTask {
    ctx: Arc<ControllerContext>,
    cluster: Cluster,
    job: Job,
}

#[async_trait]
impl Task for TerminateTask {
    fn label(&self) -> String {
        format!("terminate[job={}]", self.job.id)
    }

    async fn run(self: Box<Self>, _rt: &TaskRuntime) -> TaskOutcome {
        match self.exec().await {
            Ok(()) => TaskOutcome::Done,
            Err(err) if err.is_transient() => TaskOutcome::Retry {
                after: self.ctx.poll_interval,
                task: self,
            },
            Err(err) => {
                log::error!("{}: {err}", self.label());
                TaskOutcome::Done
            }
        }
    }
}

impl TerminateTask {
    async fn exec(&self) -> Result<(), ControllerError> {
        let current = &self.job;

        if let Some(queue_job_id) = &current.queue_job_id {
            let adapter = select_adapter(&self.cluster)?;
            self.ctx
                .session
                .execute_ignoring_exit_status(&adapter.terminate_job_command(queue_job_id))
                .await?;
        } else {
            self.ctx
                .status_client
                .patch_job(&current.id, JobUpdate::new().status(JobStatus::Terminated))
                .await?;
        }

        let Some(on_terminate) = &current.on_terminate else {
            return Ok(());
        };
        if on_terminate.commands.is_empty() {
            return Ok(());
        }

        let job_dir = current.job_dir(&self.ctx.job_output_dir);
        self.ctx.session.mkdir(&job_dir).await?;

        let base_url = self.ctx.status_client.base_url().to_string();
        let template = TemplateContext::new(&self.cluster, current, &base_url);
        let script_body = crate::template::render_script(&on_terminate.commands, &template)?;
        let inner = stager::stage(&self.ctx.session, &job_dir, &script_body).await?;

        let output_file = format!("{job_dir}/onTerminate.out");
        let outer = stager::stage_detached(
            &self.ctx.session,
            &job_dir,
            &format!("sh {}", inner.remote_path),
            &output_file,
        )
        .await?;
        let pid = stager::run_and_capture_pid(&self.ctx.session, &outer).await?;

        // Safe to unlink immediately: the backgrounded `sh` has already
        // opened the script by the time a pid exists for it, and POSIX
        // keeps unlinked-but-open files readable until the process exits.
        self.ctx.session.unlink(&inner.remote_path).await?;

        process_monitor::enqueue(
            &self.ctx,
            ProcessMonitorTask {
                ctx: Arc::clone(&self.ctx),
                cluster: self.cluster.clone(),
                job: self.job.clone(),
                pid,
                staged: outer,
                output_file,
                output_message: "onTerminate error: {}".to_string(),
                on_complete: Continuation::None,
            },
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------
// remove_output
// ---------------------------------------------------------------------

const REMOVE_OUTPUT_MAX_ATTEMPTS: u32 = 5;

struct RemoveOutputTask {
    ctx: Arc<ControllerContext>,
    job_dir: String,
    attempt: u32,
}

#[async_trait]
impl Task for RemoveOutputTask {
    fn label(&self) -> String {
        format!("remove-output[dir={}]", self.job_dir)
    }

    async fn run(self: Box<Self>, _rt: &TaskRuntime) -> TaskOutcome {
        match self
            .ctx
            .session
            .execute_ignoring_exit_status(&format!("rm -rf {}", self.job_dir))
            .await
        {
            Ok(_) => TaskOutcome::Done,
            Err(err) => {
                let err: ControllerError = err.into();
                let attempt = self.attempt + 1;
                if err.is_transient() && attempt < REMOVE_OUTPUT_MAX_ATTEMPTS {
                    log::warn!(
                        "{}: attempt {attempt}/{REMOVE_OUTPUT_MAX_ATTEMPTS} failed: {err}",
                        self.label()
                    );
                    TaskOutcome::Retry {
                        after: Duration::from_secs(5),
                        task: Box::new(RemoveOutputTask {
                            ctx: self.ctx,
                            job_dir: self.job_dir,
                            attempt,
                        }),
                    }
                } else {
                    log::error!("{}: giving up after {attempt} attempts: {err}", self.label());
                    TaskOutcome::Done
                }
            }
        }
    }
}
