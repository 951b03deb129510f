// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! `cumulus-worker`: the process entry point for the job-lifecycle
//! controller. Connects to a cluster's head node, wires up the metadata
//! service client and the two-lane task runtime, then drives one of
//! `submit` / `terminate` / `remove-output` to completion and exits.
//!
//! This intentionally does not itself implement an ingestion transport
//! (a message queue, an HTTP server) for receiving job descriptions: that
//! lives in the metadata service this binary talks to. Each invocation here
//! corresponds to a single unit of work handed to it by whatever dispatches
//! this binary.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use config::{ConfigError, FileConfig, WorkerConfig};
use job_controller::{ControllerContext, LoggingClusterProvisioner};
use model::{Cluster, Job};
use remote_shell::{ConnectOptions, RemoteShellSession};
use status_client::StatusClient;
use task_executor::TaskRuntime;
use tokio::task::JoinSet;

#[derive(Parser)]
#[command(name = "cumulus-worker", about = "Job-lifecycle controller for a compute cluster")]
struct Cli {
    /// Path to a TOML config file providing defaults for the flags below.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    metadata_base_url: Option<String>,
    #[arg(long)]
    metadata_token: Option<String>,
    #[arg(long)]
    ssh_host: Option<String>,
    #[arg(long)]
    ssh_port: Option<u16>,
    #[arg(long)]
    ssh_username: Option<String>,
    #[arg(long)]
    ssh_private_key: Option<PathBuf>,
    #[arg(long)]
    job_output_dir: Option<String>,
    #[arg(long)]
    girder_client_path: Option<PathBuf>,
    #[arg(long)]
    girder_token: Option<String>,
    #[arg(long)]
    poll_interval_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stage, submit, and monitor a job description to completion.
    Submit {
        /// Path to a JSON file holding the cluster description.
        #[arg(long)]
        cluster: PathBuf,
        /// Path to a JSON file holding the job description.
        #[arg(long)]
        job: PathBuf,
    },
    /// Terminate a job (and, if it has an `onTerminate` hook, run it).
    Terminate {
        #[arg(long)]
        cluster: PathBuf,
        #[arg(long)]
        job: PathBuf,
    },
    /// Recursively remove a job's working directory on the head node.
    RemoveOutput {
        #[arg(long)]
        job_dir: String,
    },
}

#[derive(thiserror::Error, Debug)]
enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not read {0}: {1}")]
    ReadInput(PathBuf, std::io::Error),
    #[error("could not parse {0}: {1}")]
    ParseInput(PathBuf, serde_json::Error),
    #[error(transparent)]
    Connect(#[from] remote_shell::RemoteShellError),
}

fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T, WorkerError> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| WorkerError::ReadInput(path.clone(), e))?;
    serde_json::from_str(&contents).map_err(|e| WorkerError::ParseInput(path.clone(), e))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let file_config = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let config = WorkerConfig::resolve(
        file_config,
        cli.metadata_base_url,
        cli.metadata_token,
        cli.ssh_host,
        cli.ssh_port,
        cli.ssh_username,
        cli.ssh_private_key,
        cli.job_output_dir,
        cli.girder_client_path,
        cli.girder_token,
        cli.poll_interval_secs,
    )?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("failed to start the tokio runtime: {e}"))?;

    runtime.block_on(async_main(config, cli.command))
}

async fn async_main(config: WorkerConfig, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    let session = RemoteShellSession::connect(ConnectOptions {
        host: config.ssh_host.clone(),
        port: config.ssh_port,
        username: config.ssh_username.clone(),
        private_key: config.ssh_private_key.clone(),
    })
    .await
    .map_err(WorkerError::from)?;

    let status_client = StatusClient::new(config.metadata_base_url.clone(), config.metadata_token.clone());

    let mut tasks = JoinSet::new();
    let task_runtime = TaskRuntime::start(&mut tasks);

    let ctx = Arc::new(ControllerContext {
        status_client,
        session,
        runtime: task_runtime,
        poll_interval: config.poll_interval,
        job_output_dir: config.job_output_dir,
        girder_client_path: config.girder_client_path,
        girder_token: config.girder_token,
        cluster_provisioner: Arc::new(LoggingClusterProvisioner),
    });

    match command {
        Command::Submit { cluster, job } => {
            let cluster: Cluster = read_json(&cluster)?;
            let job: Job = read_json(&job)?;
            log::info!("submitting job {}", job.id);
            job_controller::submit(&ctx, cluster, job);
        }
        Command::Terminate { cluster, job } => {
            let cluster: Cluster = read_json(&cluster)?;
            let job: Job = read_json(&job)?;
            log::info!("terminating job {}", job.id);
            job_controller::terminate(&ctx, cluster, job);
        }
        Command::RemoveOutput { job_dir } => {
            log::info!("removing output at {job_dir}");
            job_controller::remove_output(&ctx, job_dir);
        }
    }

    // Dropping `ctx` here would leave the task runtime's senders alive
    // (held by spawned tasks via their own `Arc<ControllerContext>`
    // clones), so the lane workers keep running until every in-flight
    // task (the one just enqueued, and anything it spawns in turn)
    // finishes and drops its last reference.
    drop(ctx);
    while tasks.join_next().await.is_some() {}
    Ok(())
}
