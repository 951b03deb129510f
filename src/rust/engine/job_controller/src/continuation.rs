// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! What to do next once a detached process (downloaded input, submitted
//! job, uploaded output) is observed to have finished.
//!
//! A closed, named enum stands in for passing the next step around as an
//! opaque, serialized task signature: every continuation this controller
//! ever needs is enumerable up front, so a static enum is strictly more
//! useful here than a dynamically dispatched one would be.

use std::sync::Arc;

use model::{Cluster, Job};

use crate::controller::ControllerContext;

#[derive(Clone)]
pub enum Continuation {
    /// Fired once a job's inputs have finished downloading: submit the job.
    SubmitJob,
    /// Fired once a job's outputs have finished uploading, or failed to:
    /// tear the cluster down either way.
    TerminateCluster,
    /// No follow-up action.
    None,
}

impl Continuation {
    pub async fn fire(&self, ctx: &Arc<ControllerContext>, cluster: &Cluster, job: &Job) {
        match self {
            Continuation::SubmitJob => {
                crate::controller::enqueue_submit(ctx, cluster.clone(), job.clone());
            }
            Continuation::TerminateCluster => {
                ctx.cluster_provisioner.terminate_cluster(cluster).await;
            }
            Continuation::None => {}
        }
    }
}
