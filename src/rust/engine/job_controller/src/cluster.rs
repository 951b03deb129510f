// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Boundary to the cluster-provisioning subsystem (launch/terminate), an
//! external collaborator this crate never implements (spec §1's
//! "out of scope" list). `Continuation::TerminateCluster` dispatches
//! through here: tearing a *cluster* down is a different operation from
//! `controller::terminate`, which cancels a single *job*'s queue submission.

use async_trait::async_trait;
use model::Cluster;

#[async_trait]
pub trait ClusterProvisioner: Send + Sync {
    /// Request that `cluster` be torn down. Fire-and-forget from this
    /// crate's perspective: the provisioning subsystem owns the actual
    /// shutdown sequence and reports its own status elsewhere.
    async fn terminate_cluster(&self, cluster: &Cluster);
}

/// Placeholder implementation used where no real provisioning subsystem is
/// wired in: logs the request rather than silently dropping it.
pub struct LoggingClusterProvisioner;

#[async_trait]
impl ClusterProvisioner for LoggingClusterProvisioner {
    async fn terminate_cluster(&self, cluster: &Cluster) {
        log::info!("cluster {} requested for termination", cluster.id);
    }
}
