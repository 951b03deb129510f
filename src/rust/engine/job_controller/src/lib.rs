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

//! The job-lifecycle controller: stages a job's script onto a cluster head
//! node, submits it to a batch queue, monitors it to completion, and
//! (optionally) uploads its output and tears the cluster down.

pub mod cluster;
pub mod continuation;
pub mod controller;
pub mod error;
pub mod job_monitor;
pub mod process_monitor;
pub mod stager;
pub mod template;

pub use cluster::{ClusterProvisioner, LoggingClusterProvisioner};
pub use controller::{select_adapter, submit, terminate, remove_output, ControllerContext};
pub use error::ControllerError;
