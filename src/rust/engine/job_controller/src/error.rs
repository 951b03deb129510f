// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use queue_adapter::QueueAdapterError;
use remote_shell::RemoteShellError;
use status_client::StatusClientError;

/// The error taxonomy every job-control task body resolves its failures
/// into before deciding how to react.
///
/// - `Transport` faults are always transient: reschedule the task, never
///   touch the job's recorded status.
/// - `RemoteCommandFailed` and `AdapterProtocol` both mean the job itself
///   is broken: move it to `error` and stop driving it.
/// - `UnsupportedQueueSystem` means the job was never actionable to begin
///   with; it surfaces to the caller instead of being written onto the job.
/// - `Unexpected` covers anything else (a bug, an invariant violation): the
///   job is moved to `error` and the failure is re-raised so it is logged
///   as a task failure rather than silently absorbed.
#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote command failed: {0}")]
    RemoteCommandFailed(String),

    #[error("queue adapter protocol error: {0}")]
    AdapterProtocol(String),

    #[error("unsupported queuing system: {0}")]
    UnsupportedQueueSystem(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl ControllerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ControllerError::Transport(_))
    }
}

impl From<RemoteShellError> for ControllerError {
    fn from(err: RemoteShellError) -> Self {
        if err.is_transient() {
            ControllerError::Transport(err.to_string())
        } else {
            ControllerError::RemoteCommandFailed(err.to_string())
        }
    }
}

impl From<StatusClientError> for ControllerError {
    fn from(err: StatusClientError) -> Self {
        if err.is_transient() {
            ControllerError::Transport(err.to_string())
        } else {
            ControllerError::Unexpected(err.to_string())
        }
    }
}

impl From<QueueAdapterError> for ControllerError {
    fn from(err: QueueAdapterError) -> Self {
        match err {
            QueueAdapterError::Unsupported(system) => {
                ControllerError::UnsupportedQueueSystem(system)
            }
            QueueAdapterError::Protocol(msg) => ControllerError::AdapterProtocol(msg),
        }
    }
}
