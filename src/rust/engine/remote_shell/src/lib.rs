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

//! A single SSH session to a cluster head node, with the handful of shell
//! primitives the job controller needs: run a command, move files in and out,
//! check for their existence, remove them.
//!
//! `ssh2` is a blocking API, so every operation here runs on the blocking
//! thread pool via [`tokio::task::spawn_blocking`]; nothing in this crate ever
//! blocks the async runtime's worker threads.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::{Arc, Mutex};

use ssh2::Session as Ssh2Session;

#[derive(thiserror::Error, Debug)]
pub enum RemoteShellError {
    #[error("transport error talking to the head node: {0}")]
    Connection(#[from] std::io::Error),

    #[error("ssh protocol error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("remote command exited {status}: {command}\n{stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("ssh session closed unexpectedly")]
    Eof,
}

impl RemoteShellError {
    /// True for faults that represent a transient transport hiccup rather
    /// than a substantive failure of the command itself — these should be
    /// retried, never recorded as a job error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteShellError::Connection(_) | RemoteShellError::Eof
        )
    }
}

pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub private_key: std::path::PathBuf,
}

/// A connected session. Cheaply `Clone`-able; clones share the same
/// underlying transport, serialized through an internal mutex (mirroring how
/// a single real SSH connection can only run one channel's command at a
/// time in this codebase's usage pattern).
#[derive(Clone)]
pub struct RemoteShellSession {
    inner: Arc<Mutex<Ssh2Session>>,
}

impl RemoteShellSession {
    pub async fn connect(opts: ConnectOptions) -> Result<Self, RemoteShellError> {
        tokio::task::spawn_blocking(move || {
            let tcp = TcpStream::connect((opts.host.as_str(), opts.port))?;
            let mut session = Ssh2Session::new()?;
            session.set_tcp_stream(tcp);
            session.handshake()?;
            session.userauth_pubkey_file(&opts.username, None, &opts.private_key, None)?;
            if !session.authenticated() {
                return Err(RemoteShellError::Ssh(ssh2::Error::from_errno(
                    ssh2::ErrorCode::Session(-18), // LIBSSH2_ERROR_AUTHENTICATION_FAILED
                )));
            }
            Ok(RemoteShellSession {
                inner: Arc::new(Mutex::new(session)),
            })
        })
        .await
        .expect("ssh connect task panicked")
    }

    /// Run `command` to completion and return its stdout. A non-zero exit
    /// status (unless `ignore_exit_status`) is a [`RemoteShellError::CommandFailed`].
    pub async fn execute(&self, command: &str) -> Result<String, RemoteShellError> {
        self.execute_impl(command, false).await
    }

    pub async fn execute_ignoring_exit_status(
        &self,
        command: &str,
    ) -> Result<String, RemoteShellError> {
        self.execute_impl(command, true).await
    }

    async fn execute_impl(
        &self,
        command: &str,
        ignore_exit_status: bool,
    ) -> Result<String, RemoteShellError> {
        let inner = Arc::clone(&self.inner);
        let command = command.to_string();
        tokio::task::spawn_blocking(move || {
            let session = inner.lock().expect("ssh session lock poisoned");
            let mut channel = session.channel_session()?;
            channel.exec(&command)?;
            let mut stdout = String::new();
            channel
                .read_to_string(&mut stdout)
                .map_err(|_| RemoteShellError::Eof)?;
            let mut stderr = String::new();
            let _ = channel.stderr().read_to_string(&mut stderr);
            channel.wait_close()?;
            let status = channel.exit_status()?;
            if status != 0 && !ignore_exit_status {
                return Err(RemoteShellError::CommandFailed {
                    command,
                    status,
                    stderr,
                });
            }
            Ok(stdout)
        })
        .await
        .expect("ssh execute task panicked")
    }

    /// Upload `contents` to `remote_path`, with the given octal `mode` (e.g. `0o700`).
    pub async fn put(
        &self,
        remote_path: &str,
        contents: &[u8],
        mode: i32,
    ) -> Result<(), RemoteShellError> {
        let inner = Arc::clone(&self.inner);
        let remote_path = remote_path.to_string();
        let contents = contents.to_vec();
        tokio::task::spawn_blocking(move || {
            let session = inner.lock().expect("ssh session lock poisoned");
            let mut remote_file =
                session.scp_send(Path::new(&remote_path), mode, contents.len() as u64, None)?;
            remote_file.write_all(&contents)?;
            remote_file.send_eof()?;
            remote_file.wait_eof()?;
            remote_file.close()?;
            remote_file.wait_close()?;
            Ok(())
        })
        .await
        .expect("ssh put task panicked")
    }

    /// Download the contents of `remote_path`. Returns `Ok(None)` if the file
    /// does not exist, rather than an error — several callers treat a missing
    /// file as "nothing written yet".
    pub async fn get(&self, remote_path: &str) -> Result<Option<Vec<u8>>, RemoteShellError> {
        let inner = Arc::clone(&self.inner);
        let remote_path = remote_path.to_string();
        tokio::task::spawn_blocking(move || {
            let session = inner.lock().expect("ssh session lock poisoned");
            match session.scp_recv(Path::new(&remote_path)) {
                Ok((mut remote_file, stat)) => {
                    let mut buf = vec![0u8; stat.size() as usize];
                    remote_file.read_exact(&mut buf)?;
                    let _ = remote_file.send_eof();
                    let _ = remote_file.wait_eof();
                    let _ = remote_file.close();
                    let _ = remote_file.wait_close();
                    Ok(Some(buf))
                }
                Err(e) if e.code() == ssh2::ErrorCode::Session(-31) => Ok(None), // SFTP/file not found
                Err(e) => Err(RemoteShellError::Ssh(e)),
            }
        })
        .await
        .expect("ssh get task panicked")
    }

    pub async fn mkdir(&self, remote_path: &str) -> Result<(), RemoteShellError> {
        self.execute_ignoring_exit_status(&format!("mkdir -p {remote_path}"))
            .await
            .map(|_| ())
    }

    pub async fn unlink(&self, remote_path: &str) -> Result<(), RemoteShellError> {
        self.execute_ignoring_exit_status(&format!("rm -f {remote_path}"))
            .await
            .map(|_| ())
    }

    pub async fn isfile(&self, remote_path: &str) -> Result<bool, RemoteShellError> {
        let output = self
            .execute(&format!(
                "test -f {remote_path} && echo yes || echo no"
            ))
            .await?;
        Ok(output.trim() == "yes")
    }

    /// Returns the byte size of `remote_path` (`st_size`), or `None` if it
    /// doesn't exist.
    pub async fn stat(&self, remote_path: &str) -> Result<Option<u64>, RemoteShellError> {
        let output = self
            .execute_ignoring_exit_status(&format!(
                "stat -c %s {remote_path} 2>/dev/null || true"
            ))
            .await?;
        let trimmed = output.trim();
        if trimmed.is_empty() {
            Ok(None)
        } else {
            trimmed
                .parse()
                .map(Some)
                .map_err(|_| RemoteShellError::CommandFailed {
                    command: format!("stat -c %s {remote_path}"),
                    status: 0,
                    stderr: format!("unparseable size output: {trimmed}"),
                })
        }
    }
}

/// Runs `f` against a connected session, mirroring the scoped-acquisition
/// idiom used elsewhere in this workspace for pooled resources: the session
/// is available only for the duration of the closure.
pub async fn with_session<F, Fut, T>(
    opts: ConnectOptions,
    f: F,
) -> Result<T, RemoteShellError>
where
    F: FnOnce(RemoteShellSession) -> Fut,
    Fut: std::future::Future<Output = Result<T, RemoteShellError>>,
{
    let session = RemoteShellSession::connect(opts).await?;
    f(session).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_and_eof_errors_are_transient() {
        assert!(RemoteShellError::Eof.is_transient());
        assert!(RemoteShellError::Connection(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        ))
        .is_transient());
    }

    #[test]
    fn command_failure_is_not_transient() {
        let err = RemoteShellError::CommandFailed {
            command: "false".to_string(),
            status: 1,
            stderr: String::new(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn ssh_protocol_error_is_not_transient() {
        let err = RemoteShellError::Ssh(ssh2::Error::from_errno(ssh2::ErrorCode::Session(-1)));
        assert!(!err.is_transient());
    }
}
