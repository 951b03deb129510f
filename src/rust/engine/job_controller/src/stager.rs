// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Stages a script onto the head node as a uniquely-named, executable file,
//! and the "detached process" idiom used to run commands that must outlive
//! a single SSH channel: wrap the command in `nohup ... &> outfile &`,
//! capture the backgrounded PID by appending `echo $!` to the script body
//! rather than trying to parse it back out of shell output.

use remote_shell::RemoteShellSession;
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::error::ControllerError;

/// A script staged on the head node: its remote path (for invocation, e.g.
/// `./stage-<uuid>.sh`) and the path any caller should `unlink` when done.
pub struct StagedScript {
    pub remote_path: String,
}

/// Uploads `body` as an executable script under `job_dir`, returning its
/// remote invocation path. The caller is responsible for unlinking it.
pub async fn stage(
    session: &RemoteShellSession,
    job_dir: &str,
    body: &str,
) -> Result<StagedScript, ControllerError> {
    let name = format!("stage-{}.sh", Uuid::new_v4());
    let remote_path = format!("{job_dir}/{name}");

    // Written through a local tempfile first only to mirror the pattern the
    // rest of this codebase uses for content destined for `put`; the file on
    // disk here is never read back, `put` takes the bytes directly.
    let mut local = NamedTempFile::new()
        .map_err(|e| ControllerError::Unexpected(format!("could not create staging file: {e}")))?;
    use std::io::Write;
    local
        .write_all(body.as_bytes())
        .map_err(|e| ControllerError::Unexpected(format!("could not write staging file: {e}")))?;

    session.mkdir(job_dir).await?;
    session.put(&remote_path, body.as_bytes(), 0o700).await?;

    Ok(StagedScript { remote_path })
}

/// Stages `command`, wrapped so that it runs detached (`nohup ... &`),
/// appending `echo $!` so a single `execute` of the staged script returns
/// exactly one line: the backgrounded process's pid.
pub async fn stage_detached(
    session: &RemoteShellSession,
    job_dir: &str,
    command: &str,
    output_file: &str,
) -> Result<StagedScript, ControllerError> {
    let body = format!("nohup {command} &> {output_file} &\necho $!\n");
    stage(session, job_dir, &body).await
}

/// Runs a previously staged script and parses its single line of stdout as
/// a pid. Fails loudly (`AdapterProtocol`-flavored, via `Unexpected`) if the
/// invocation produced anything other than exactly one integer line: this
/// codebase's contract is one background process per staged script.
pub async fn run_and_capture_pid(
    session: &RemoteShellSession,
    staged: &StagedScript,
) -> Result<u64, ControllerError> {
    let output = session.execute(&format!("sh {}", staged.remote_path)).await?;
    let line = output.trim();
    line.lines()
        .next()
        .filter(|_| line.lines().count() == 1)
        .and_then(|l| l.trim().parse::<u64>().ok())
        .ok_or_else(|| {
            ControllerError::Unexpected(format!(
                "expected exactly one pid line from staged script, got: {output:?}"
            ))
        })
}

pub async fn unlink(session: &RemoteShellSession, staged: &StagedScript) -> Result<(), ControllerError> {
    session.unlink(&staged.remote_path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #[test]
    fn detached_wrapper_always_ends_with_echo_pid() {
        let body = format!("nohup {} &> {} &\necho $!\n", "do-a-thing", "out.log");
        assert!(body.trim_end().ends_with("echo $!"));
        assert!(body.contains("nohup do-a-thing &> out.log &"));
    }
}
