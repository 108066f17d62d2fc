//! Shell-free program execution
//!
//! Every invocation passes an argv vector to the exec family; nothing is
//! ever concatenated into a shell string. Privilege drops go through
//! `runuser` so the agent itself never execs a user command as root.

use std::collections::HashMap;
use std::path::Path;

use tokio::process::Command;
use tracing::debug;

use crate::errors::AgentError;

/// Longest stderr tail carried inside an `ExecFailed` error.
const STDERR_TAIL_BYTES: usize = 512;

/// Captured result of a completed child process.
#[derive(Debug)]
pub struct ExecOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Run a program with discrete arguments and capture its output.
pub async fn run(program: &str, args: &[&str]) -> Result<ExecOutput, AgentError> {
    debug!(program, ?args, "spawning child process");

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| AgentError::Internal(format!("failed to spawn {program}: {e}")))?;

    Ok(ExecOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Run a program and map a non-zero exit to `ExecFailed` with a bounded
/// stderr tail.
pub async fn run_checked(program: &str, args: &[&str]) -> Result<ExecOutput, AgentError> {
    let output = run(program, args).await?;
    if !output.success() {
        return Err(AgentError::ExecFailed {
            program: program.to_string(),
            code: output.code,
            stderr_tail: stderr_tail(&output.stderr),
        });
    }
    Ok(output)
}

/// Build the argv for running `argv` as `user` via runuser. The caller's
/// argv stays discrete; nothing is re-joined into a shell string.
pub fn runuser_argv<'a>(user: &'a str, argv: &[&'a str]) -> Vec<&'a str> {
    let mut full = vec!["-u", user, "--"];
    full.extend_from_slice(argv);
    full
}

/// Spawn `argv` as `user` inside `working_dir` with `env` applied,
/// returning the child with piped stdout/stderr for log streaming.
pub fn spawn_as_user(
    user: &str,
    argv: &[&str],
    working_dir: &Path,
    env: &HashMap<String, String>,
) -> Result<tokio::process::Child, AgentError> {
    if argv.is_empty() {
        return Err(AgentError::Rejected("empty command".to_string()));
    }

    debug!(user, ?argv, "spawning jailed child process");

    Command::new("runuser")
        .args(runuser_argv(user, argv))
        .current_dir(working_dir)
        .envs(env)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AgentError::Internal(format!("failed to spawn runuser: {e}")))
}

/// Last `STDERR_TAIL_BYTES` of a stderr capture, on a char boundary.
pub fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim_end();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let output = run("sh", &["-c", "echo out; echo err >&2; exit 3"])
            .await
            .unwrap();
        assert_eq!(output.code, 3);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn run_checked_classifies_failure() {
        let err = run_checked("false", &[]).await.unwrap_err();
        match err {
            AgentError::ExecFailed { program, code, .. } => {
                assert_eq!(program, "false");
                assert_eq!(code, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn runuser_argv_keeps_arguments_discrete() {
        let argv = runuser_argv("kari-app-blog", &["npm", "run", "build"]);
        assert_eq!(argv, vec!["-u", "kari-app-blog", "--", "npm", "run", "build"]);
    }

    #[test]
    fn stderr_tail_is_bounded() {
        let long = "e".repeat(4096);
        assert_eq!(stderr_tail(&long).len(), STDERR_TAIL_BYTES);
        assert_eq!(stderr_tail("short"), "short");
    }
}
