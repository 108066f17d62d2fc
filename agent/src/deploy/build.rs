//! Jailed build execution with live log streaming
//!
//! The build runs as the application's jail user. Stdout and stderr are
//! forwarded line-by-line into the deployment's log channel with
//! `try_send`: a full channel drops the line rather than blocking the
//! child on its pipes.

use std::collections::HashMap;
use std::path::Path;

use kari_proto::{LogChunk, LogLevel};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

use crate::errors::AgentError;
use crate::host::exec;

/// Run `build_command` (a discrete argv vector) as `run_as_user` inside
/// `working_dir`, streaming output into `log_tx`.
pub async fn execute_build(
    build_argv: &[String],
    working_dir: &Path,
    run_as_user: &str,
    env_vars: &HashMap<String, String>,
    log_tx: mpsc::Sender<LogChunk>,
    trace_id: &str,
) -> Result<(), AgentError> {
    crate::host::validate_username(run_as_user)?;
    if build_argv.is_empty() {
        return Err(AgentError::Rejected("build command is empty".to_string()));
    }

    let argv: Vec<&str> = build_argv.iter().map(String::as_str).collect();
    let mut child = exec::spawn_as_user(run_as_user, &argv, working_dir, env_vars)?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AgentError::Internal("missing child stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AgentError::Internal("missing child stderr".to_string()))?;

    let stdout_task = tokio::spawn(pump_lines(
        stdout,
        LogLevel::Stdout,
        log_tx.clone(),
        trace_id.to_string(),
    ));
    let stderr_task = tokio::spawn(pump_lines(
        stderr,
        LogLevel::Stderr,
        log_tx.clone(),
        trace_id.to_string(),
    ));

    let status = child
        .wait()
        .await
        .map_err(|e| AgentError::Internal(format!("wait for build: {e}")))?;

    // Drain both pipes fully before classifying the exit; otherwise the
    // tail of the output races the status update.
    let _ = tokio::join!(stdout_task, stderr_task);

    if !status.success() {
        return Err(AgentError::ExecFailed {
            program: build_argv[0].clone(),
            code: status.code().unwrap_or(-1),
            stderr_tail: String::new(),
        });
    }

    debug!(trace_id, "build finished");
    Ok(())
}

/// Forward lines from one pipe into the log channel. Messages are passed
/// through verbatim, ANSI escapes included.
async fn pump_lines<R>(reader: R, level: LogLevel, tx: mpsc::Sender<LogChunk>, trace_id: String)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let chunk = LogChunk {
            trace_id: trace_id.clone(),
            level,
            message: line,
            is_eof: false,
        };
        // Drop-on-full: slow consumers lose detail, the build never stalls.
        let _ = tx.try_send(chunk);
    }
}

/// Split a configured build command into a discrete argv vector.
///
/// Whitespace-separated, no quoting, no expansion: the panel never hands
/// user input to a shell, so shell syntax has no meaning here.
pub fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_command_is_whitespace_only() {
        assert_eq!(split_command("npm run build"), vec!["npm", "run", "build"]);
        assert_eq!(
            split_command("  cargo   build --release "),
            vec!["cargo", "build", "--release"]
        );
        // Shell syntax is data, not structure.
        assert_eq!(
            split_command("npm install && rm -rf /"),
            vec!["npm", "install", "&&", "rm", "-rf", "/"]
        );
    }

    #[tokio::test]
    async fn empty_build_command_is_rejected() {
        let (tx, _rx) = mpsc::channel(8);
        let tmp = tempfile::tempdir().unwrap();
        let err = execute_build(
            &[],
            tmp.path(),
            "kari-app-blog",
            &HashMap::new(),
            tx,
            "dep-1",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AgentError::Rejected(_)));
    }

    #[tokio::test]
    async fn invalid_jail_user_is_rejected() {
        let (tx, _rx) = mpsc::channel(8);
        let tmp = tempfile::tempdir().unwrap();
        let err = execute_build(
            &["true".to_string()],
            tmp.path(),
            "root; rm",
            &HashMap::new(),
            tx,
            "dep-1",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AgentError::Rejected(_)));
    }
}
