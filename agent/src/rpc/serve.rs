//! Socket lifecycle and accept loop
//!
//! The socket file is 0660, owned by root and the brain's group, inside a
//! 0750 directory. Every accepted connection is checked against the
//! expected brain UID before any bytes are read.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kari_proto::{
    read_frame, write_frame, AgentResponse, RequestEnvelope, StreamFrame, WireError,
};
use nix::unistd::{chown, Group};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::errors::AgentError;
use crate::rpc::handlers::AgentHandlers;
use crate::rpc::peer::{authorize_peer, PeerCredentials};

/// Deadline for a single unary handler. Streaming deployments are exempt
/// and end only with EOF or client disconnect.
const UNARY_DEADLINE: Duration = Duration::from_secs(60);

/// Start the RPC server.
pub async fn serve(
    config: &AgentConfig,
    handlers: Arc<AgentHandlers>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), AgentError>>, AgentError> {
    let listener = bind_socket(config)?;
    let socket_path = config.socket_path.clone();
    let expected_uid = config.expected_brain_uid;

    info!(socket = %socket_path.display(), expected_uid, "agent RPC server listening");

    let handle = tokio::spawn(async move {
        tokio::pin!(shutdown_signal);

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("RPC server shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            accept_connection(stream, expected_uid, handlers.clone());
                        }
                        Err(e) => {
                            error!(error = %e, "socket accept failed");
                        }
                    }
                }
            }
        }

        let _ = std::fs::remove_file(&socket_path);
        Ok(())
    });

    Ok(handle)
}

/// Bind the socket with its full permission story: 0750 parent directory,
/// stale-file removal, 0660 socket mode, group handed to the brain's
/// group. Ownership changes need root; an unprivileged run (tests, dev)
/// keeps the caller's ownership.
fn bind_socket(config: &AgentConfig) -> Result<UnixListener, AgentError> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    let path = &config.socket_path;
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    if !parent.exists() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o750)
            .create(parent)?;
    }

    if path.exists() {
        std::fs::remove_file(path)?;
    }

    let listener = UnixListener::bind(path)
        .map_err(|e| AgentError::Internal(format!("bind {}: {e}", path.display())))?;

    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o660);
    std::fs::set_permissions(path, perms)?;

    if nix::unistd::geteuid().is_root() {
        let group = Group::from_name(&config.socket_group)
            .map_err(|e| AgentError::Internal(format!("group lookup: {e}")))?
            .ok_or_else(|| {
                AgentError::Precondition(format!(
                    "socket group {} does not exist",
                    config.socket_group
                ))
            })?;
        chown(path, None, Some(group.gid))
            .map_err(|e| AgentError::Internal(format!("chown socket: {e}")))?;
        chown(parent, None, Some(group.gid))
            .map_err(|e| AgentError::Internal(format!("chown socket dir: {e}")))?;
    }

    Ok(listener)
}

/// Gate a fresh connection on kernel peer credentials, then hand it to a
/// per-connection task.
fn accept_connection(stream: UnixStream, expected_uid: u32, handlers: Arc<AgentHandlers>) {
    let peer = match PeerCredentials::from_stream(&stream) {
        Ok(peer) => peer,
        Err(e) => {
            error!(error = %e, "failed to read peer credentials, closing connection");
            return;
        }
    };

    if !authorize_peer(peer, expected_uid) {
        // Security event: connection dropped before a single read.
        warn!(
            peer_uid = peer.uid,
            peer_gid = peer.gid,
            peer_pid = ?peer.pid,
            expected_uid,
            "blocked unauthorized socket connection"
        );
        return;
    }

    debug!(peer_uid = peer.uid, "authenticated RPC connection");
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, handlers).await {
            debug!(error = %e, "connection handler ended with error");
        }
    });
}

async fn handle_connection(
    mut stream: UnixStream,
    handlers: Arc<AgentHandlers>,
) -> Result<(), AgentError> {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => {
                debug!(error = %e, "failed to read request frame");
                return Ok(());
            }
        };

        let envelope: RequestEnvelope = match serde_json::from_slice(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                let response = AgentResponse::Error {
                    error: WireError {
                        code: kari_proto::AgentErrorCode::Rejected,
                        message: format!("malformed request: {e}"),
                    },
                };
                send_response(&mut stream, &response).await?;
                continue;
            }
        };

        match envelope.request {
            kari_proto::AgentRequest::StreamDeployment {
                trace_id,
                app_id,
                domain,
                repo_url,
                branch,
                build_command,
                port,
                ssh_key,
            } => {
                // The stream consumes the connection: chunks until EOF
                // (success) or an error frame, then close. A failed write
                // means the brain is gone, so the engine task is aborted,
                // which kills any child process via kill_on_drop.
                let (mut rx, engine_task) = handlers.start_deployment(
                    trace_id, app_id, domain, repo_url, branch, build_command, port, ssh_key,
                );

                while let Some(chunk) = rx.recv().await {
                    let frame = serde_json::to_vec(&StreamFrame::Chunk { chunk })
                        .map_err(|e| AgentError::Internal(e.to_string()))?;
                    if write_frame(&mut stream, &frame).await.is_err() {
                        warn!("deployment stream client disconnected, cancelling build");
                        engine_task.abort();
                        return Ok(());
                    }
                }

                // Channel closed: the engine is done. Report a failure as
                // the stream's final frame; success already ended with
                // the EOF chunk.
                match engine_task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        let frame = serde_json::to_vec(&StreamFrame::Error { error: e.to_wire() })
                            .map_err(|err| AgentError::Internal(err.to_string()))?;
                        let _ = write_frame(&mut stream, &frame).await;
                    }
                    Err(join_err) => {
                        error!(error = %join_err, "deployment engine task failed");
                        let frame = serde_json::to_vec(&StreamFrame::Error {
                            error: kari_proto::WireError {
                                code: kari_proto::AgentErrorCode::Internal,
                                message: "internal agent error".to_string(),
                            },
                        })
                        .map_err(|err| AgentError::Internal(err.to_string()))?;
                        let _ = write_frame(&mut stream, &frame).await;
                    }
                }
                return Ok(());
            }

            request => {
                let response =
                    match tokio::time::timeout(UNARY_DEADLINE, handlers.handle_unary(request))
                        .await
                    {
                        Ok(response) => response,
                        Err(_) => AgentResponse::Error {
                            error: WireError {
                                code: kari_proto::AgentErrorCode::Transient,
                                message: "rpc deadline exceeded".to_string(),
                            },
                        },
                    };
                send_response(&mut stream, &response).await?;
            }
        }
    }
}

async fn send_response(
    stream: &mut UnixStream,
    response: &AgentResponse,
) -> Result<(), AgentError> {
    let frame = serde_json::to_vec(response).map_err(|e| AgentError::Internal(e.to_string()))?;
    write_frame(stream, &frame)
        .await
        .map_err(|e| AgentError::Internal(e.to_string()))?;
    Ok(())
}
