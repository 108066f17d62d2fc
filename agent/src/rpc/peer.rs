//! Kernel peer credentials for the local socket
//!
//! This gate is the load-bearing invariant of the whole panel: a process
//! running as any UID other than the configured brain UID is disconnected
//! before a single byte is read, root included.

use std::io;

use tokio::net::UnixStream;

/// Peer identity as reported by the kernel (`SO_PEERCRED`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<i32>,
}

impl PeerCredentials {
    /// Query the kernel for the peer of an accepted connection.
    pub fn from_stream(stream: &UnixStream) -> io::Result<Self> {
        let cred = stream.peer_cred()?;
        Ok(Self {
            uid: cred.uid(),
            gid: cred.gid(),
            pid: cred.pid(),
        })
    }
}

/// Exact-match authorization. There is deliberately no carve-out for
/// root: a root-owned process that is not the brain has no business on
/// this socket, and letting it through would hide a misconfiguration.
pub fn authorize_peer(peer: PeerCredentials, expected_brain_uid: u32) -> bool {
    peer.uid == expected_brain_uid
}
