//! Live build-log fan-out
//!
//! Maps deployments to browser subscribers. Broadcast never blocks: a
//! subscriber whose buffer is full loses that chunk and nothing else.
//! When the last subscriber leaves, the upstream agent stream is
//! cancelled so the Muscle stops building for a ghost audience.

use std::collections::HashMap;
use std::sync::Mutex;

use kari_proto::LogChunk;
use tokio::sync::mpsc;
use tracing::debug;

use crate::ports::StreamCancel;

/// Per-subscriber buffer; slow browsers lose detail, not the build.
pub const SUBSCRIBER_CAPACITY: usize = 100;

/// Identifies one subscription for unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

#[derive(Default)]
struct HubState {
    subscribers: HashMap<String, HashMap<u64, mpsc::Sender<LogChunk>>>,
    cancels: HashMap<String, StreamCancel>,
    next_id: u64,
}

/// The fan-out hub. Interior mutability via a plain mutex: no await ever
/// happens under the lock, broadcast included.
#[derive(Default)]
pub struct LogHub {
    state: Mutex<HubState>,
}

impl LogHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the cancel handle for a deployment's upstream stream. The
    /// worker registers this before it starts piping chunks.
    pub fn register_cancel(&self, deployment_id: &str, cancel: StreamCancel) {
        let mut state = self.state.lock().expect("hub lock");
        state.cancels.insert(deployment_id.to_string(), cancel);
    }

    /// Attach a browser client to a deployment's log stream.
    pub fn subscribe(&self, deployment_id: &str) -> (SubscriberId, mpsc::Receiver<LogChunk>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);

        let mut state = self.state.lock().expect("hub lock");
        let id = state.next_id;
        state.next_id += 1;
        state
            .subscribers
            .entry(deployment_id.to_string())
            .or_default()
            .insert(id, tx);

        (SubscriberId(id), rx)
    }

    /// Detach a client. Dropping the sender closes its channel; if the
    /// set becomes empty the upstream stream is cancelled and forgotten.
    pub fn unsubscribe(&self, deployment_id: &str, subscriber: SubscriberId) {
        let cancel = {
            let mut state = self.state.lock().expect("hub lock");

            let emptied = match state.subscribers.get_mut(deployment_id) {
                Some(subs) => {
                    subs.remove(&subscriber.0);
                    subs.is_empty()
                }
                None => false,
            };

            if emptied {
                state.subscribers.remove(deployment_id);
                state.cancels.remove(deployment_id)
            } else {
                None
            }
        };

        if let Some(cancel) = cancel {
            debug!(deployment_id, "last subscriber left, cancelling upstream stream");
            cancel.fire();
        }
    }

    /// Send a chunk to every subscriber of a deployment. Non-blocking:
    /// `try_send` drops the chunk for a full subscriber only. FIFO order
    /// per subscriber is preserved; drops leave gaps, never reorder.
    pub fn broadcast(&self, deployment_id: &str, chunk: &LogChunk) {
        let state = self.state.lock().expect("hub lock");
        if let Some(subs) = state.subscribers.get(deployment_id) {
            for tx in subs.values() {
                let _ = tx.try_send(chunk.clone());
            }
        }
    }

    /// End-of-stream: drop every subscriber sender (closing the channels,
    /// which is the completion signal browsers observe) and forget the
    /// cancel handle. The EOF chunk itself is broadcast by the caller
    /// before this.
    pub fn finish(&self, deployment_id: &str) {
        let mut state = self.state.lock().expect("hub lock");
        state.subscribers.remove(deployment_id);
        state.cancels.remove(deployment_id);
    }

    pub fn has_subscribers(&self, deployment_id: &str) -> bool {
        let state = self.state.lock().expect("hub lock");
        state
            .subscribers
            .get(deployment_id)
            .map(|subs| !subs.is_empty())
            .unwrap_or(false)
    }
}
