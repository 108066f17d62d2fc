//! Wire schema for the Kari local-socket RPC.
//!
//! Both halves of the panel depend on this crate: the brain encodes
//! [`AgentRequest`] frames, the agent answers with [`AgentResponse`] frames
//! (or a sequence of [`LogChunk`] frames for streaming deployments).

pub mod framing;
pub mod messages;

pub use framing::{read_frame, write_frame, FrameError, MAX_FRAME_SIZE};
pub use messages::*;
