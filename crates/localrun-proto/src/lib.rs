//! Tunnel Wire Protocol
//!
//! This crate defines the JSON frame types exchanged with the broker over
//! the control WebSocket, plus the chunking and reassembly machinery that
//! keeps every WebSocket message under the broker's size ceiling.

pub mod assembly;
pub mod chunker;
pub mod frames;

pub use assembly::{AssemblyError, ChunkAssembler};
pub use chunker::{encode_outbound, new_message_id, ChunkError};
pub use frames::{
    ChunkPayload, Frame, FrameKind, PingPayload, RequestPayload, ResponsePayload, SseChunkPayload,
    SseEndPayload, SseStartPayload,
};

/// Hard per-message ceiling imposed by the broker (bytes of UTF-8 JSON).
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Payload budget per chunk, leaving headroom for the chunk frame's own
/// JSON envelope under [`MAX_MESSAGE_BYTES`].
pub const CHUNK_PAYLOAD_BYTES: usize = 768 * 1024;
