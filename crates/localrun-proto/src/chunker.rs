//! Outbound chunking
//!
//! Frames whose serialized form exceeds the broker's per-message ceiling
//! are split into `chunk` frames. Splits land on UTF-8 code point
//! boundaries so every chunk is itself valid UTF-8 and concatenating the
//! chunks reproduces the original serialization byte for byte.

use crate::frames::{ChunkPayload, Frame};
use crate::{CHUNK_PAYLOAD_BYTES, MAX_MESSAGE_BYTES};
use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("Failed to serialize frame: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A single code point is wider than the whole chunk budget. Cannot
    /// occur for any budget >= 4 bytes, but the guard stays.
    #[error("Single code point exceeds chunk budget of {budget} bytes")]
    CodePointTooLarge { budget: usize },
}

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate a chunk-group id: `{ms-since-epoch}-{9 random base36 chars}`.
pub fn new_message_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);

    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();

    format!("{}-{}", millis, suffix)
}

/// Serialize a frame into the WebSocket text messages that carry it.
///
/// Small frames pass through as a single message; oversized frames become
/// a run of `chunk` frames sharing one message id, with ascending indexes
/// and the original frame's type tag.
pub fn encode_outbound(frame: &Frame) -> Result<Vec<String>, ChunkError> {
    let serialized = serde_json::to_string(frame)?;

    if serialized.len() <= MAX_MESSAGE_BYTES {
        return Ok(vec![serialized]);
    }

    let pieces = split_utf8(&serialized, CHUNK_PAYLOAD_BYTES)?;
    let total_chunks = pieces.len();
    let message_id = new_message_id();
    let original_type = frame.kind();

    let mut messages = Vec::with_capacity(total_chunks);
    for (chunk_index, piece) in pieces.into_iter().enumerate() {
        let chunk_frame = Frame::Chunk(ChunkPayload {
            message_id: message_id.clone(),
            chunk_index,
            total_chunks,
            chunk: piece.to_string(),
            original_type,
        });
        messages.push(serde_json::to_string(&chunk_frame)?);
    }

    Ok(messages)
}

/// Split `s` into pieces of at most `budget` UTF-8 bytes, never bisecting
/// a code point.
fn split_utf8(s: &str, budget: usize) -> Result<Vec<&str>, ChunkError> {
    let mut pieces = Vec::with_capacity(s.len() / budget + 1);
    let mut rest = s;

    while !rest.is_empty() {
        let cut = split_point(rest, budget);
        if cut == 0 {
            return Err(ChunkError::CodePointTooLarge { budget });
        }
        let (piece, tail) = rest.split_at(cut);
        pieces.push(piece);
        rest = tail;
    }

    Ok(pieces)
}

/// Largest prefix length <= `budget` that ends on a code point boundary.
fn split_point(s: &str, budget: usize) -> usize {
    if s.len() <= budget {
        return s.len();
    }
    let mut idx = budget;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
