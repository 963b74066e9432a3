//! Inbound chunk reassembly
//!
//! Chunks arrive in any order, possibly duplicated. Each `messageId` gets
//! an assembly slot table; once every index is filled the concatenation is
//! parsed back into a frame. Stale and excess assemblies are garbage
//! collected so a misbehaving peer cannot grow the table without bound.

use crate::frames::{ChunkPayload, Frame};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Assemblies older than this are eligible for eviction.
pub const MAX_ASSEMBLY_AGE: Duration = Duration::from_secs(30);

/// Hard cap on concurrently tracked assemblies.
pub const MAX_ASSEMBLIES: usize = 100;

/// Opportunistic GC runs once per this many chunk arrivals.
const GC_ARRIVAL_INTERVAL: u64 = 10;

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("Invalid chunk: index {index} out of range for {total} chunks")]
    IndexOutOfRange { index: usize, total: usize },

    #[error("Invalid chunk: totalChunks is zero")]
    EmptyTotal,

    #[error("Chunk count mismatch for message {message_id}: {got} vs {expected}")]
    TotalMismatch {
        message_id: String,
        got: usize,
        expected: usize,
    },

    #[error("Failed to parse reassembled frame: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug)]
struct Assembly {
    chunks: Vec<Option<String>>,
    received: usize,
    created_at: Instant,
}

impl Assembly {
    fn new(total: usize) -> Self {
        Self {
            chunks: vec![None; total],
            received: 0,
            created_at: Instant::now(),
        }
    }
}

/// Reassembly table for inbound chunked frames. Owned by the session and
/// torn down with it.
#[derive(Default, Debug)]
pub struct ChunkAssembler {
    assemblies: HashMap<String, Assembly>,
    arrivals: u64,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one inbound chunk. Returns the reassembled frame once the last
    /// missing index arrives; `None` while the assembly is still partial.
    ///
    /// The assembly is always discarded on completion, including when the
    /// reassembled text fails to parse (the error carries the cause).
    pub fn accept(&mut self, payload: ChunkPayload) -> Result<Option<Frame>, AssemblyError> {
        self.arrivals = self.arrivals.wrapping_add(1);
        if self.arrivals % GC_ARRIVAL_INTERVAL == 0 {
            self.cleanup(MAX_ASSEMBLY_AGE, MAX_ASSEMBLIES);
        }

        if payload.total_chunks == 0 {
            return Err(AssemblyError::EmptyTotal);
        }
        if payload.chunk_index >= payload.total_chunks {
            return Err(AssemblyError::IndexOutOfRange {
                index: payload.chunk_index,
                total: payload.total_chunks,
            });
        }

        let assembly = self
            .assemblies
            .entry(payload.message_id.clone())
            .or_insert_with(|| Assembly::new(payload.total_chunks));

        if assembly.chunks.len() != payload.total_chunks {
            let expected = assembly.chunks.len();
            return Err(AssemblyError::TotalMismatch {
                message_id: payload.message_id,
                got: payload.total_chunks,
                expected,
            });
        }

        // Duplicate indexes overwrite but must not double-count.
        let slot = &mut assembly.chunks[payload.chunk_index];
        if slot.is_none() {
            assembly.received += 1;
        }
        *slot = Some(payload.chunk);

        if assembly.received < assembly.chunks.len() {
            return Ok(None);
        }

        let Some(assembly) = self.assemblies.remove(&payload.message_id) else {
            return Ok(None);
        };
        let text: String = assembly.chunks.into_iter().flatten().collect();
        let frame: Frame = serde_json::from_str(&text)?;
        Ok(Some(frame))
    }

    /// Number of in-flight assemblies.
    pub fn len(&self) -> usize {
        self.assemblies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assemblies.is_empty()
    }

    /// Drop everything, e.g. when the session closes.
    pub fn clear(&mut self) {
        self.assemblies.clear();
    }

    /// Evict assemblies older than `max_age`, then evict oldest-first until
    /// at most `max_entries` remain.
    pub fn cleanup(&mut self, max_age: Duration, max_entries: usize) {
        self.assemblies
            .retain(|_, assembly| assembly.created_at.elapsed() <= max_age);

        if self.assemblies.len() > max_entries {
            let mut by_age: Vec<(String, Instant)> = self
                .assemblies
                .iter()
                .map(|(id, a)| (id.clone(), a.created_at))
                .collect();
            by_age.sort_by_key(|(_, created_at)| *created_at);

            let excess = self.assemblies.len() - max_entries;
            for (id, _) in by_age.into_iter().take(excess) {
                self.assemblies.remove(&id);
            }
        }
    }
}
