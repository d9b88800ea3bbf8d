//! Deterministic partitioning of source bytes into addressable chunks.
//!
//! Every strategy yields chunks that are contiguous, non-overlapping, and
//! cover the whole source.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::pointer::chunk_id;

/// How chunk boundaries are chosen inside the target window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    /// Fixed-size windows of `target_bytes`.
    #[default]
    Byte,
    /// Break after the last newline inside the window, or at the target when
    /// the window holds no newline.
    Newline,
}

impl ChunkStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkStrategy::Byte => "byte",
            ChunkStrategy::Newline => "newline",
        }
    }
}

/// One addressable slice of the source: `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub start: usize,
    pub end: usize,
    pub sha256: String,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Split `source` into chunks. An empty source has no chunks.
pub fn chunk_source(
    source: &[u8],
    target_bytes: usize,
    strategy: ChunkStrategy,
) -> Result<Vec<Chunk>> {
    if target_bytes == 0 {
        bail!("context chunk target_bytes must be > 0");
    }
    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < source.len() {
        let window_end = (start + target_bytes).min(source.len());
        let end = match strategy {
            ChunkStrategy::Byte => window_end,
            ChunkStrategy::Newline if window_end == source.len() => window_end,
            ChunkStrategy::Newline => source[start..window_end]
                .iter()
                .rposition(|byte| *byte == b'\n')
                .map(|idx| start + idx + 1)
                .unwrap_or(window_end),
        };
        chunks.push(Chunk {
            id: chunk_id(chunks.len() + 1),
            start,
            end,
            sha256: sha256_hex(&source[start..end]),
        });
        start = end;
    }
    Ok(chunks)
}

/// Check the coverage invariant; returns a description of the first violation.
pub fn check_coverage(chunks: &[Chunk], source_len: usize) -> Result<()> {
    let mut cursor = 0usize;
    for chunk in chunks {
        if chunk.start != cursor {
            bail!(
                "chunk {} starts at {} but previous chunk ended at {}",
                chunk.id,
                chunk.start,
                cursor
            );
        }
        if chunk.end <= chunk.start {
            bail!("chunk {} is empty or inverted", chunk.id);
        }
        cursor = chunk.end;
    }
    if cursor != source_len {
        bail!("chunks cover {cursor} bytes of {source_len}");
    }
    Ok(())
}
