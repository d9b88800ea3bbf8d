//! Content-addressed context store: chunked source bytes on disk plus an
//! index, addressed by `ctx:` pointers.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::budget::Budgets;
use crate::core::chunking::{Chunk, ChunkStrategy, check_coverage, chunk_source, sha256_hex};
use crate::core::pointer::{Pointer, context_pointer, parse_context_pointer};
use crate::core::text::{collapse_whitespace, decode_lossy};
use crate::core::types::SearchHit;
use crate::io::artifacts::{CONTEXT_DIR, write_atomic, write_json_atomic};
use crate::io::config::ContextConfig;

pub const INDEX_FILE: &str = "index.json";
pub const SOURCE_FILE: &str = "source.txt";
const INDEX_VERSION: u32 = 1;
const OBJECT_ID_PREFIX: &str = "sha256:";

pub enum ContextSource<'a> {
    Text(&'a str),
    File(&'a Path),
    /// An existing context directory holding `index.json` and `source.txt`.
    Directory(&'a Path),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub path: String,
    pub byte_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingInfo {
    pub target_bytes: usize,
    pub strategy: ChunkStrategy,
}

/// Persisted `index.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextIndex {
    pub version: u32,
    pub object_id: String,
    pub created_at: String,
    pub source: SourceInfo,
    pub chunking: ChunkingInfo,
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResult {
    pub text: String,
    pub start_byte: usize,
    pub end_byte: usize,
    /// Fewer bytes than requested were available.
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    pub clamped_top_k: bool,
}

#[derive(Debug)]
pub struct ContextStore {
    dir: PathBuf,
    index: ContextIndex,
    source: Vec<u8>,
    chunk_slots: HashMap<String, usize>,
}

impl ContextStore {
    /// Materialize `source` under `<run_dir>/context/<hex>/`.
    ///
    /// Building the same bytes twice reuses the existing directory.
    pub fn build(run_dir: &Path, source: ContextSource<'_>, cfg: &ContextConfig) -> Result<Self> {
        let bytes = match source {
            ContextSource::Text(text) => text.as_bytes().to_vec(),
            ContextSource::File(path) => {
                fs::read(path).with_context(|| format!("read context source {}", path.display()))?
            }
            ContextSource::Directory(dir) => return Self::open(dir),
        };
        let digest = sha256_hex(&bytes);
        let dir = run_dir.join(CONTEXT_DIR).join(&digest);
        if dir.join(INDEX_FILE).exists() {
            debug!(dir = %dir.display(), "reusing existing context directory");
            return Self::open(&dir);
        }

        let chunks = chunk_source(&bytes, cfg.chunk_target_bytes, cfg.strategy)?;
        let index = ContextIndex {
            version: INDEX_VERSION,
            object_id: format!("{OBJECT_ID_PREFIX}{digest}"),
            created_at: chrono::Utc::now().to_rfc3339(),
            source: SourceInfo {
                path: SOURCE_FILE.to_string(),
                byte_length: bytes.len(),
            },
            chunking: ChunkingInfo {
                target_bytes: cfg.chunk_target_bytes,
                strategy: cfg.strategy,
            },
            chunks,
        };
        write_atomic(&dir.join(SOURCE_FILE), &bytes)?;
        write_json_atomic(&dir.join(INDEX_FILE), &index)?;
        info!(
            object_id = %index.object_id,
            chunks = index.chunks.len(),
            bytes = bytes.len(),
            "context store built"
        );
        Ok(Self::from_parts(dir, index, bytes))
    }

    /// Re-open a context directory, validating the index against the source.
    pub fn open(dir: &Path) -> Result<Self> {
        let index_path = dir.join(INDEX_FILE);
        let raw = fs::read_to_string(&index_path)
            .with_context(|| format!("read context index {}", index_path.display()))?;
        let index: ContextIndex = serde_json::from_str(&raw)
            .with_context(|| format!("parse context index {}", index_path.display()))?;
        if index.version != INDEX_VERSION {
            bail!("unsupported context index version {}", index.version);
        }
        let source_path = dir.join(&index.source.path);
        let bytes = fs::read(&source_path)
            .with_context(|| format!("read context source {}", source_path.display()))?;
        if bytes.len() != index.source.byte_length {
            bail!(
                "context source is {} bytes but index records {}",
                bytes.len(),
                index.source.byte_length
            );
        }
        let expected = format!("{OBJECT_ID_PREFIX}{}", sha256_hex(&bytes));
        if expected != index.object_id {
            bail!("context object id mismatch: index {} vs source {expected}", index.object_id);
        }
        check_coverage(&index.chunks, bytes.len()).context("context index chunk coverage")?;
        debug!(object_id = %index.object_id, chunks = index.chunks.len(), "context store opened");
        Ok(Self::from_parts(dir.to_path_buf(), index, bytes))
    }

    fn from_parts(dir: PathBuf, index: ContextIndex, source: Vec<u8>) -> Self {
        let chunk_slots = index
            .chunks
            .iter()
            .enumerate()
            .map(|(slot, chunk)| (chunk.id.clone(), slot))
            .collect();
        Self {
            dir,
            index,
            source,
            chunk_slots,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index(&self) -> &ContextIndex {
        &self.index
    }

    pub fn object_id(&self) -> &str {
        &self.index.object_id
    }

    pub fn source_len(&self) -> usize {
        self.source.len()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.index.chunks
    }

    pub fn pointer_for(&self, chunk: &Chunk) -> String {
        context_pointer(&self.index.object_id, &chunk.id)
    }

    fn resolve_chunk(&self, pointer: &str) -> Option<&Chunk> {
        match parse_context_pointer(pointer)? {
            Pointer::Context {
                object_id,
                chunk_id,
            } if object_id == self.index.object_id => self
                .chunk_slots
                .get(chunk_id)
                .map(|&slot| &self.index.chunks[slot]),
            _ => None,
        }
    }

    pub fn validate_pointer(&self, pointer: &str) -> bool {
        self.resolve_chunk(pointer).is_some()
    }

    /// Read up to `bytes` from a chunk starting at `offset`, clamped to the chunk.
    pub fn read(&self, pointer: &str, offset: usize, bytes: usize) -> Result<ReadResult> {
        let chunk = self
            .resolve_chunk(pointer)
            .ok_or_else(|| anyhow!("unknown context pointer {pointer}"))?;
        let start = chunk.start + offset.min(chunk.len());
        let end = start.saturating_add(bytes).min(chunk.end);
        Ok(self.slice(start, end, bytes))
    }

    /// Read up to `bytes` from an absolute source offset, clamped to the source.
    pub fn read_span(&self, start_byte: usize, bytes: usize) -> Result<ReadResult> {
        if start_byte > self.source.len() {
            bail!(
                "start_byte {start_byte} is past the end of the source ({} bytes)",
                self.source.len()
            );
        }
        let end = start_byte.saturating_add(bytes).min(self.source.len());
        Ok(self.slice(start_byte, end, bytes))
    }

    fn slice(&self, start: usize, end: usize, requested: usize) -> ReadResult {
        ReadResult {
            text: decode_lossy(&self.source[start..end]),
            start_byte: start,
            end_byte: end,
            truncated: end - start < requested,
        }
    }

    /// Case-insensitive (ASCII) substring search scored by occurrence count.
    ///
    /// A match belongs to the chunk it starts in, so each chunk is scanned
    /// `query.len() - 1` bytes into its successor and boundary-straddling
    /// matches are still found.
    pub fn search(&self, query: &str, top_k: usize, budgets: &Budgets) -> SearchResults {
        let clamped_top_k = top_k > budgets.search_top_k;
        let top_k = top_k.min(budgets.search_top_k);
        let needle = query.trim().as_bytes().to_ascii_lowercase();
        if needle.is_empty() || top_k == 0 {
            return SearchResults {
                hits: Vec::new(),
                clamped_top_k,
            };
        }

        let mut hits: Vec<SearchHit> = self
            .index
            .chunks
            .iter()
            .filter_map(|chunk| {
                let scan_end = (chunk.end + needle.len() - 1).min(self.source.len());
                let haystack = self.source[chunk.start..scan_end].to_ascii_lowercase();
                let chunk_len = chunk.end - chunk.start;
                let positions: Vec<usize> = find_non_overlapping(&haystack, &needle)
                    .into_iter()
                    .filter(|pos| *pos < chunk_len)
                    .collect();
                let first = *positions.first()?;
                let preview_end = (chunk.start + first + budgets.max_preview_bytes).min(scan_end);
                Some(SearchHit {
                    pointer: self.pointer_for(chunk),
                    offset: first,
                    start_byte: chunk.start + first,
                    match_bytes: needle.len(),
                    score: positions.len(),
                    preview: collapse_whitespace(&decode_lossy(
                        &self.source[chunk.start + first..preview_end],
                    )),
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.start_byte.cmp(&b.start_byte))
                .then_with(|| a.pointer.cmp(&b.pointer))
        });
        hits.truncate(top_k);
        debug!(query, hits = hits.len(), "context search");
        SearchResults {
            hits,
            clamped_top_k,
        }
    }
}

fn find_non_overlapping(haystack: &[u8], needle: &[u8]) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut cursor = 0usize;
    while cursor + needle.len() <= haystack.len() {
        if &haystack[cursor..cursor + needle.len()] == needle {
            positions.push(cursor);
            cursor += needle.len();
        } else {
            cursor += 1;
        }
    }
    positions
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "alpha beta\ngamma Alpha\ndelta alpha alpha\nomega\n";

    fn small_chunks() -> ContextConfig {
        ContextConfig {
            chunk_target_bytes: 20,
            strategy: ChunkStrategy::Newline,
        }
    }

    #[test]
    fn build_writes_index_and_reopens() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ContextStore::build(temp.path(), ContextSource::Text(SOURCE), &small_chunks())
            .expect("build");
        assert!(store.object_id().starts_with("sha256:"));
        assert!(store.dir().join(INDEX_FILE).exists());
        assert!(store.dir().join(SOURCE_FILE).exists());

        let reopened =
            ContextStore::build(temp.path(), ContextSource::Directory(store.dir()), &small_chunks())
                .expect("open");
        assert_eq!(reopened.index(), store.index());
    }

    #[test]
    fn open_rejects_tampered_source() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ContextStore::build(temp.path(), ContextSource::Text(SOURCE), &small_chunks())
            .expect("build");
        let tampered = SOURCE.replace("omega", "OMEGA");
        fs::write(store.dir().join(SOURCE_FILE), tampered).expect("tamper");
        let err = ContextStore::open(store.dir()).expect_err("mismatch");
        assert!(err.to_string().contains("object id mismatch"));
    }

    #[test]
    fn reads_clamp_to_chunk_and_source() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ContextStore::build(temp.path(), ContextSource::Text(SOURCE), &small_chunks())
            .expect("build");
        let first = store.pointer_for(&store.chunks()[0]);
        let read = store.read(&first, 6, 100).expect("read");
        assert_eq!(read.text, "beta\n");
        assert!(read.truncated);

        let exact = store.read(&first, 0, 5).expect("read");
        assert_eq!(exact.text, "alpha");
        assert!(!exact.truncated);

        let span = store.read_span(SOURCE.len() - 6, 100).expect("span");
        assert_eq!(span.text, "omega\n");
        assert!(span.truncated);
        assert!(store.read_span(SOURCE.len() + 1, 1).is_err());
        assert!(store.read("ctx:sha256:nope#chunk:c000001", 0, 1).is_err());
    }

    #[test]
    fn search_orders_by_score_then_position() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ContextStore::build(temp.path(), ContextSource::Text(SOURCE), &small_chunks())
            .expect("build");
        let results = store.search("  ALPHA ", 10, &Budgets::default());
        assert!(!results.clamped_top_k);
        let scores: Vec<usize> = results.hits.iter().map(|hit| hit.score).collect();
        assert_eq!(scores, vec![2, 1, 1]);
        assert!(results.hits[1].start_byte < results.hits[2].start_byte);
        assert!(results.hits[0].preview.starts_with("alpha"));

        assert!(store.search("   ", 10, &Budgets::default()).hits.is_empty());
    }

    #[test]
    fn search_finds_matches_that_cross_a_chunk_boundary() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = ContextConfig {
            chunk_target_bytes: 8,
            strategy: ChunkStrategy::Byte,
        };
        let store = ContextStore::build(temp.path(), ContextSource::Text("abcdefghijklmnop"), &cfg)
            .expect("build");
        assert_eq!(store.chunks().len(), 2);

        let results = store.search("GHIJ", 10, &Budgets::default());
        assert_eq!(results.hits.len(), 1);
        let hit = &results.hits[0];
        assert_eq!(hit.pointer, store.pointer_for(&store.chunks()[0]));
        assert_eq!(hit.offset, 6);
        assert_eq!(hit.start_byte, 6);
        assert_eq!(hit.match_bytes, 4);
        assert!(hit.preview.starts_with("ghij"), "{}", hit.preview);

        let tail = store.search("ijk", 10, &Budgets::default());
        assert_eq!(tail.hits.len(), 1);
        assert_eq!(tail.hits[0].pointer, store.pointer_for(&store.chunks()[1]));
    }

    #[test]
    fn search_clamps_top_k() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ContextStore::build(temp.path(), ContextSource::Text(SOURCE), &small_chunks())
            .expect("build");
        let budgets = Budgets {
            search_top_k: 1,
            ..Budgets::default()
        };
        let results = store.search("alpha", 5, &budgets);
        assert!(results.clamped_top_k);
        assert_eq!(results.hits.len(), 1);
    }

    #[test]
    fn validate_pointer_checks_object_and_chunk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ContextStore::build(temp.path(), ContextSource::Text(SOURCE), &small_chunks())
            .expect("build");
        let pointer = store.pointer_for(&store.chunks()[0]);
        assert!(store.validate_pointer(&pointer));
        assert!(!store.validate_pointer(&format!("ctx:{}#chunk:c999999", store.object_id())));
        assert!(!store.validate_pointer("ctx:sha256:other#chunk:c000001"));
    }
}
