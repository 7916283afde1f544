//! Core data models used throughout Embedder.
//!
//! These types represent the chunks, search results, and file metadata that
//! flow through the ingestion and retrieval pipeline:
//!
//! ```text
//! SourceProcessor → chunk() → Chunk → embed() → VectorStore
//!                                                   ↓
//!                                           search() → SearchResult
//! ```
//!
//! # Type Relationships
//!
//! - A **[`Chunk`]** is a token-bounded slice of a source document, produced
//!   by the chunker. It is immutable once stored; re-ingesting a source is
//!   expressed as delete-then-insert of all of its chunks.
//! - **[`FileMetadata`]** is the per-path change-detection record (mtime,
//!   size, line count). A row exists iff at least one chunk of that path is
//!   (or was) indexed.
//! - A **[`SearchResult`]** is returned by the hybrid store with a
//!   similarity score in `[0, 1]` and, for ANN hits, the chunk id and raw
//!   distance.

use serde::{Deserialize, Serialize};

/// A contiguous slice of a source document, bounded by token count.
///
/// | Field | Description |
/// |-------|-------------|
/// | `text` | The chunk's text content |
/// | `source_id` | Owning source: a file path, or a URL stripped of query/fragment |
/// | `start` / `end` | Byte offsets `[start, end)` into the original document |
/// | `token_count` | Token count of `text` (always `> 0` for stored chunks) |
/// | `unit` | Split granularity the chunker chose: `"line"` or `"char"` |
/// | `kind` | Semantic tag: `"code"`, `"markdown"`, or `"text"` |
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Chunk text content.
    pub text: String,
    /// Owning source identifier.
    pub source_id: String,
    /// Byte offset of the chunk start in the original document.
    pub start: usize,
    /// Byte offset one past the chunk end in the original document.
    pub end: usize,
    /// Token count of `text`.
    pub token_count: usize,
    /// Split granularity (`"line"` or `"char"`).
    pub unit: String,
    /// Semantic content tag (`"code"`, `"markdown"`, `"text"`).
    pub kind: String,
}

/// A search result returned from the hybrid vector store.
///
/// `similarity_score` is normalized to `[0.0, 1.0]` (higher = more similar):
/// cosine uses `1 − distance`, L2 uses `1 / (1 + distance)`.
///
/// `chunk_id` is `None` for synthetic results the context assembler creates
/// for attachments and whole-source passages.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    /// Chunk (or passage) text.
    pub content: String,
    /// Owning source identifier.
    pub source_id: String,
    /// Split granularity of the underlying chunk.
    pub chunk_unit: String,
    /// Semantic content tag of the underlying chunk.
    pub chunk_type: String,
    /// Similarity score in `[0.0, 1.0]`, higher = more similar.
    pub similarity_score: f32,
    /// Byte offset of the chunk start.
    pub start_pos: usize,
    /// Byte offset one past the chunk end.
    pub end_pos: usize,
    /// Chunk id in the store, when this result came from the ANN index.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<i64>,
    /// Raw ANN distance, when this result came from the ANN index.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
}

impl SearchResult {
    /// Build a synthetic full-text result (used for attachments and whole
    /// sources injected by the context assembler). Scores as a perfect match.
    pub fn synthetic(source_id: &str, content: String, kind: &str) -> Self {
        let len = content.len();
        Self {
            content,
            source_id: source_id.to_string(),
            chunk_unit: "char".to_string(),
            chunk_type: kind.to_string(),
            similarity_score: 1.0,
            start_pos: 0,
            end_pos: len,
            chunk_id: None,
            distance: None,
        }
    }
}

/// Change-detection record for a tracked file path.
///
/// Timestamps are Unix epoch seconds (UTC). `path` is the primary key in
/// the `files_metadata` table.
#[derive(Debug, Clone, Serialize)]
pub struct FileMetadata {
    /// Absolute or config-relative file path (primary key).
    pub path: String,
    /// Last-modified time, Unix epoch seconds.
    pub last_modified: i64,
    /// File size in bytes.
    pub file_size: u64,
    /// Number of lines in the file at index time.
    pub nof_lines: u64,
}

/// A user-supplied attachment on a chat request.
#[derive(Debug, Clone, Deserialize)]
pub struct Attachment {
    /// Display name; empty when the client sent none.
    #[serde(default)]
    pub filename: String,
    /// Attachment body. Wrapped as `[Attachment: name]...[/Attachment]`
    /// before assembly when a filename is present.
    pub content: String,
}

/// Result of comparing configured sources against the tracked-file table.
#[derive(Debug, Default)]
pub struct UpdateInfo {
    /// Sources present on disk but not tracked.
    pub new_files: Vec<String>,
    /// Tracked sources whose size or mtime changed.
    pub modified_files: Vec<String>,
    /// Tracked sources no longer present among configured sources.
    pub deleted_files: Vec<String>,
    /// Tracked sources with no change.
    pub unchanged_files: Vec<String>,
}

impl UpdateInfo {
    /// True when any ingest work is required.
    pub fn needs_update(&self) -> bool {
        !self.new_files.is_empty()
            || !self.modified_files.is_empty()
            || !self.deleted_files.is_empty()
    }
}

/// Strip the query string and fragment from a URL, leaving the stable
/// source identifier.
pub fn strip_url_query_and_fragment(url: &str) -> &str {
    let cut = url
        .find('?')
        .into_iter()
        .chain(url.find('#'))
        .min()
        .unwrap_or(url.len());
    &url[..cut]
}
