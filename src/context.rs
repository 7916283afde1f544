//! Context assembler.
//!
//! Given a user question plus optional attachments and pinned sources,
//! produces the ordered, token-budgeted passage list handed to the
//! completion client. Groups appear in a fixed order — attachments, full
//! pinned/top sources, related sources, remaining filtered chunks — and the
//! list is truncated to `generation.max_chunks`.
//!
//! Two excerpt strategies keep large files inside the budget:
//!
//! - **Centered neighborhood**: when a best-matching chunk anchors the
//!   source, a window of neighboring chunk ids is loaded and stitched back
//!   together, removing the chunker overlap at each seam.
//! - **In-memory sub-index**: when a pinned source has no anchor chunk, its
//!   vectors are loaded into a scratch inner-product index and queried with
//!   the question vectors; the best chunks are concatenated.
//!
//! Progress pings go through the `on_info` callback; the HTTP layer wraps
//! them in `[meta]` SSE content frames.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chunk::{content_type_to_str, detect_content_type, Chunker};
use crate::config::{ApiConfig, Settings};
use crate::embedding::{EmbeddingClient, EncodeKind};
use crate::index::{AnnIndex, DistanceMetric};
use crate::models::{Attachment, SearchResult};
use crate::sources::SourceProcessor;
use crate::store::VectorStore;
use crate::tokenizer::Tokenizer;

/// Hard bounds on the centered-neighborhood window size.
const MIN_WINDOW: usize = 1;
const MAX_WINDOW: usize = 101;

/// Cap on how many of a source's chunks feed the scratch sub-index.
const SUB_INDEX_CAP: usize = 999;

/// Share of the budget attachments may consume.
const ATTACHMENT_BUDGET_RATIO: f32 = 0.8;

/// Attachments below this share of the attachment budget are accepted in
/// the first, non-truncating pass.
const SMALL_ATTACHMENT_RATIO: f32 = 0.2;

pub struct AssembleRequest {
    pub question: String,
    /// Already wrapped as `[Attachment: name]...[/Attachment]` upstream.
    pub attachments: Vec<Attachment>,
    /// Source ids the caller pinned into the context.
    pub pinned_sources: Vec<String>,
    pub api: ApiConfig,
    /// Fraction of the provider context length available, clamped to
    /// `[0.1, 1.0]`.
    pub ctx_ratio: f32,
    /// Skip retrieval entirely; only attachments and pinned sources count.
    pub attached_only: bool,
}

pub struct Assembler<'a> {
    store: &'a VectorStore,
    tokenizer: Arc<Tokenizer>,
    settings: &'a Settings,
    processor: &'a SourceProcessor,
}

impl<'a> Assembler<'a> {
    pub fn new(
        store: &'a VectorStore,
        tokenizer: Arc<Tokenizer>,
        settings: &'a Settings,
        processor: &'a SourceProcessor,
    ) -> Self {
        Self {
            store,
            tokenizer,
            settings,
            processor,
        }
    }

    /// Assemble the ordered passage list. Returns the passages and the
    /// total token count charged against the budget (question included).
    pub async fn assemble(
        &self,
        request: AssembleRequest,
        on_info: &mut (dyn FnMut(&str) + Send),
    ) -> Result<(Vec<SearchResult>, usize)> {
        let AssembleRequest {
            question,
            mut attachments,
            pinned_sources,
            api,
            ctx_ratio,
            mut attached_only,
        } = request;

        let max_token_budget =
            (api.context_length as f32 * ctx_ratio.clamp(0.1, 1.0)) as usize;
        if attached_only && attachments.is_empty() && pinned_sources.is_empty() {
            warn!("'attached_only' set without attachments or sources; ignoring");
            on_info("'attached_only' is set but no attachments or sources provided; ignoring.");
            attached_only = false;
        }

        let question_tokens = self.tokenizer.count(&question, false);
        let mut used_tokens = question_tokens;
        info!(budget = max_token_budget, question = question_tokens, "Assembling context");

        let mut attachment_results: Vec<SearchResult> = Vec::new();
        let mut full_source_results: Vec<SearchResult> = Vec::new();
        let mut related_results: Vec<SearchResult> = Vec::new();
        let mut filtered_chunk_results: Vec<SearchResult> = Vec::new();

        // --- Attachments: small ones whole, the rest truncating. ---
        if !attachments.is_empty() {
            on_info("Processing attachment(s)");
        }
        let max_att_budget = (max_token_budget as f32 * ATTACHMENT_BUDGET_RATIO) as usize;
        let small_cutoff = (max_att_budget as f32 * SMALL_ATTACHMENT_RATIO) as usize;

        let mut deferred = Vec::new();
        for attachment in attachments.drain(..) {
            let tokens = self.tokenizer.count(&attachment.content, false);
            if tokens < small_cutoff && used_tokens + tokens < max_att_budget {
                used_tokens += tokens;
                on_info(&format!("Adding attachment {}", attachment.filename));
                attachment_results.push(attachment_result(&attachment, attachment.content.clone()));
            } else {
                deferred.push(attachment);
            }
        }
        for attachment in deferred {
            if max_att_budget <= used_tokens {
                break;
            }
            on_info(&format!("Adding attachment {}", attachment.filename));
            let tokens = self.tokenizer.count(&attachment.content, false);
            let content = if used_tokens + tokens < max_att_budget {
                used_tokens += tokens;
                attachment.content.clone()
            } else {
                let chunker = self.budget_chunker();
                let truncated = chunker
                    .truncate_to_tokens(&attachment.content, max_att_budget - used_tokens);
                used_tokens = max_att_budget;
                let percent =
                    ((truncated.len() as f64 / attachment.content.len().max(1) as f64) * 100.0) as u32;
                warn!(
                    attachment = %attachment.filename,
                    percent,
                    "Attachment too large, truncated"
                );
                on_info(&format!(
                    "{} truncated to {}% ",
                    attachment.filename, percent
                ));
                truncated
            };
            attachment_results.push(attachment_result(&attachment, content));
        }
        debug!(tokens = used_tokens - question_tokens, "Budget used for attachments");

        // --- Question embedding (also needed by the sub-index excerpts). ---
        let embedding_api = self.settings.embedding_current_api()?;
        let embedding_client =
            EmbeddingClient::new(embedding_api, self.settings.embedding.timeout_ms);
        let question_chunks = self.budget_chunker().chunk_text(&question, "", false);
        let question_texts: Vec<String> = if question_chunks.is_empty() {
            vec![question.clone()]
        } else {
            question_chunks.into_iter().map(|c| c.text).collect()
        };
        let question_vectors = embedding_client
            .generate(&question_texts, EncodeKind::Query)
            .await
            .context("Failed to embed the question")?;

        let mut sources = dedup_preserving_order(pinned_sources);
        let mut source_to_chunk: HashMap<String, SearchResult> = HashMap::new();
        let mut related_sources: Vec<String> = Vec::new();
        let mut all_full_sources: Vec<String>;

        if !attached_only {
            // Merge per-vector search results, dedup by chunk id, rank
            // sources by aggregate similarity.
            let mut seen_chunks: HashSet<i64> = HashSet::new();
            let mut source_rank: HashMap<String, f32> = HashMap::new();
            for vector in &question_vectors {
                let results = self
                    .store
                    .search(vector, self.settings.embedding.top_k)
                    .await?;
                for result in results {
                    *source_rank.entry(result.source_id.clone()).or_default() +=
                        result.similarity_score;
                    if result
                        .chunk_id
                        .map(|id| seen_chunks.insert(id))
                        .unwrap_or(false)
                    {
                        filtered_chunk_results.push(result);
                    }
                }
            }
            filtered_chunk_results.sort_by(|a, b| {
                let ra = source_rank.get(&a.source_id).copied().unwrap_or(0.0);
                let rb = source_rank.get(&b.source_id).copied().unwrap_or(0.0);
                rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
            });

            let max_full_sources = self.settings.generation.max_full_sources;
            for result in &filtered_chunk_results {
                if sources.len() >= max_full_sources {
                    break;
                }
                if !sources.contains(&result.source_id) {
                    sources.push(result.source_id.clone());
                }
                source_to_chunk
                    .entry(result.source_id.clone())
                    .or_insert_with(|| result.clone());
            }

            let tracked: Vec<String> = self
                .store
                .get_tracked_files()
                .await?
                .into_iter()
                .map(|f| f.path)
                .collect();

            all_full_sources = sources.clone();
            for source in sources.clone() {
                for related in self.processor.filter_related_sources(&tracked, &source) {
                    if !sources.contains(&related) && !related_sources.contains(&related) {
                        related_sources.push(related.clone());
                        all_full_sources.push(related);
                    }
                }
            }
            for related in &related_sources {
                on_info(&format!("Adding related file {}", file_name_of(related)));
            }
        } else {
            all_full_sources = sources.clone();
        }

        // --- Full sources (pinned + top-ranked). ---
        let mut source_tokens = 0usize;
        for (j, source) in sources.iter().enumerate() {
            if max_token_budget <= used_tokens {
                break;
            }
            let content = match self.processor.fetch_source(source).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(source = %source, error = %e, "Failed to fetch source, skipped");
                    continue;
                }
            };
            if content.is_empty() {
                continue;
            }

            let before = used_tokens;
            if let Some(anchor) = source_to_chunk.get(source) {
                match self
                    .shape_content(
                        content,
                        source,
                        anchor.chunk_id,
                        max_token_budget,
                        &mut used_tokens,
                    )
                    .await?
                {
                    Some(content) => {
                        source_tokens += used_tokens - before;
                        full_source_results.push(source_result(source, content));
                    }
                    // Nothing fits anymore; later sources can only be larger
                    // than the remaining budget's threshold.
                    None => break,
                }
            } else {
                let mut threshold_ratio = self.settings.generation.excerpt.threshold_ratio;
                if attached_only && j == sources.len() - 1 {
                    threshold_ratio = 1.0;
                }
                if let Some(content) = self
                    .shape_pinned_content(
                        content,
                        source,
                        threshold_ratio,
                        max_token_budget,
                        &mut used_tokens,
                        &question_vectors,
                        on_info,
                    )
                    .await?
                {
                    source_tokens += used_tokens - before;
                    full_source_results.push(source_result(source, content));
                }
            }
        }
        debug!(tokens = source_tokens, "Budget used for full sources");

        // --- Related sources, centered on the middle chunk. ---
        if !attached_only {
            let mut related_tokens = 0usize;
            for related in &related_sources {
                let Ok(content) = self.processor.fetch_source(related).await else {
                    continue;
                };
                if content.is_empty() {
                    continue;
                }
                let before = used_tokens;
                if let Some(content) = self
                    .shape_content(content, related, None, max_token_budget, &mut used_tokens)
                    .await?
                {
                    related_tokens += used_tokens - before;
                    related_results.push(source_result(related, content));
                }
            }
            debug!(tokens = related_tokens, "Budget used for related sources");

            // Chunks whose whole file is already present add nothing.
            filtered_chunk_results.retain(|r| {
                !(all_full_sources.contains(&r.source_id) && r.chunk_id.is_some())
            });
        }

        let mut ordered = attachment_results;
        ordered.extend(full_source_results);
        ordered.extend(related_results);
        ordered.extend(filtered_chunk_results);
        ordered.truncate(self.settings.generation.max_chunks);

        on_info(&format!(
            "Context token budget used {}/{}",
            used_tokens, max_token_budget
        ));
        Ok((ordered, used_tokens))
    }

    /// Fit a source's content into the remaining budget, replacing it with
    /// a centered-neighborhood excerpt when too large. Charges `used`.
    /// `None` means nothing fit (or excerpts are disabled).
    async fn shape_content(
        &self,
        content: String,
        source: &str,
        anchor: Option<i64>,
        max_token_budget: usize,
        used: &mut usize,
    ) -> Result<Option<String>> {
        let excerpt_budget = max_token_budget.saturating_sub(*used);
        if excerpt_budget == 0 {
            return Ok(None);
        }
        let excerpt = &self.settings.generation.excerpt;
        let avg_chunk_tokens = self.settings.chunking.nof_max_tokens;
        let tokens = self.tokenizer.count(&content, false);
        let threshold =
            ((excerpt_budget as f32 * excerpt.threshold_ratio) as usize).max(avg_chunk_tokens);

        if tokens <= threshold {
            *used += tokens;
            return Ok(Some(content));
        }
        if !excerpt.enabled {
            return Ok(None);
        }

        let ids = self.store.get_chunk_ids_by_source(source).await?;
        if ids.is_empty() {
            return Ok(None);
        }
        let anchor = anchor.unwrap_or(ids[ids.len() / 2]);
        let window_size = neighbor_count(
            (excerpt_budget as f32 * excerpt.threshold_ratio) as usize,
            avg_chunk_tokens,
            excerpt.min_chunks,
            excerpt.max_chunks,
        );
        let window = closest_neighbors(&ids, anchor, window_size);

        let mut neighborhood = Vec::with_capacity(window.len());
        for id in window {
            if let Some(chunk) = self.store.get_chunk_data(id).await? {
                neighborhood.push(chunk.content);
            }
        }
        let stitched = stitch_chunks(&neighborhood);
        *used += self.tokenizer.count(&stitched, false);
        Ok(Some(stitched))
    }

    /// Fit a pinned source with no anchor chunk: accept whole under the
    /// threshold, otherwise retrieve its best chunks through a scratch
    /// inner-product sub-index over the source's own vectors.
    #[allow(clippy::too_many_arguments)]
    async fn shape_pinned_content(
        &self,
        content: String,
        source: &str,
        threshold_ratio: f32,
        max_token_budget: usize,
        used: &mut usize,
        question_vectors: &[Vec<f32>],
        on_info: &mut (dyn FnMut(&str) + Send),
    ) -> Result<Option<String>> {
        let excerpt_budget = max_token_budget.saturating_sub(*used);
        if excerpt_budget == 0 {
            return Ok(None);
        }
        let avg_chunk_tokens = self.settings.chunking.nof_max_tokens;
        let tokens = self.tokenizer.count(&content, false);
        let threshold =
            ((excerpt_budget as f32 * threshold_ratio) as usize).max(avg_chunk_tokens);
        if tokens <= threshold {
            *used += tokens;
            return Ok(Some(content));
        }

        on_info(&format!("Processing large file {}", file_name_of(source)));
        let mut ids = self.store.get_chunk_ids_by_source(source).await?;
        if ids.is_empty() {
            return Ok(None);
        }
        ids.truncate(SUB_INDEX_CAP);

        let dim = self.store.vector_dim();
        let mut sub_index = AnnIndex::new(dim, SUB_INDEX_CAP + 1, DistanceMetric::Cosine);
        let mut id_to_content: HashMap<i64, String> = HashMap::new();
        for id in &ids {
            let Some(vector) = self.store.get_embedding_vector(*id) else {
                continue;
            };
            if let Some(chunk) = self.store.get_chunk_data(*id).await? {
                let _ = sub_index.insert(&vector, *id);
                id_to_content.insert(*id, chunk.content);
            }
        }

        let max_chunks = excerpt_budget / avg_chunk_tokens.max(1);
        let top_k = (max_chunks as f32 * threshold_ratio) as usize;
        if top_k == 0 {
            return Ok(None);
        }

        let mut collected = String::new();
        let mut fetched = 0usize;
        for vector in question_vectors {
            let hits = sub_index.search_knn(vector, top_k);
            fetched = hits.len();
            for (id, _) in hits {
                if let Some(text) = id_to_content.get(&id) {
                    collected.push_str(text);
                }
            }
        }
        if collected.is_empty() {
            return Ok(None);
        }
        on_info(&format!(
            "Adding {} relevant chunks from {}",
            fetched,
            file_name_of(source)
        ));
        *used += self.tokenizer.count(&collected, false);
        Ok(Some(collected))
    }

    /// Non-overlapping chunker used for question splitting and attachment
    /// truncation.
    fn budget_chunker(&self) -> Chunker {
        Chunker::new(
            Arc::clone(&self.tokenizer),
            1,
            self.settings.chunking.nof_max_tokens,
            0.0,
        )
    }
}

/// Window size for a centered-neighborhood excerpt:
/// `clamp(budget / avg_chunk_tokens, min_chunks, max_chunks)`, then clamped
/// into `[1, 101]`.
pub fn neighbor_count(
    excerpt_budget: usize,
    avg_chunk_tokens: usize,
    min_chunks: usize,
    max_chunks: usize,
) -> usize {
    let neighbors = excerpt_budget / avg_chunk_tokens.max(1);
    neighbors
        .clamp(min_chunks.max(1), max_chunks.max(min_chunks.max(1)))
        .clamp(MIN_WINDOW, MAX_WINDOW)
}

/// Select an `m`-wide contiguous window of `ids` centered on `anchor`.
///
/// The anchor is always part of the result: if absent from `ids` it is
/// inserted at its sorted position and the window trimmed symmetrically.
pub fn closest_neighbors(ids: &[i64], anchor: i64, m: usize) -> Vec<i64> {
    if ids.is_empty() || m == 0 {
        return Vec::new();
    }
    let idx = ids.partition_point(|&id| id < anchor);
    let has_anchor = idx < ids.len() && ids[idx] == anchor;
    let half = m / 2;

    let mut start = idx.saturating_sub(half);
    let end = (start + m).min(ids.len());
    // Slide the window back toward the end when it came up short.
    if end - start < m && end == ids.len() {
        start = end.saturating_sub(m);
    }

    let mut window: Vec<i64> = ids[start..end].to_vec();
    if !has_anchor {
        let pos = window.partition_point(|&id| id < anchor);
        window.insert(pos, anchor);
        if window.len() > m {
            if idx < ids.len() / 2 {
                window.pop();
            } else {
                window.remove(0);
            }
        }
    }
    window
}

/// Concatenate chunks, dropping the longest suffix-of-accumulator /
/// prefix-of-next overlap at each seam (undoes the chunker overlap).
pub fn stitch_chunks(chunks: &[String]) -> String {
    let Some(first) = chunks.first() else {
        return String::new();
    };
    let mut result = String::with_capacity(chunks.iter().map(|c| c.len()).sum());
    result.push_str(first);
    for chunk in &chunks[1..] {
        let overlap = suffix_prefix_overlap(&result, chunk);
        result.push_str(&chunk[overlap..]);
    }
    result
}

fn suffix_prefix_overlap(a: &str, b: &str) -> usize {
    let max_len = a.len().min(b.len());
    for len in (1..=max_len).rev() {
        if !a.is_char_boundary(a.len() - len) || !b.is_char_boundary(len) {
            continue;
        }
        if a[a.len() - len..] == b[..len] {
            return len;
        }
    }
    0
}

fn attachment_result(attachment: &Attachment, content: String) -> SearchResult {
    let source = if attachment.filename.is_empty() {
        "attachment"
    } else {
        &attachment.filename
    };
    let kind = content_type_to_str(detect_content_type(&content, &attachment.filename));
    SearchResult::synthetic(source, content, kind)
}

fn source_result(source: &str, content: String) -> SearchResult {
    let kind = content_type_to_str(detect_content_type(&content, source));
    SearchResult::synthetic(source, content, kind)
}

fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

fn file_name_of(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stitch_single_is_identity() {
        let chunks = vec!["alpha beta".to_string()];
        assert_eq!(stitch_chunks(&chunks), "alpha beta");
        assert_eq!(stitch_chunks(&[]), "");
    }

    #[test]
    fn stitch_removes_overlap() {
        let chunks = vec!["one two three".to_string(), "two three four".to_string()];
        assert_eq!(stitch_chunks(&chunks), "one two three four");
    }

    #[test]
    fn stitch_without_overlap_concatenates() {
        let chunks = vec!["abc".to_string(), "def".to_string()];
        assert_eq!(stitch_chunks(&chunks), "abcdef");
    }

    #[test]
    fn stitch_chain() {
        let chunks = vec![
            "a b c d".to_string(),
            "c d e f".to_string(),
            "e f g h".to_string(),
        ];
        assert_eq!(stitch_chunks(&chunks), "a b c d e f g h");
    }

    #[test]
    fn window_contains_anchor() {
        let ids: Vec<i64> = (1..=20).collect();
        let window = closest_neighbors(&ids, 10, 5);
        assert_eq!(window.len(), 5);
        assert!(window.contains(&10));
        // Contiguous in id order.
        assert!(window.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn window_clamps_at_edges() {
        let ids: Vec<i64> = (1..=10).collect();
        let low = closest_neighbors(&ids, 1, 4);
        assert_eq!(low, vec![1, 2, 3, 4]);

        let high = closest_neighbors(&ids, 10, 4);
        assert_eq!(high, vec![7, 8, 9, 10]);
    }

    #[test]
    fn window_shorter_than_request() {
        let ids: Vec<i64> = vec![3, 4, 5];
        let window = closest_neighbors(&ids, 4, 10);
        assert_eq!(window, vec![3, 4, 5]);
    }

    #[test]
    fn window_inserts_missing_anchor() {
        let ids: Vec<i64> = vec![1, 2, 4, 5, 6];
        let window = closest_neighbors(&ids, 3, 3);
        assert!(window.contains(&3));
        assert!(window.len() <= 3 + 1);
    }

    #[test]
    fn neighbor_count_clamps() {
        assert_eq!(neighbor_count(1000, 100, 3, 9), 9);
        assert_eq!(neighbor_count(100, 100, 3, 9), 3);
        assert_eq!(neighbor_count(0, 100, 3, 9), 3);
        // Hard ceiling.
        assert_eq!(neighbor_count(1_000_000, 1, 3, 500), 101);
    }
}
