//! Ingestion pipeline orchestration.
//!
//! Coordinates the full flow: source collection → chunking → batched
//! embedding → transactional dual-store persistence, plus incremental
//! change detection (`update`) and index compaction.
//!
//! # Incremental update
//!
//! `update` re-reads the settings file (best effort), collects the current
//! sources, and diffs them against the tracked-file table by mtime and
//! size. Deleted sources are removed in one transaction; modified and new
//! sources are each processed in their own transaction (delete old chunks,
//! insert the re-embedded set), so readers observe either the complete old
//! or the complete new chunk set of a file.
//!
//! # Failure quarantine
//!
//! A file whose ingest fails gets its transaction rolled back and a strike
//! recorded; after three strikes it joins an in-memory ignore set and is
//! skipped by subsequent updates. Strikes clear on the first success and
//! reset on process restart.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::chunk::Chunker;
use crate::config::Settings;
use crate::embedding::{format_placeholder, EmbeddingClient, EncodeKind};
use crate::models::{Chunk, UpdateInfo};
use crate::sources::SourceProcessor;
use crate::store::VectorStore;
use crate::tokenizer::Tokenizer;

/// Consecutive failures before a file is quarantined.
const MAX_FAILURES: u32 = 3;

/// Totals reported by a full `embed` run.
#[derive(Debug, Default)]
pub struct EmbedSummary {
    pub files: usize,
    pub skipped: usize,
    pub chunks: usize,
    pub tokens: usize,
}

struct WorkState {
    failure_counts: HashMap<String, u32>,
    ignored_files: HashSet<String>,
    stats_cache: Option<serde_json::Value>,
    last_update: i64,
}

pub struct IngestEngine {
    store: Arc<VectorStore>,
    tokenizer: Arc<Tokenizer>,
    /// Settings snapshot, re-read on `update` and replaced by
    /// `POST /api/setup`. Held apart from `work` so readers never wait on
    /// a running ingest.
    settings: RwLock<Settings>,
    /// Serializes ingest work (watcher vs. HTTP-triggered updates).
    work: Mutex<WorkState>,
}

impl IngestEngine {
    pub fn new(store: Arc<VectorStore>, tokenizer: Arc<Tokenizer>, settings: Settings) -> Self {
        Self {
            store,
            tokenizer,
            settings: RwLock::new(settings),
            work: Mutex::new(WorkState {
                failure_counts: HashMap::new(),
                ignored_files: HashSet::new(),
                stats_cache: None,
                last_update: 0,
            }),
        }
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    pub fn tokenizer(&self) -> &Arc<Tokenizer> {
        &self.tokenizer
    }

    /// Snapshot of the engine's current settings (re-read on `update`).
    pub async fn settings(&self) -> Settings {
        self.settings.read().unwrap().clone()
    }

    pub async fn last_update_timestamp(&self) -> i64 {
        self.work.lock().await.last_update
    }

    /// Replace the settings from a parsed JSON config and save them to the
    /// settings file (the `POST /api/setup` path).
    pub async fn replace_settings(&self, config: serde_json::Value) -> Result<()> {
        {
            let mut settings = self.settings.write().unwrap();
            settings.replace_from_json(config)?;
            settings.save()?;
        }
        self.work.lock().await.stats_cache = None;
        Ok(())
    }

    /// Process and embed all configured sources. Sources already present in
    /// the tracked-file table are skipped.
    pub async fn embed(&self, no_prompt: bool) -> Result<EmbedSummary> {
        let mut work = self.work.lock().await;
        self.embed_locked(&mut work, no_prompt).await
    }

    async fn embed_locked(
        &self,
        work: &mut WorkState,
        no_prompt: bool,
    ) -> Result<EmbedSummary> {
        info!("Starting embedding process...");
        let settings = self.settings.read().unwrap().clone();
        let processor = SourceProcessor::new(settings.clone());
        let sources = processor.collect_sources(true).await?;
        info!(total = sources.len(), "Sources collected");

        // Breakdown by extension and directory before committing to work.
        let mut ext_count: BTreeMap<String, usize> = BTreeMap::new();
        let mut dir_count: BTreeMap<String, usize> = BTreeMap::new();
        let mut url_count = 0usize;
        for source in &sources {
            if source.is_url {
                url_count += 1;
                continue;
            }
            let path = Path::new(&source.source_id);
            let ext = path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_else(|| "[no extension]".to_string());
            let dir = path
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "[root]".to_string());
            *ext_count.entry(ext).or_default() += 1;
            *dir_count.entry(dir).or_default() += 1;
        }
        info!("Sources by extension:");
        for (ext, count) in &ext_count {
            info!("  {}: {}", ext, count);
        }
        info!("Sources by directory:");
        for (dir, count) in &dir_count {
            info!("  {}: {}", dir, count);
        }
        info!("URLs: {}", url_count);

        if !no_prompt && !confirm("Proceed? [y/N]: ") {
            info!("Exited.");
            return Ok(EmbedSummary::default());
        }

        let embedding_api = settings.embedding_current_api()?;
        let client = EmbeddingClient::new(embedding_api, settings.embedding.timeout_ms);
        let chunker = Chunker::new(
            Arc::clone(&self.tokenizer),
            settings.chunking.nof_min_tokens,
            settings.chunking.nof_max_tokens,
            settings.chunking.overlap_percentage,
        );

        let mut summary = EmbedSummary::default();
        for (i, source) in sources.iter().enumerate() {
            if !source.is_url && !Path::new(&source.source_id).exists() {
                info!(source = %source.source_id, "File not found. Skipped.");
                summary.skipped += 1;
                continue;
            }
            if self.store.file_exists_in_metadata(&source.source_id).await? {
                info!(source = %source.source_id, "Duplicate source. Skipped.");
                summary.skipped += 1;
                continue;
            }

            info!(
                "PROCESSING {} ({}/{})",
                source.source_id,
                i + 1,
                sources.len()
            );

            let content = if source.is_url {
                source.content.clone()
            } else {
                match processor.fetch_source(&source.source_id).await {
                    Ok(content) => content,
                    Err(e) => {
                        warn!(source = %source.source_id, error = %e, "Read failed. Skipped.");
                        summary.skipped += 1;
                        continue;
                    }
                }
            };
            if content.is_empty() {
                info!(source = %source.source_id, "Empty source. Skipped.");
                summary.skipped += 1;
                continue;
            }

            let chunks = chunker.chunk_text(&content, &source.source_id, settings.chunking.semantic);
            info!("  Generated {} chunks", chunks.len());

            match self
                .embed_and_store(&settings, &client, &source.source_id, &chunks, true)
                .await
            {
                Ok(tokens) => {
                    summary.files += 1;
                    summary.chunks += chunks.len();
                    summary.tokens += tokens;
                    self.store.persist()?;
                }
                Err(e) => {
                    warn!(source = %source.source_id, error = %e, "Error processing source");
                    summary.skipped += 1;
                }
            }
        }
        self.store.persist()?;
        work.stats_cache = None;

        info!("Completed!");
        info!("  Files processed: {}", summary.files);
        info!("  Files skipped: {}", summary.skipped);
        info!("  Total chunks: {}", summary.chunks);
        info!("  Total tokens: {}", summary.tokens);
        Ok(summary)
    }

    /// Embed `chunks` in config-sized batches, then write them in one
    /// transaction — preceded by the delete of the source's previous chunk
    /// set unless the source is new. Returns the token total.
    async fn embed_and_store(
        &self,
        settings: &Settings,
        client: &EmbeddingClient,
        source_id: &str,
        chunks: &[Chunk],
        is_new: bool,
    ) -> Result<usize> {
        let batch_size = settings.embedding.batch_size.max(1);
        let label_format = &settings.embedding.prepend_label_format;
        let mut vectors = Vec::with_capacity(chunks.len());
        let mut tokens = 0usize;

        let nof_batches = chunks.len().div_ceil(batch_size);
        for (i, batch) in chunks.chunks(batch_size).enumerate() {
            let texts: Vec<String> = batch
                .iter()
                .map(|chunk| {
                    tokens += chunk.token_count;
                    prepend_label(label_format, source_id, &chunk.text)
                })
                .collect();
            info!("GENERATING embeddings for batch {}/{}", i + 1, nof_batches);
            let batch_vectors = client
                .generate(&texts, EncodeKind::Document)
                .await
                .with_context(|| format!("Embedding batch failed for {}", source_id))?;
            vectors.extend(batch_vectors);
        }

        let mut tx = self.store.begin().await?;
        if !is_new {
            tx.delete_documents_by_source(source_id).await?;
        }
        for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
            tx.add_document(chunk, vector).await?;
        }
        tx.commit().await?;
        Ok(tokens)
    }

    /// Incrementally apply source changes. Returns the number of files
    /// processed (deleted + modified + new).
    pub async fn update(&self) -> Result<usize> {
        let mut work = self.work.lock().await;
        info!("Checking for changes...");

        // An empty store means there is nothing to diff against.
        let stats = self.store.get_stats().await?;
        if stats.total_chunks == 0 {
            info!("No index found. Performing full embedding...");
            let summary = self.embed_locked(&mut work, true).await?;
            work.last_update = chrono::Utc::now().timestamp();
            return Ok(summary.files);
        }

        // Best-effort settings re-read so watch mode picks up config edits.
        let config_path = self.settings.read().unwrap().config_path.clone();
        match Settings::load(&config_path) {
            Ok(fresh) => {
                info!(path = %fresh.config_path.display(), "Read settings");
                *self.settings.write().unwrap() = fresh;
            }
            Err(e) => {
                warn!(error = %e, "Unable to re-read settings. Skipped.");
            }
        }

        let settings = self.settings.read().unwrap().clone();
        let processor = SourceProcessor::new(settings.clone());
        let sources = processor.collect_sources(false).await?;
        let current_files: Vec<String> = sources
            .into_iter()
            .filter(|s| !s.is_url)
            .map(|s| s.source_id)
            .collect();

        let update_info = self.detect_changes(&work, &current_files).await?;
        log_update_summary(&update_info);
        if !update_info.needs_update() {
            info!("No updates needed. Database is up to date.");
            work.last_update = chrono::Utc::now().timestamp();
            return Ok(0);
        }

        info!("Applying updates...");
        let embedding_api = settings.embedding_current_api()?;
        let client = EmbeddingClient::new(embedding_api, settings.embedding.timeout_ms);
        let chunker = Chunker::new(
            Arc::clone(&self.tokenizer),
            settings.chunking.nof_min_tokens,
            settings.chunking.nof_max_tokens,
            settings.chunking.overlap_percentage,
        );

        let mut updated = 0usize;

        // Deletions share one transaction.
        if !update_info.deleted_files.is_empty() {
            let mut tx = self.store.begin().await?;
            let mut ok = true;
            for path in &update_info.deleted_files {
                info!(path = %path, "Deleting chunks");
                if let Err(e) = async {
                    tx.delete_documents_by_source(path).await?;
                    tx.remove_file_metadata(path).await
                }
                .await
                {
                    warn!(path = %path, error = %e, "Error during deletions");
                    ok = false;
                    break;
                }
                updated += 1;
            }
            if ok {
                tx.commit().await?;
            } else {
                tx.rollback().await?;
                return Ok(updated);
            }
        }

        for path in &update_info.modified_files {
            info!(path = %path, "Updating");
            match self
                .reingest_file(&settings, &processor, &client, &chunker, path, false)
                .await
            {
                Ok(Some(chunks)) => {
                    updated += 1;
                    work.failure_counts.remove(path);
                    info!("  Updated with {} chunks", chunks);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path, error = %e, "Error");
                    record_failure(&mut work, path);
                }
            }
        }

        for path in &update_info.new_files {
            info!(path = %path, "Adding new file");
            match self
                .reingest_file(&settings, &processor, &client, &chunker, path, true)
                .await
            {
                Ok(Some(chunks)) => {
                    updated += 1;
                    work.failure_counts.remove(path);
                    info!("  Added with {} chunks", chunks);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path, error = %e, "Error");
                    record_failure(&mut work, path);
                }
            }
        }

        if updated > 0 {
            self.store.persist()?;
        }
        info!("Update completed! {} file(s) processed.", updated);
        work.stats_cache = None;
        work.last_update = chrono::Utc::now().timestamp();
        Ok(updated)
    }

    /// Re-chunk and re-embed one file. `Ok(None)` means skipped (empty
    /// file); errors count against the quarantine counter in the caller.
    async fn reingest_file(
        &self,
        settings: &Settings,
        processor: &SourceProcessor,
        client: &EmbeddingClient,
        chunker: &Chunker,
        path: &str,
        is_new: bool,
    ) -> Result<Option<usize>> {
        let mut content = String::new();
        processor.read_file(path, &mut content)?;
        if content.is_empty() {
            info!(path = %path, "Empty file. Skipped.");
            return Ok(None);
        }
        let chunks = chunker.chunk_text(&content, path, settings.chunking.semantic);
        self.embed_and_store(settings, client, path, &chunks, is_new)
            .await?;
        Ok(Some(chunks.len()))
    }

    async fn detect_changes(
        &self,
        work: &WorkState,
        current_files: &[String],
    ) -> Result<UpdateInfo> {
        let mut tracked: HashMap<String, crate::models::FileMetadata> = self
            .store
            .get_tracked_files()
            .await?
            .into_iter()
            .map(|m| (m.path.clone(), m))
            .collect();

        let mut info = UpdateInfo::default();
        for path in current_files {
            if work.ignored_files.contains(path) {
                info!(path = %path, "Skipping ignored file");
                continue;
            }
            let Ok(metadata) = std::fs::metadata(path) else {
                continue;
            };
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);

            match tracked.remove(path) {
                None => info.new_files.push(path.clone()),
                Some(meta) => {
                    if meta.last_modified != mtime || meta.file_size != metadata.len() {
                        info.modified_files.push(path.clone());
                    } else {
                        info.unchanged_files.push(path.clone());
                    }
                }
            }
        }
        // Whatever remains tracked is gone from the configured sources.
        info.deleted_files = tracked.into_keys().collect();
        info.deleted_files.sort();
        Ok(info)
    }

    /// Rebuild the ANN index without tombstones and persist it.
    pub async fn compact(&self) -> Result<()> {
        info!("Compacting vector index...");
        self.store.compact();
        self.store.persist()?;
        info!("Done!");
        Ok(())
    }

    /// Corpus statistics as JSON, cached until the next successful update.
    pub async fn source_stats(&self) -> Result<serde_json::Value> {
        let mut work = self.work.lock().await;
        if let Some(cached) = &work.stats_cache {
            return Ok(cached.clone());
        }
        let stats = self.compute_source_stats().await?;
        work.stats_cache = Some(stats.clone());
        Ok(stats)
    }

    async fn compute_source_stats(&self) -> Result<serde_json::Value> {
        let tracked = self.store.get_tracked_files().await?;
        let chunk_counts = self.store.get_chunk_counts_by_source().await?;

        let mut by_language: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_directory: BTreeMap<String, usize> = BTreeMap::new();
        let mut total_lines = 0u64;
        let mut total_size = 0u64;
        let mut files = Vec::new();

        for file in &tracked {
            if !Path::new(&file.path).exists() {
                continue;
            }
            let language = detect_language(&file.path);
            let directory = Path::new(&file.path)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            *by_language.entry(language.to_string()).or_default() += 1;
            *by_directory.entry(directory).or_default() += 1;
            total_lines += file.nof_lines;
            total_size += file.file_size;

            files.push(serde_json::json!({
                "path": file.path,
                "lines": file.nof_lines,
                "size_bytes": file.file_size,
                "language": language,
                "chunks": chunk_counts.get(&file.path).copied().unwrap_or(0),
                "last_modified": file.last_modified,
            }));
        }

        files.sort_by(|a, b| {
            b["chunks"]
                .as_i64()
                .unwrap_or(0)
                .cmp(&a["chunks"].as_i64().unwrap_or(0))
        });
        files.truncate(10);

        Ok(serde_json::json!({
            "total_files": tracked.len(),
            "total_lines": total_lines,
            "total_size_bytes": total_size,
            "by_language": by_language,
            "by_directory": by_directory,
            "top_files": files,
        }))
    }

    /// Whether a path is currently quarantined.
    pub async fn is_ignored(&self, path: &str) -> bool {
        self.work.lock().await.ignored_files.contains(path)
    }
}

fn record_failure(work: &mut WorkState, path: &str) {
    let count = work.failure_counts.entry(path.to_string()).or_insert(0);
    *count += 1;
    if *count >= MAX_FAILURES {
        work.ignored_files.insert(path.to_string());
        warn!(path = %path, "Added to ignore list after {} failures", MAX_FAILURES);
    }
}

fn log_update_summary(info: &UpdateInfo) {
    info!("=== Update Summary ===");
    info!("New files: {}", info.new_files.len());
    info!("Modified files: {}", info.modified_files.len());
    info!("Deleted files: {}", info.deleted_files.len());
    info!("Unchanged files: {}", info.unchanged_files.len());
    for file in &info.new_files {
        info!("  + {}", file);
    }
    for file in &info.modified_files {
        info!("  * {}", file);
    }
    for file in &info.deleted_files {
        info!("  - {}", file);
    }
}

fn prepend_label(label_format: &str, source_id: &str, text: &str) -> String {
    if label_format.is_empty() {
        return text.to_string();
    }
    let filename = Path::new(source_id)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| source_id.to_string());
    format!("{}\n\n{}", format_placeholder(label_format, &filename), text)
}

fn confirm(prompt: &str) -> bool {
    use std::io::Write;
    print!("{}", prompt);
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y")
}

fn detect_language(path: &str) -> &'static str {
    match Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .as_deref()
    {
        Some("cpp" | "hpp" | "h" | "cc" | "cxx") => "C++",
        Some("c") => "C",
        Some("py") => "Python",
        Some("js" | "jsx") => "JavaScript",
        Some("ts" | "tsx") => "TypeScript",
        Some("java") => "Java",
        Some("go") => "Go",
        Some("rs") => "Rust",
        Some("md") => "Markdown",
        Some("txt") => "Text",
        _ => "Other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepend_label_formats_filename() {
        assert_eq!(
            prepend_label("File: {}", "src/main.rs", "body"),
            "File: main.rs\n\nbody"
        );
        assert_eq!(prepend_label("", "src/main.rs", "body"), "body");
    }

    #[test]
    fn language_detection() {
        assert_eq!(detect_language("a/b.rs"), "Rust");
        assert_eq!(detect_language("a/b.hpp"), "C++");
        assert_eq!(detect_language("a/b.weird"), "Other");
    }
}
