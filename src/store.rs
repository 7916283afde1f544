//! Hybrid vector store: relational chunk metadata + ANN index.
//!
//! Two tightly coupled substores behind one facade:
//!
//! - **Relational** (SQLite via sqlx, WAL): tables `chunks` and
//!   `files_metadata`, the authoritative record of what is indexed.
//! - **ANN** ([`AnnIndex`]): embedding vectors labelled by chunk id,
//!   guarded by a single mutex.
//!
//! # Transactions
//!
//! [`VectorStore::begin`] returns a [`StoreTransaction`] that wraps a SQL
//! transaction and *stages* ANN mutations: vector inserts and tombstones
//! are buffered and applied to the index only after the SQL commit
//! succeeds. A rollback (explicit or by drop) therefore never leaks index
//! mutations, and readers observe either the complete old chunk set of a
//! source or the complete new one.
//!
//! # Invariants
//!
//! - `add_document` rejects vectors whose length differs from the
//!   configured dimension.
//! - Every live ANN label corresponds to a `chunks.id` row; labels whose
//!   row is gone are skipped at search time and reclaimed by `compact`.
//! - `clear` leaves both substores empty.

use anyhow::{bail, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::index::{AnnIndex, DistanceMetric};
use crate::models::{Chunk, FileMetadata, SearchResult};

/// Aggregate store statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub total_chunks: i64,
    pub vector_count: usize,
    pub deleted_count: usize,
    pub active_count: usize,
    /// Per-source chunk counts, ordered by source id.
    pub sources: Vec<(String, i64)>,
}

pub struct VectorStore {
    pool: SqlitePool,
    index: Mutex<AnnIndex>,
    index_path: PathBuf,
    vector_dim: usize,
    max_elements: usize,
    metric: DistanceMetric,
}

impl VectorStore {
    /// Open (creating if missing) the SQLite database and the ANN index.
    pub async fn open(
        sqlite_path: &str,
        index_path: &str,
        vector_dim: usize,
        max_elements: usize,
        metric: DistanceMetric,
    ) -> Result<Self> {
        info!(path = sqlite_path, "Initializing database");
        if let Some(parent) = Path::new(sqlite_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let in_memory = sqlite_path == ":memory:";
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", sqlite_path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            // A :memory: database exists per connection, so it must not be
            // spread over a pool.
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content TEXT NOT NULL,
                source_id TEXT NOT NULL,
                start_pos INTEGER NOT NULL,
                end_pos INTEGER NOT NULL,
                token_count INTEGER NOT NULL,
                unit TEXT NOT NULL,
                type TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files_metadata (
                path TEXT PRIMARY KEY,
                last_modified INTEGER NOT NULL,
                file_size INTEGER NOT NULL,
                nof_lines INTEGER NOT NULL,
                indexed_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let index = AnnIndex::open(Path::new(index_path), vector_dim, max_elements, metric);

        Ok(Self {
            pool,
            index: Mutex::new(index),
            index_path: PathBuf::from(index_path),
            vector_dim,
            max_elements,
            metric,
        })
    }

    pub fn vector_dim(&self) -> usize {
        self.vector_dim
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Begin a transaction. ANN mutations made through the returned guard
    /// are staged and only applied on a successful [`StoreTransaction::commit`].
    pub async fn begin(&self) -> Result<StoreTransaction<'_>> {
        let tx = self.pool.begin().await.context("storage failure")?;
        Ok(StoreTransaction {
            store: self,
            tx,
            staged_inserts: Vec::new(),
            staged_deletes: Vec::new(),
        })
    }

    /// Insert a single chunk + vector in its own transaction. Returns the
    /// assigned chunk id.
    pub async fn add_document(&self, chunk: &Chunk, vector: &[f32]) -> Result<i64> {
        let mut tx = self.begin().await?;
        let id = tx.add_document(chunk, vector).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Insert a batch pairwise. Sizes must match.
    pub async fn add_documents(&self, chunks: &[Chunk], vectors: &[Vec<f32>]) -> Result<Vec<i64>> {
        if chunks.len() != vectors.len() {
            bail!("Chunks and embeddings count mismatch");
        }
        let mut tx = self.begin().await?;
        let mut ids = Vec::with_capacity(chunks.len());
        for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
            ids.push(tx.add_document(chunk, vector).await?);
        }
        tx.commit().await?;
        Ok(ids)
    }

    /// Top-k similarity search. Results are sorted by descending
    /// similarity; labels whose relational row is gone are skipped.
    pub async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<SearchResult>> {
        if query.len() != self.vector_dim {
            bail!(
                "Query embedding dimension mismatch: actual {}, expected {}",
                query.len(),
                self.vector_dim
            );
        }
        let hits = self.index.lock().unwrap().search_knn(query, top_k);

        let mut results = Vec::with_capacity(hits.len());
        for (label, distance) in hits {
            match self.get_chunk_data(label).await? {
                Some(mut result) => {
                    result.similarity_score = self.metric.similarity(distance);
                    result.chunk_id = Some(label);
                    result.distance = Some(distance);
                    results.push(result);
                }
                None => debug!(label, "ANN hit without metadata row, skipped"),
            }
        }
        // Stable: ties keep nearest-first traversal order.
        results.sort_by(|a, b| {
            b.similarity_score
                .partial_cmp(&a.similarity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(results)
    }

    /// Search with post-hoc filtering: oversample `2·top_k`, keep results
    /// whose source contains `source_filter` and whose type equals
    /// `type_filter` (empty filters match everything), truncate to `top_k`.
    pub async fn search_with_filter(
        &self,
        query: &[f32],
        source_filter: &str,
        type_filter: &str,
        top_k: usize,
    ) -> Result<Vec<SearchResult>> {
        let results = self.search(query, top_k * 2).await?;
        Ok(results
            .into_iter()
            .filter(|r| source_filter.is_empty() || r.source_id.contains(source_filter))
            .filter(|r| type_filter.is_empty() || r.chunk_type == type_filter)
            .take(top_k)
            .collect())
    }

    /// Chunk ids of a source, ascending.
    pub async fn get_chunk_ids_by_source(&self, source_id: &str) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT id FROM chunks WHERE source_id = ? ORDER BY id")
            .bind(source_id)
            .fetch_all(&self.pool)
            .await
            .context("storage failure")?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("id")).collect())
    }

    /// Load a chunk's payload, or `None` when the id is unknown.
    pub async fn get_chunk_data(&self, chunk_id: i64) -> Result<Option<SearchResult>> {
        let row = sqlx::query(
            "SELECT content, source_id, unit, type, start_pos, end_pos FROM chunks WHERE id = ?",
        )
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await
        .context("storage failure")?;

        Ok(row.map(|row| SearchResult {
            content: row.get("content"),
            source_id: row.get("source_id"),
            chunk_unit: row.get("unit"),
            chunk_type: row.get("type"),
            similarity_score: 0.0,
            start_pos: row.get::<i64, _>("start_pos") as usize,
            end_pos: row.get::<i64, _>("end_pos") as usize,
            chunk_id: Some(chunk_id),
            distance: None,
        }))
    }

    /// Raw embedding vector for a chunk id, when still present in the index.
    pub fn get_embedding_vector(&self, chunk_id: i64) -> Option<Vec<f32>> {
        self.index.lock().unwrap().get_vector(chunk_id).cloned()
    }

    pub async fn file_exists_in_metadata(&self, path: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM files_metadata WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .context("storage failure")?;
        Ok(row.is_some())
    }

    pub async fn get_tracked_files(&self) -> Result<Vec<FileMetadata>> {
        let rows = sqlx::query(
            "SELECT path, last_modified, file_size, nof_lines FROM files_metadata ORDER BY path",
        )
        .fetch_all(&self.pool)
        .await
        .context("storage failure")?;
        Ok(rows
            .iter()
            .map(|row| FileMetadata {
                path: row.get("path"),
                last_modified: row.get("last_modified"),
                file_size: row.get::<i64, _>("file_size") as u64,
                nof_lines: row.get::<i64, _>("nof_lines") as u64,
            })
            .collect())
    }

    pub async fn upsert_file_metadata(
        &self,
        path: &str,
        mtime: i64,
        size: u64,
        lines: u64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO files_metadata (path, last_modified, file_size, nof_lines) VALUES (?, ?, ?, ?)",
        )
        .bind(path)
        .bind(mtime)
        .bind(size as i64)
        .bind(lines as i64)
        .execute(&self.pool)
        .await
        .context("storage failure")?;
        Ok(())
    }

    pub async fn get_chunk_counts_by_source(&self) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query("SELECT source_id, COUNT(*) AS n FROM chunks GROUP BY source_id")
            .fetch_all(&self.pool)
            .await
            .context("storage failure")?;
        Ok(rows
            .iter()
            .map(|row| (row.get("source_id"), row.get::<i64, _>("n")))
            .collect())
    }

    /// Truncate both substores and start a fresh ANN index.
    pub async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.context("storage failure")?;
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM files_metadata")
            .execute(&mut *tx)
            .await?;
        tx.commit().await.context("storage failure")?;

        *self.index.lock().unwrap() =
            AnnIndex::new(self.vector_dim, self.max_elements, self.metric);
        Ok(())
    }

    /// Flush the ANN index to disk, iff it holds at least one live vector.
    pub fn persist(&self) -> Result<()> {
        let index = self.index.lock().unwrap();
        if index.live_count() == 0 {
            info!("Saving with no vectors in the index db. Skipped.");
            return Ok(());
        }
        index.save(&self.index_path)
    }

    /// Reclaim tombstoned vectors by rebuilding the index.
    pub fn compact(&self) -> usize {
        let reclaimed = self.index.lock().unwrap().compact();
        if reclaimed > 0 {
            info!(reclaimed, "Compacted vector index");
        }
        reclaimed
    }

    pub async fn get_stats(&self) -> Result<StoreStats> {
        let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await
            .context("storage failure")?;
        let rows = sqlx::query(
            "SELECT source_id, COUNT(*) AS n FROM chunks GROUP BY source_id ORDER BY source_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("storage failure")?;
        let sources = rows
            .iter()
            .map(|row| (row.get("source_id"), row.get::<i64, _>("n")))
            .collect();

        let (vector_count, deleted_count) = {
            let index = self.index.lock().unwrap();
            (index.count(), index.deleted_count())
        };
        Ok(StoreStats {
            total_chunks,
            vector_count,
            deleted_count,
            active_count: vector_count - deleted_count,
            sources,
        })
    }

    fn apply_staged(&self, inserts: Vec<(i64, Vec<f32>)>, deletes: Vec<i64>) {
        let mut index = self.index.lock().unwrap();
        for label in deletes {
            if !index.mark_deleted(label) {
                debug!(label, "Label already deleted or unknown");
            }
        }
        for (label, vector) in inserts {
            if let Err(e) = index.insert(&vector, label) {
                // Dimension was validated at staging time; this is a
                // capacity or internal index error.
                warn!(label, error = %e, "Failed to apply staged vector");
            }
        }
    }
}

/// A store transaction: SQL mutations run inside a SQLite transaction,
/// ANN mutations are staged until [`commit`](Self::commit).
///
/// Dropping the guard without committing rolls back the SQL side and
/// discards the staged index mutations.
pub struct StoreTransaction<'a> {
    store: &'a VectorStore,
    tx: sqlx::Transaction<'static, sqlx::Sqlite>,
    staged_inserts: Vec<(i64, Vec<f32>)>,
    staged_deletes: Vec<i64>,
}

impl<'a> StoreTransaction<'a> {
    /// Insert chunk metadata, upsert the owning file's metadata, and stage
    /// the vector for index insertion. Returns the assigned chunk id.
    pub async fn add_document(&mut self, chunk: &Chunk, vector: &[f32]) -> Result<i64> {
        if vector.len() != self.store.vector_dim {
            bail!(
                "Embedding dimension mismatch: actual {}, expected {}",
                vector.len(),
                self.store.vector_dim
            );
        }

        let result = sqlx::query(
            r#"
            INSERT INTO chunks (content, source_id, start_pos, end_pos, token_count, unit, type)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.text)
        .bind(&chunk.source_id)
        .bind(chunk.start as i64)
        .bind(chunk.end as i64)
        .bind(chunk.token_count as i64)
        .bind(&chunk.unit)
        .bind(&chunk.kind)
        .execute(&mut *self.tx)
        .await
        .context("storage failure")?;
        let chunk_id = result.last_insert_rowid();

        if let Err(e) = self.upsert_source_file_metadata(&chunk.source_id).await {
            debug!(source = %chunk.source_id, error = %e, "No file metadata for source");
        }

        self.staged_inserts.push((chunk_id, vector.to_vec()));
        Ok(chunk_id)
    }

    async fn upsert_source_file_metadata(&mut self, source_id: &str) -> Result<()> {
        let metadata = std::fs::metadata(source_id)?;
        let mtime = metadata
            .modified()?
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let lines = count_lines(source_id);
        sqlx::query(
            "INSERT OR REPLACE INTO files_metadata (path, last_modified, file_size, nof_lines) VALUES (?, ?, ?, ?)",
        )
        .bind(source_id)
        .bind(mtime)
        .bind(metadata.len() as i64)
        .bind(lines as i64)
        .execute(&mut *self.tx)
        .await
        .context("storage failure")?;
        Ok(())
    }

    /// Delete all chunks of a source and stage their index tombstones.
    /// Returns the number of rows removed. The caller removes the file
    /// metadata row in the same transaction.
    pub async fn delete_documents_by_source(&mut self, source_id: &str) -> Result<u64> {
        let rows = sqlx::query("SELECT id FROM chunks WHERE source_id = ? ORDER BY id")
            .bind(source_id)
            .fetch_all(&mut *self.tx)
            .await
            .context("storage failure")?;
        if rows.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = rows.iter().map(|r| r.get::<i64, _>("id")).collect();

        let result = sqlx::query("DELETE FROM chunks WHERE source_id = ?")
            .bind(source_id)
            .execute(&mut *self.tx)
            .await
            .context("storage failure")?;

        self.staged_deletes.extend(ids);
        Ok(result.rows_affected())
    }

    pub async fn remove_file_metadata(&mut self, path: &str) -> Result<()> {
        sqlx::query("DELETE FROM files_metadata WHERE path = ?")
            .bind(path)
            .execute(&mut *self.tx)
            .await
            .context("storage failure")?;
        Ok(())
    }

    /// Commit the SQL transaction, then apply the staged index mutations.
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await.context("storage failure")?;
        self.store
            .apply_staged(self.staged_inserts, self.staged_deletes);
        Ok(())
    }

    /// Roll back: no SQL change persists and no index mutation is applied.
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.context("storage failure")?;
        Ok(())
    }
}

fn count_lines(path: &str) -> u64 {
    std::fs::read(path)
        .map(|bytes| bytes.iter().filter(|b| **b == b'\n').count() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(source: &str, text: &str) -> Chunk {
        Chunk {
            text: text.to_string(),
            source_id: source.to_string(),
            start: 0,
            end: text.len(),
            token_count: 3,
            unit: "char".to_string(),
            kind: "text".to_string(),
        }
    }

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    async fn memory_store() -> VectorStore {
        VectorStore::open(":memory:", "/tmp/embedder-test-index-unused", 4, 1000, DistanceMetric::Cosine)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn empty_store_search_is_empty() {
        let store = memory_store().await;
        let results = store.search(&unit(4, 0), 5).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn add_and_search_roundtrip() {
        let store = memory_store().await;
        let id_a = store
            .add_document(&chunk("a.txt", "hello world"), &unit(4, 0))
            .await
            .unwrap();
        let id_b = store
            .add_document(&chunk("b.txt", "goodbye world"), &unit(4, 1))
            .await
            .unwrap();
        assert!(id_b > id_a);

        let results = store.search(&unit(4, 0), 1).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source_id, "a.txt");
        assert!(results[0].similarity_score >= 0.999);
        assert_eq!(results[0].chunk_id, Some(id_a));
    }

    #[tokio::test]
    async fn dimension_invariant() {
        let store = memory_store().await;
        let err = store
            .add_document(&chunk("a.txt", "x"), &[1.0, 0.0])
            .await;
        assert!(err.is_err());
        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.total_chunks, 0, "failed insert must not persist");
    }

    #[tokio::test]
    async fn rollback_leaves_no_trace() {
        let store = memory_store().await;
        let mut tx = store.begin().await.unwrap();
        tx.add_document(&chunk("a.txt", "text"), &unit(4, 0))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.total_chunks, 0);
        assert_eq!(stats.vector_count, 0, "staged vectors must not be applied");
    }

    #[tokio::test]
    async fn delete_by_source_tombstones_index() {
        let store = memory_store().await;
        store
            .add_document(&chunk("a.txt", "one"), &unit(4, 0))
            .await
            .unwrap();
        store
            .add_document(&chunk("a.txt", "two"), &unit(4, 1))
            .await
            .unwrap();
        store
            .add_document(&chunk("b.txt", "three"), &unit(4, 2))
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        let removed = tx.delete_documents_by_source("a.txt").await.unwrap();
        tx.remove_file_metadata("a.txt").await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(removed, 2);

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(stats.deleted_count, 2);
        assert_eq!(stats.active_count, 1);

        let results = store.search(&unit(4, 0), 5).await.unwrap();
        assert!(results.iter().all(|r| r.source_id == "b.txt"));
    }

    #[tokio::test]
    async fn clear_purges_all() {
        let store = memory_store().await;
        store
            .add_document(&chunk("a.txt", "one"), &unit(4, 0))
            .await
            .unwrap();
        store.clear().await.unwrap();

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.total_chunks, 0);
        assert_eq!(stats.vector_count, 0);
        assert_eq!(stats.deleted_count, 0);
        assert!(store.get_tracked_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_with_filter_applies_both_filters() {
        let store = memory_store().await;
        let mut code = chunk("src/a.rs", "fn a() {}");
        code.kind = "code".to_string();
        store.add_document(&code, &unit(4, 0)).await.unwrap();
        store
            .add_document(&chunk("docs/a.md", "prose"), &unit(4, 1))
            .await
            .unwrap();

        let results = store
            .search_with_filter(&unit(4, 0), "src/", "code", 5)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source_id, "src/a.rs");
    }

    #[tokio::test]
    async fn chunk_ids_by_source_ascend() {
        let store = memory_store().await;
        for i in 0..3 {
            store
                .add_document(&chunk("a.txt", &format!("c{}", i)), &unit(4, i % 4))
                .await
                .unwrap();
        }
        let ids = store.get_chunk_ids_by_source("a.txt").await.unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn get_embedding_vector_roundtrip() {
        let store = memory_store().await;
        let v = unit(4, 2);
        let id = store
            .add_document(&chunk("a.txt", "x"), &v)
            .await
            .unwrap();
        assert_eq!(store.get_embedding_vector(id), Some(v));
        assert_eq!(store.get_embedding_vector(id + 100), None);
    }
}
