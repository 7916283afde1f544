//! Approximate-nearest-neighbor index over embedding vectors.
//!
//! Wraps an HNSW graph with the bookkeeping the hybrid store needs:
//! mark-and-sweep deletion, a label → vector cache (hora returns neighbor
//! ids, distances are recomputed from the cache), and whole-index
//! persistence to a single file. Labels are chunk ids from the relational
//! side.
//!
//! Mutations set a dirty flag; the graph is rebuilt lazily before the next
//! search. A persisted file that fails to load is logged and replaced by a
//! fresh empty index.

use anyhow::{bail, Context, Result};
use hora::core::ann_index::ANNIndex;
use hora::core::metrics::Metric;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{info, warn};

/// Distance metric for the vector space. Cosine assumes provider-normalized
/// vectors and works over the inner product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    Cosine,
    L2,
}

impl DistanceMetric {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "cosine" => Ok(Self::Cosine),
            "l2" => Ok(Self::L2),
            other => bail!("Unknown distance metric: {}", other),
        }
    }

    /// Map a raw distance to a similarity score in `[0, 1]`.
    pub fn similarity(self, distance: f32) -> f32 {
        match self {
            Self::Cosine => 1.0 - distance,
            Self::L2 => 1.0 / (1.0 + distance),
        }
    }
}

/// On-disk image of the index: vectors and tombstones. The HNSW graph
/// itself is rebuilt on load.
#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    dim: usize,
    metric: DistanceMetric,
    vectors: Vec<(i64, Vec<f32>)>,
    deleted: Vec<i64>,
}

pub struct AnnIndex {
    dim: usize,
    max_elements: usize,
    metric: DistanceMetric,
    graph: HNSWIndex<f32, i64>,
    vectors: HashMap<i64, Vec<f32>>,
    deleted: HashSet<i64>,
    /// Labels added since the last graph build.
    dirty: bool,
}

fn new_graph(dim: usize) -> HNSWIndex<f32, i64> {
    let params = HNSWParams {
        n_neighbor: 16,
        ef_build: 200,
        ef_search: 50,
        ..Default::default()
    };
    HNSWIndex::new(dim, &params)
}

impl AnnIndex {
    pub fn new(dim: usize, max_elements: usize, metric: DistanceMetric) -> Self {
        Self {
            dim,
            max_elements: max_elements.max(1),
            metric,
            graph: new_graph(dim),
            vectors: HashMap::new(),
            deleted: HashSet::new(),
            dirty: false,
        }
    }

    /// Load the index from `path`, or start fresh when the file is missing,
    /// unreadable, or was written for a different dimension/metric.
    pub fn open(path: &Path, dim: usize, max_elements: usize, metric: DistanceMetric) -> Self {
        if path.exists() {
            match Self::load(path, dim, max_elements, metric) {
                Ok(index) => {
                    info!(
                        vectors = index.count(),
                        deleted = index.deleted_count(),
                        "Loaded vector index"
                    );
                    return index;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to load existing index");
                    info!("Creating new index...");
                }
            }
        }
        Self::new(dim, max_elements, metric)
    }

    fn load(path: &Path, dim: usize, max_elements: usize, metric: DistanceMetric) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let persisted: PersistedIndex =
            bincode::deserialize(&bytes).context("Index file is corrupt")?;
        if persisted.dim != dim {
            bail!(
                "Index dimension mismatch: file has {}, configured {}",
                persisted.dim,
                dim
            );
        }
        if persisted.metric != metric {
            bail!("Index metric mismatch");
        }

        let mut index = Self::new(dim, max_elements, metric);
        index.deleted = persisted.deleted.into_iter().collect();
        for (label, vector) in persisted.vectors {
            if !index.deleted.contains(&label) {
                let _ = index.graph.add(&vector, label);
                index.dirty = true;
            }
            index.vectors.insert(label, vector);
        }
        index.ensure_built();
        Ok(index)
    }

    /// Persist vectors and tombstones to a single file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let persisted = PersistedIndex {
            dim: self.dim,
            metric: self.metric,
            vectors: self
                .vectors
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            deleted: self.deleted.iter().copied().collect(),
        };
        let bytes = bincode::serialize(&persisted)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)
            .with_context(|| format!("Failed to write index file: {}", path.display()))
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// All labels ever inserted and not yet compacted away (live + deleted).
    pub fn count(&self) -> usize {
        self.vectors.len()
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }

    pub fn live_count(&self) -> usize {
        self.count() - self.deleted_count()
    }

    /// Insert a vector under `label`. The label must carry the configured
    /// dimension.
    pub fn insert(&mut self, vector: &[f32], label: i64) -> Result<()> {
        if vector.len() != self.dim {
            bail!(
                "Embedding dimension mismatch: actual {}, expected {}",
                vector.len(),
                self.dim
            );
        }
        if !self.vectors.contains_key(&label) && self.count() >= self.max_elements {
            bail!("Index is full: max_elements = {}", self.max_elements);
        }
        self.graph
            .add(vector, label)
            .map_err(|e| anyhow::anyhow!("Index insertion failed: {}", e))?;
        self.vectors.insert(label, vector.to_vec());
        self.deleted.remove(&label);
        self.dirty = true;
        Ok(())
    }

    /// Tombstone a label. Unknown or already-deleted labels are tolerated.
    pub fn mark_deleted(&mut self, label: i64) -> bool {
        if !self.vectors.contains_key(&label) {
            return false;
        }
        self.deleted.insert(label)
    }

    pub fn get_vector(&self, label: i64) -> Option<&Vec<f32>> {
        self.vectors.get(&label)
    }

    /// Top-`k` live neighbors of `query` as `(label, raw distance)` pairs,
    /// nearest first.
    pub fn search_knn(&mut self, query: &[f32], k: usize) -> Vec<(i64, f32)> {
        if self.live_count() == 0 || k == 0 {
            return Vec::new();
        }
        self.ensure_built();

        // Oversample by the tombstone count so deletions can't starve the
        // result set.
        let want = (k + self.deleted.len()).min(self.count());
        let mut hits: Vec<(i64, f32)> = self
            .graph
            .search(query, want)
            .into_iter()
            .filter(|label| !self.deleted.contains(label))
            .filter_map(|label| {
                self.vectors
                    .get(&label)
                    .map(|v| (label, self.distance(query, v)))
            })
            .collect();
        hits.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        hits
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self.metric {
            DistanceMetric::Cosine => {
                let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
                1.0 - dot
            }
            DistanceMetric::L2 => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y) * (x - y))
                .sum(),
        }
    }

    /// Rebuild without tombstoned labels. Returns the number of reclaimed
    /// vectors.
    pub fn compact(&mut self) -> usize {
        let reclaimed = self.deleted.len();
        if reclaimed == 0 {
            return 0;
        }
        let deleted = std::mem::take(&mut self.deleted);
        self.vectors.retain(|label, _| !deleted.contains(label));
        self.rebuild();
        reclaimed
    }

    fn rebuild(&mut self) {
        let mut graph = new_graph(self.dim);
        for (label, vector) in &self.vectors {
            if !self.deleted.contains(label) {
                let _ = graph.add(vector, *label);
            }
        }
        self.graph = graph;
        self.dirty = true;
        self.ensure_built();
    }

    fn ensure_built(&mut self) {
        if !self.dirty {
            return;
        }
        let metric = match self.metric {
            DistanceMetric::Cosine => Metric::CosineSimilarity,
            DistanceMetric::L2 => Metric::Euclidean,
        };
        if let Err(e) = self.graph.build(metric) {
            warn!(error = e, "Failed to build ANN graph");
        }
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn insert_and_search_cosine() {
        let mut index = AnnIndex::new(4, 100, DistanceMetric::Cosine);
        index.insert(&unit(4, 0), 1).unwrap();
        index.insert(&unit(4, 1), 2).unwrap();
        index.insert(&unit(4, 2), 3).unwrap();

        let hits = index.search_knn(&unit(4, 1), 1);
        assert_eq!(hits[0].0, 2);
        assert!(hits[0].1.abs() < 1e-5, "identical vector should be distance 0");
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let mut index = AnnIndex::new(4, 100, DistanceMetric::Cosine);
        assert!(index.insert(&[1.0, 0.0], 1).is_err());
    }

    #[test]
    fn empty_index_searches_empty() {
        let mut index = AnnIndex::new(4, 100, DistanceMetric::Cosine);
        assert!(index.search_knn(&unit(4, 0), 5).is_empty());
    }

    #[test]
    fn deleted_labels_are_filtered() {
        let mut index = AnnIndex::new(4, 100, DistanceMetric::Cosine);
        index.insert(&unit(4, 0), 1).unwrap();
        index.insert(&unit(4, 1), 2).unwrap();

        assert!(index.mark_deleted(1));
        assert!(!index.mark_deleted(1), "second delete is tolerated");
        assert!(!index.mark_deleted(999), "unknown label is tolerated");

        let hits = index.search_knn(&unit(4, 0), 5);
        assert!(hits.iter().all(|(label, _)| *label != 1));
        assert_eq!(index.count(), 2);
        assert_eq!(index.deleted_count(), 1);
        assert_eq!(index.live_count(), 1);
    }

    #[test]
    fn compact_reclaims_tombstones() {
        let mut index = AnnIndex::new(4, 100, DistanceMetric::Cosine);
        index.insert(&unit(4, 0), 1).unwrap();
        index.insert(&unit(4, 1), 2).unwrap();
        index.mark_deleted(2);

        assert_eq!(index.compact(), 1);
        assert_eq!(index.count(), 1);
        assert_eq!(index.deleted_count(), 0);
        let hits = index.search_knn(&unit(4, 0), 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 1);
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index");

        let mut index = AnnIndex::new(4, 100, DistanceMetric::Cosine);
        index.insert(&unit(4, 0), 10).unwrap();
        index.insert(&unit(4, 1), 11).unwrap();
        index.mark_deleted(11);
        index.save(&path).unwrap();

        let mut reloaded = AnnIndex::open(&path, 4, 100, DistanceMetric::Cosine);
        assert_eq!(reloaded.count(), 2);
        assert_eq!(reloaded.deleted_count(), 1);
        let hits = reloaded.search_knn(&unit(4, 0), 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 10);
    }

    #[test]
    fn corrupt_file_falls_back_to_fresh() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index");
        std::fs::write(&path, b"not an index").unwrap();

        let index = AnnIndex::open(&path, 4, 100, DistanceMetric::Cosine);
        assert_eq!(index.count(), 0);
        assert_eq!(index.deleted_count(), 0);
    }

    #[test]
    fn l2_similarity_mapping() {
        assert!((DistanceMetric::L2.similarity(0.0) - 1.0).abs() < 1e-6);
        assert!((DistanceMetric::L2.similarity(1.0) - 0.5).abs() < 1e-6);
        assert!((DistanceMetric::Cosine.similarity(0.0) - 1.0).abs() < 1e-6);
    }
}
