use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use hnsw_rs::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

const INDEX_FILE: &str = "index.json";

const MAX_NB_CONNECTION: usize = 16;
const MAX_LAYER: usize = 16;
const EF_CONSTRUCTION: usize = 200;
const EF_SEARCH: usize = 64;

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorEntry {
    pub chunk_id: String,
    pub vector: Vec<f32>,
}

/// On-disk form of the index. The HNSW graph is rebuilt from it on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredVectors {
    embedding_model: String,
    dimension: usize,
    entries: Vec<VectorEntry>,
}

/// HNSW cosine index over chunk embeddings.
pub struct VectorIndex {
    stored: StoredVectors,
    graph: Hnsw<'static, f32, DistCosine>,
}

impl VectorIndex {
    pub fn build(embedding_model: impl Into<String>, entries: Vec<VectorEntry>) -> Result<Self> {
        let dimension = entries.first().map(|e| e.vector.len()).unwrap_or(0);
        anyhow::ensure!(dimension > 0, "cannot build a vector index from empty vectors");

        Self::from_stored(StoredVectors {
            embedding_model: embedding_model.into(),
            dimension,
            entries,
        })
    }

    fn from_stored(stored: StoredVectors) -> Result<Self> {
        for entry in &stored.entries {
            anyhow::ensure!(
                entry.vector.len() == stored.dimension,
                "chunk {} has {} dimensions, expected {}",
                entry.chunk_id,
                entry.vector.len(),
                stored.dimension
            );
        }

        let graph = Hnsw::new(
            MAX_NB_CONNECTION,
            stored.entries.len().max(1),
            MAX_LAYER,
            EF_CONSTRUCTION,
            DistCosine,
        );
        for (idx, entry) in stored.entries.iter().enumerate() {
            graph.insert((&entry.vector[..], idx));
        }

        Ok(Self { stored, graph })
    }

    pub fn embedding_model(&self) -> &str {
        &self.stored.embedding_model
    }

    pub fn dimension(&self) -> usize {
        self.stored.dimension
    }

    pub fn len(&self) -> usize {
        self.stored.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stored.entries.is_empty()
    }

    pub fn chunk_ids(&self) -> impl Iterator<Item = &str> {
        self.stored.entries.iter().map(|entry| entry.chunk_id.as_str())
    }

    /// Nearest chunks by cosine similarity. Equal scores keep insertion order.
    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<VectorHit>> {
        anyhow::ensure!(
            query.len() == self.stored.dimension,
            "query vector has {} dimensions but the index was built with {}",
            query.len(),
            self.stored.dimension
        );

        let limit = limit.min(self.len());
        if limit == 0 {
            return Ok(vec![]);
        }

        let mut neighbours = self.graph.search(query, limit, EF_SEARCH.max(limit));
        neighbours.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.d_id.cmp(&b.d_id)));

        Ok(neighbours
            .into_iter()
            .filter_map(|n| {
                self.stored.entries.get(n.d_id).map(|entry| VectorHit {
                    chunk_id: entry.chunk_id.clone(),
                    score: 1.0 - n.distance,
                })
            })
            .collect())
    }
}

impl fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VectorIndex")
            .field("embedding_model", &self.stored.embedding_model)
            .field("dimension", &self.stored.dimension)
            .field("len", &self.len())
            .finish()
    }
}

/// Vector database under `data/vector_db`, cached in memory after the first
/// load. Clones share the cache.
#[derive(Clone)]
pub struct VectorStore {
    dir: PathBuf,
    cached: Arc<RwLock<Option<Arc<VectorIndex>>>>,
}

impl VectorStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            cached: Arc::new(RwLock::new(None)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(self.index_path())
            .await
            .unwrap_or(false)
    }

    pub async fn rebuild(&self, index: VectorIndex) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let body = serde_json::to_vec(&index.stored).context("failed to serialize vector index")?;
        let tmp_path = self.dir.join(format!("{INDEX_FILE}.tmp"));
        tokio::fs::write(&tmp_path, body)
            .await
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, self.index_path())
            .await
            .context("failed to move vector index into place")?;

        tracing::info!(
            "vector database saved to {} ({} vectors, dim {})",
            self.dir.display(),
            index.len(),
            index.dimension()
        );

        *self.cached.write().await = Some(Arc::new(index));
        Ok(())
    }

    pub async fn load(&self) -> Result<Arc<VectorIndex>> {
        if let Some(index) = self.cached.read().await.as_ref() {
            return Ok(index.clone());
        }

        let path = self.index_path();
        let bytes = tokio::fs::read(&path).await.with_context(|| {
            format!(
                "Vector database not found at {}. Run ingest first.",
                self.dir.display()
            )
        })?;
        let stored: StoredVectors = serde_json::from_slice(&bytes)
            .with_context(|| format!("corrupt vector database at {}", path.display()))?;
        let index = tokio::task::spawn_blocking(move || VectorIndex::from_stored(stored))
            .await
            .context("vector index build task panicked")??;
        let index = Arc::new(index);

        *self.cached.write().await = Some(index.clone());
        Ok(index)
    }

    pub async fn search(&self, query: &[f32], limit: usize) -> Result<Vec<VectorHit>> {
        if query.is_empty() || limit == 0 {
            return Ok(vec![]);
        }
        self.load().await?.search(query, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, vector: Vec<f32>) -> VectorEntry {
        VectorEntry {
            chunk_id: id.to_string(),
            vector,
        }
    }

    #[test]
    fn search_ranks_by_cosine_similarity() {
        let index = VectorIndex::build(
            "bge-m3",
            vec![
                entry("far", vec![0.0, 1.0]),
                entry("near", vec![10.0, 1.0]),
                entry("mid", vec![1.0, 1.0]),
            ],
        )
        .unwrap();

        let hits = index.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "near");
        assert_eq!(hits[1].chunk_id, "mid");
        assert!(hits[0].score > hits[1].score);
        assert!(hits[0].score <= 1.0 + 1e-5);
    }

    #[test]
    fn limit_is_capped_at_index_size() {
        let index = VectorIndex::build(
            "bge-m3",
            vec![entry("a", vec![1.0, 0.0]), entry("b", vec![0.0, 1.0])],
        )
        .unwrap();
        assert_eq!(index.search(&[1.0, 1.0], 10).unwrap().len(), 2);
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        assert!(VectorIndex::build("m", vec![entry("a", vec![1.0]), entry("b", vec![1.0, 2.0])]).is_err());

        let index = VectorIndex::build("m", vec![entry("a", vec![1.0, 0.0])]).unwrap();
        assert!(index.search(&[1.0, 0.0, 0.0], 1).is_err());
    }

    #[tokio::test]
    async fn rebuilt_index_survives_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(dir.path().join("vector_db"));
        assert!(!store.exists().await);

        let index = VectorIndex::build(
            "bge-m3",
            vec![entry("a", vec![1.0, 0.0, 0.0]), entry("b", vec![0.0, 1.0, 0.0])],
        )
        .unwrap();
        store.rebuild(index).await.unwrap();
        assert!(store.exists().await);

        let fresh = VectorStore::new(dir.path().join("vector_db"));
        let hits = fresh.search(&[0.0, 2.0, 0.0], 1).await.unwrap();
        assert_eq!(hits[0].chunk_id, "b");
        let loaded = fresh.load().await.unwrap();
        assert_eq!(loaded.embedding_model(), "bge-m3");
        assert_eq!(loaded.len(), 2);
    }

    #[tokio::test]
    async fn missing_database_names_the_ingest_step() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(dir.path().join("vector_db"));
        let err = store.load().await.unwrap_err();
        assert!(format!("{err:#}").contains("Run ingest first"));
    }
}
