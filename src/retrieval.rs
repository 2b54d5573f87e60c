use std::cmp::Ordering;
use std::collections::HashMap;

use anyhow::Result;

use crate::db::Database;
use crate::models::RetrievalResult;
use crate::ollama::OllamaClient;
use crate::tantivy_store::TantivyStore;
use crate::vector_store::{VectorHit, VectorStore};

const MIN_RECALL_K: usize = 12;
const RRF_K: f32 = 60.0;
const VECTOR_WEIGHT: f32 = 1.0;
const BM25_WEIGHT: f32 = 0.8;

#[derive(Clone)]
pub struct Retriever {
    db: Database,
    vectors: VectorStore,
    tantivy: TantivyStore,
    ollama: OllamaClient,
    embedding_model: String,
}

impl Retriever {
    pub fn new(
        db: Database,
        vectors: VectorStore,
        tantivy: TantivyStore,
        ollama: OllamaClient,
        embedding_model: impl Into<String>,
    ) -> Self {
        Self {
            db,
            vectors,
            tantivy,
            ollama,
            embedding_model: embedding_model.into(),
        }
    }

    pub fn vector_store(&self) -> &VectorStore {
        &self.vectors
    }

    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievalResult>> {
        if query.trim().is_empty() || top_k == 0 {
            return Ok(vec![]);
        }

        let recall_k = top_k.saturating_mul(4).max(MIN_RECALL_K);
        let embedding = self.ollama.embed(&self.embedding_model, query).await?;
        let vector_fut = self.vectors.search(&embedding, recall_k);

        let tantivy = self.tantivy.clone();
        let query_text = query.to_string();
        let bm25_fut = tokio::task::spawn_blocking(move || tantivy.search(&query_text, recall_k));

        let (vector_hits, bm25_hits) = tokio::join!(vector_fut, bm25_fut);

        // The vector side is the primary signal; a broken lexical index only
        // costs recall.
        let vector_hits = vector_hits?;
        let bm25_hits = match bm25_hits {
            Ok(Ok(hits)) => hits,
            Ok(Err(err)) => {
                tracing::warn!("lexical search failed: {err:#}");
                vec![]
            }
            Err(err) => {
                tracing::warn!("lexical search task panicked: {err}");
                vec![]
            }
        };

        let ranked = fuse_rankings(&vector_hits, &bm25_hits);
        let selected_ids: Vec<String> = ranked
            .iter()
            .take(top_k)
            .map(|(chunk_id, _)| chunk_id.clone())
            .collect();

        let chunks = self.db.get_chunks_by_ids(&selected_ids).await?;
        let score_map: HashMap<&str, f32> = ranked
            .iter()
            .map(|(chunk_id, score)| (chunk_id.as_str(), *score))
            .collect();

        let mut out: Vec<RetrievalResult> = chunks
            .into_iter()
            .map(|chunk| RetrievalResult {
                score: score_map.get(chunk.id.as_str()).copied().unwrap_or(0.0),
                chunk,
            })
            .collect();

        out.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        tracing::debug!(
            "retrieved {} chunks (vector hits {}, bm25 hits {})",
            out.len(),
            vector_hits.len(),
            bm25_hits.len()
        );
        Ok(out)
    }
}

/// Reciprocal rank fusion of the vector and BM25 rankings, best first.
/// Ties keep the order in which chunks were first seen.
fn fuse_rankings(vector_hits: &[VectorHit], bm25_hits: &[(String, f32)]) -> Vec<(String, f32)> {
    let mut order: Vec<String> = Vec::new();
    let mut scores: HashMap<String, f32> = HashMap::new();

    let ranked_ids = vector_hits
        .iter()
        .enumerate()
        .map(|(rank, hit)| (hit.chunk_id.as_str(), VECTOR_WEIGHT / (RRF_K + (rank + 1) as f32)))
        .chain(
            bm25_hits
                .iter()
                .enumerate()
                .map(|(rank, (id, _))| (id.as_str(), BM25_WEIGHT / (RRF_K + (rank + 1) as f32))),
        );

    for (chunk_id, score) in ranked_ids {
        match scores.get_mut(chunk_id) {
            Some(total) => *total += score,
            None => {
                order.push(chunk_id.to_string());
                scores.insert(chunk_id.to_string(), score);
            }
        }
    }

    let mut ranked: Vec<(String, f32)> = order
        .into_iter()
        .map(|id| {
            let score = scores.get(&id).copied().unwrap_or(0.0);
            (id, score)
        })
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    ranked
}

#[cfg(test)]
mod tests {
    use httpmock::MockServer;

    use super::*;
    use crate::test_support::{mock_query_embedding, Workspace};

    fn hit(id: &str) -> VectorHit {
        VectorHit {
            chunk_id: id.to_string(),
            score: 0.5,
        }
    }

    #[test]
    fn chunks_found_by_both_rankers_rise_to_the_top() {
        let vector = vec![hit("a"), hit("b"), hit("c")];
        let bm25 = vec![("c".to_string(), 7.0), ("d".to_string(), 3.0)];

        let fused = fuse_rankings(&vector, &bm25);
        assert_eq!(fused[0].0, "c");
        assert_eq!(fused.len(), 4);
    }

    #[test]
    fn vector_rank_wins_over_equal_lexical_rank() {
        let fused = fuse_rankings(&[hit("v")], &[("l".to_string(), 1.0)]);
        assert_eq!(fused[0].0, "v");
        assert_eq!(fused[1].0, "l");
    }

    #[tokio::test]
    async fn retrieve_returns_fused_chunks_from_sqlite() {
        let server = MockServer::start_async().await;
        let embed = mock_query_embedding(&server, vec![0.0, 1.0]).await;
        let ws = Workspace::new(&server.base_url()).await;
        ws.seed(&[
            ("loans", "الإعارة مجانية للأعضاء.", vec![1.0, 0.0]),
            ("hours", "المكتبة مغلقة يوم الجمعة.", vec![0.0, 1.0]),
            ("fees", "رسوم التأخير خمسة ريالات.", vec![0.7, 0.7]),
        ])
        .await;

        let results = ws.retriever().retrieve("متى تكون المكتبة مغلقة", 2).await.unwrap();
        embed.assert_hits_async(1).await;

        let ids: Vec<&str> = results.iter().map(|r| r.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["hours", "fees"]);
        assert!(results[0].score > results[1].score);
        assert_eq!(results[0].chunk.content, "المكتبة مغلقة يوم الجمعة.");
    }

    #[tokio::test]
    async fn blank_query_skips_the_backend() {
        let ws = Workspace::new("http://127.0.0.1:9").await;
        assert!(ws.retriever().retrieve("   ", 3).await.unwrap().is_empty());
    }
}
