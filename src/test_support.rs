//! Fixtures for tests that need real stores on disk and a stubbed Ollama.

use std::sync::Arc;

use httpmock::prelude::*;
use httpmock::Mock;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use crate::config::AppConfig;
use crate::db::Database;
use crate::ingest::Ingestor;
use crate::models::{Chunk, ChunkKind};
use crate::ollama::OllamaClient;
use crate::query::QueryEngine;
use crate::retrieval::Retriever;
use crate::tantivy_store::TantivyStore;
use crate::vector_store::{VectorEntry, VectorIndex, VectorStore};

pub(crate) struct Workspace {
    _dir: TempDir,
    pub config: AppConfig,
    pub db: Database,
    pub vectors: VectorStore,
    pub tantivy: TantivyStore,
    pub ollama: OllamaClient,
}

impl Workspace {
    pub async fn new(ollama_url: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::from_lookup(|_| None);
        config.data_dir = dir.path().join("data");
        config.pdf_path = config.data_dir.join("FAQ-Arabic.pdf");
        config.templates_dir = dir.path().join("templates");
        config.ollama_base_url = ollama_url.to_string();

        let db = Database::new(&config).await.unwrap();
        let vectors = VectorStore::new(config.vector_db_dir());
        let tantivy = TantivyStore::new(config.tantivy_dir());
        let ollama = OllamaClient::new(config.ollama_base_url.clone());

        Self {
            _dir: dir,
            config,
            db,
            vectors,
            tantivy,
            ollama,
        }
    }

    /// Writes `(id, content, embedding)` rows to SQLite, tantivy and the
    /// vector database.
    pub async fn seed(&self, rows: &[(&str, &str, Vec<f32>)]) {
        let chunks: Vec<Chunk> = rows
            .iter()
            .enumerate()
            .map(|(ordinal, (id, content, _))| Chunk {
                id: id.to_string(),
                ordinal: ordinal as i64,
                content: content.to_string(),
                kind: ChunkKind::PdfText,
                char_count: content.chars().count() as i64,
                source_hash: "seed".to_string(),
            })
            .collect();
        self.db.insert_chunks(&chunks).await.unwrap();
        self.tantivy.rebuild(&chunks).unwrap();

        let entries = rows
            .iter()
            .map(|(id, _, vector)| VectorEntry {
                chunk_id: id.to_string(),
                vector: vector.clone(),
            })
            .collect();
        let index = VectorIndex::build(&self.config.models.embedding_model, entries).unwrap();
        self.vectors.rebuild(index).await.unwrap();
    }

    pub fn retriever(&self) -> Retriever {
        Retriever::new(
            self.db.clone(),
            self.vectors.clone(),
            self.tantivy.clone(),
            self.ollama.clone(),
            self.config.models.embedding_model.clone(),
        )
    }

    pub async fn engine(&self) -> QueryEngine {
        QueryEngine::new(
            self.config.clone(),
            self.ollama.clone(),
            self.retriever(),
            Arc::new(Semaphore::new(1)),
        )
        .await
        .unwrap()
    }

    pub fn ingestor(&self) -> Ingestor {
        Ingestor::new(
            self.config.clone(),
            self.db.clone(),
            self.ollama.clone(),
            self.vectors.clone(),
            self.tantivy.clone(),
        )
    }
}

/// Answers every `/api/embed` call with the same single vector.
pub(crate) async fn mock_query_embedding(server: &MockServer, vector: Vec<f32>) -> Mock<'_> {
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/embed");
            then.status(200)
                .json_body(json!({ "embeddings": [vector] }));
        })
        .await
}

pub(crate) async fn mock_generation<'a>(server: &'a MockServer, response: &str) -> Mock<'a> {
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/generate");
            then.status(200)
                .json_body(json!({ "response": response, "done": true }));
        })
        .await
}

pub(crate) async fn mock_generation_failure(server: &MockServer) -> Mock<'_> {
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/generate");
            then.status(500)
                .json_body(json!({ "error": "model runner has unexpectedly stopped" }));
        })
        .await
}
