use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;

use faq_chatbot::db::Database;
use faq_chatbot::ingest::Ingestor;
use faq_chatbot::ollama::OllamaClient;
use faq_chatbot::query::QueryEngine;
use faq_chatbot::retrieval::Retriever;
use faq_chatbot::tantivy_store::TantivyStore;
use faq_chatbot::vector_store::VectorStore;
use faq_chatbot::{init_tracing, run_server, server, AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env();
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let db = Database::new(&config).await?;
    let ollama = OllamaClient::new(config.ollama_base_url.clone());
    let vectors = VectorStore::new(config.vector_db_dir());
    let tantivy = TantivyStore::new(config.tantivy_dir());

    let retriever = Retriever::new(
        db.clone(),
        vectors.clone(),
        tantivy.clone(),
        ollama.clone(),
        config.models.embedding_model.clone(),
    );

    let engine = QueryEngine::new(
        config.clone(),
        ollama.clone(),
        retriever,
        Arc::new(Semaphore::new(1)),
    )
    .await?;

    let ingestor = Ingestor::new(config.clone(), db.clone(), ollama, vectors, tantivy);

    let (listener, addr) = server::bind(&config)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    println!("Server running at http://{addr}");

    run_server(listener, config, db, engine, ingestor).await
}
