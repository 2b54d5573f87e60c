use std::time::Instant;

use anyhow::Result;
use clap::Parser;

use faq_chatbot::config::AppConfig;
use faq_chatbot::db::Database;
use faq_chatbot::ingest::Ingestor;
use faq_chatbot::init_tracing;
use faq_chatbot::models::{IngestMode, IngestRequest, IngestStatus};
use faq_chatbot::ollama::OllamaClient;
use faq_chatbot::tantivy_store::TantivyStore;
use faq_chatbot::vector_store::VectorStore;

const STAGES: [&str; 6] = [
    "hashing_source",
    "extracting_pdf",
    "chunking",
    "embedding",
    "indexing",
    "done",
];

#[derive(Parser, Debug)]
#[command(name = "ingest")]
#[command(about = "Build the vector database and keyword index from the FAQ PDF")]
struct Cli {
    /// Defaults to FAQ_CHATBOT_PDF_PATH or data/FAQ-Arabic.pdf.
    #[arg(long)]
    pdf: Option<String>,
    #[arg(long, value_enum, default_value_t = IngestMode::Chunks)]
    mode: IngestMode,
    /// Re-ingest even when the PDF is unchanged since the last run.
    #[arg(long, default_value_t = false)]
    rebuild: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    let pdf = cli
        .pdf
        .clone()
        .unwrap_or_else(|| config.pdf_path.display().to_string());
    println!(
        "Ingesting {pdf} (mode {}, embeddings {})",
        cli.mode.as_str(),
        config.models.embedding_model
    );

    let db = Database::new(&config).await?;
    let ingestor = Ingestor::new(
        config.clone(),
        db,
        OllamaClient::new(config.ollama_base_url.clone()),
        VectorStore::new(config.vector_db_dir()),
        TantivyStore::new(config.tantivy_dir()),
    );

    let started = Instant::now();
    let job_id = format!("cli-{}", uuid::Uuid::new_v4());
    let request = IngestRequest {
        pdf_path: cli.pdf,
        mode: cli.mode,
        rebuild: cli.rebuild,
    };
    let result = ingestor
        .ingest(&job_id, request, |status| print_stage(&status, started))
        .await?;

    if result.skipped {
        println!(
            "Vector database already up to date ({} chunks). Pass --rebuild to force.",
            result.chunk_count
        );
    } else {
        println!(
            "Vector database saved to {} ({} chunks, {:.1}s).",
            config.vector_db_dir().display(),
            result.chunk_count,
            started.elapsed().as_secs_f32()
        );
    }

    Ok(())
}

fn print_stage(status: &IngestStatus, started: Instant) {
    let elapsed = started.elapsed().as_secs_f32();
    if status.status == "failed" {
        println!("  failed during {} after {elapsed:.1}s", status.stage);
        return;
    }

    match STAGES.iter().position(|stage| *stage == status.stage) {
        Some(idx) => println!(
            "  [{}/{}] {:<15} {elapsed:>6.1}s  chunks={}",
            idx + 1,
            STAGES.len(),
            status.stage,
            status.chunk_count
        ),
        None => println!("  {} {elapsed:>6.1}s", status.stage),
    }
}
