use anyhow::Result;
use clap::Parser;

use faq_chatbot::config::AppConfig;
use faq_chatbot::init_tracing;
use faq_chatbot::ollama::OllamaClient;
use faq_chatbot::setup::{missing_models, prepare_workspace};

#[derive(Parser, Debug)]
#[command(name = "setup")]
#[command(about = "Prepare data/ and templates/ and check the local model backend")]
struct Cli {
    /// Only prepare directories; do not contact Ollama.
    #[arg(long, default_value_t = false)]
    skip_model_check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    let report = prepare_workspace(&config).await?;
    for dir in &report.created_dirs {
        println!("created {}", dir.display());
    }
    if let Some(path) = &report.template_written {
        println!("wrote {}", path.display());
    }
    if !report.pdftotext_available {
        println!("note: pdftotext (poppler-utils) not found; falling back to the built-in PDF extractor");
    }

    if !cli.skip_model_check {
        let ollama = OllamaClient::new(config.ollama_base_url.clone());
        let missing = missing_models(&config, &ollama).await?;
        if !missing.is_empty() {
            for model in &missing {
                println!("missing model: run `ollama pull {model}`");
            }
            anyhow::bail!("{} configured model(s) are not installed", missing.len());
        }
        println!("ollama at {} has the configured models", ollama.base_url());
    }

    if report.pdf_present {
        println!("Setup complete. Run `ingest` to build the vector database.");
    } else {
        println!(
            "Setup complete. Place FAQ-Arabic.pdf at {} before running `ingest`.",
            config.pdf_path.display()
        );
    }

    Ok(())
}
