use std::path::PathBuf;

use anyhow::{Context, Result};
use askama::Template;

use crate::config::AppConfig;
use crate::ingest::pdf::has_command;
use crate::ollama::{model_is_installed, OllamaClient};
use crate::server::IndexTemplate;

#[derive(Debug, Clone, Default)]
pub struct SetupReport {
    pub created_dirs: Vec<PathBuf>,
    pub template_written: Option<PathBuf>,
    pub pdf_present: bool,
    pub pdftotext_available: bool,
}

/// Creates `data/` and `templates/`, writes the rendered chat page and
/// reports whether the FAQ PDF is in place. Safe to run repeatedly.
pub async fn prepare_workspace(config: &AppConfig) -> Result<SetupReport> {
    let mut report = SetupReport::default();

    for dir in [&config.data_dir, &config.templates_dir] {
        if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
            tracing::info!("created {}", dir.display());
            report.created_dirs.push(dir.clone());
        }
    }

    let template_path = config.index_template_path();
    if !tokio::fs::try_exists(&template_path).await.unwrap_or(false) {
        let page = IndexTemplate::default().render()?;
        tokio::fs::write(&template_path, page)
            .await
            .with_context(|| format!("failed to write {}", template_path.display()))?;
        report.template_written = Some(template_path);
    }

    report.pdf_present = tokio::fs::try_exists(&config.pdf_path)
        .await
        .unwrap_or(false);
    report.pdftotext_available = has_command("pdftotext").await;

    Ok(report)
}

/// Returns the configured models that are not installed in Ollama.
pub async fn missing_models(config: &AppConfig, ollama: &OllamaClient) -> Result<Vec<String>> {
    let installed = ollama.list_models().await?;
    Ok([
        &config.models.embedding_model,
        &config.models.answer_model,
    ]
    .into_iter()
    .filter(|model| !model_is_installed(&installed, model))
    .cloned()
    .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(root: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::from_lookup(|_| None);
        config.data_dir = root.join("data");
        config.pdf_path = config.data_dir.join("FAQ-Arabic.pdf");
        config.templates_dir = root.join("templates");
        config
    }

    #[tokio::test]
    async fn fresh_workspace_gets_data_and_templates_dirs() {
        let root = tempfile::tempdir().unwrap();
        let config = config_in(root.path());

        let report = prepare_workspace(&config).await.unwrap();

        assert!(config.data_dir.is_dir());
        assert!(config.templates_dir.is_dir());
        assert_eq!(report.created_dirs.len(), 2);
        assert!(!report.pdf_present);
        let page = std::fs::read_to_string(config.index_template_path()).unwrap();
        assert!(page.contains("dir=\"rtl\""));
        assert!(!page.contains("{{"));
    }

    #[tokio::test]
    async fn rerunning_keeps_existing_files() {
        let root = tempfile::tempdir().unwrap();
        let config = config_in(root.path());
        prepare_workspace(&config).await.unwrap();

        std::fs::write(config.index_template_path(), "<p>custom</p>").unwrap();
        std::fs::write(&config.pdf_path, b"%PDF-1.4").unwrap();

        let report = prepare_workspace(&config).await.unwrap();
        assert!(report.created_dirs.is_empty());
        assert!(report.template_written.is_none());
        assert!(report.pdf_present);
        assert_eq!(
            std::fs::read_to_string(config.index_template_path()).unwrap(),
            "<p>custom</p>"
        );
    }
}
