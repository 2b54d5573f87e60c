use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use tokio::process::Command;

/// Extracts the raw text of every page, joined with newlines.
///
/// Poppler's `pdftotext` handles Arabic shaping and right-to-left order much
/// better than the pure Rust extractor, so it is used page by page when it is
/// installed; `pdf-extract` is the fallback.
pub async fn extract_pdf_text(pdf_path: &Path) -> Result<String> {
    if !tokio::fs::try_exists(pdf_path).await.unwrap_or(false) {
        anyhow::bail!("PDF file not found at {}", pdf_path.display());
    }

    tracing::info!("extracting text from {}", pdf_path.display());

    let mut pages = Vec::new();
    if has_command("pdftotext").await {
        let page_count = get_pdf_page_count(pdf_path).await.unwrap_or(0);
        for page in 1..=page_count {
            match extract_page_with_pdftotext(pdf_path, page).await {
                Ok(Some(text)) => pages.push(text),
                Ok(None) => {}
                Err(err) => tracing::warn!("pdftotext failed on page {}: {:#}", page, err),
            }
        }
    }

    let text = if pages.is_empty() {
        let owned = pdf_path.to_path_buf();
        tokio::task::spawn_blocking(move || pdf_extract::extract_text(&owned))
            .await
            .context("PDF extraction task panicked")?
            .with_context(|| format!("failed to extract text from {}", pdf_path.display()))?
    } else {
        pages.join("\n")
    };

    tracing::info!("extracted {} characters from PDF", text.chars().count());
    Ok(text)
}

async fn extract_page_with_pdftotext(pdf_path: &Path, page: usize) -> Result<Option<String>> {
    let output = Command::new("pdftotext")
        .arg("-f")
        .arg(page.to_string())
        .arg("-l")
        .arg(page.to_string())
        .arg("-enc")
        .arg("UTF-8")
        .arg("-nopgbrk")
        .arg(pdf_path)
        .arg("-")
        .output()
        .await
        .with_context(|| format!("failed to run pdftotext for page {}", page))?;

    if !output.status.success() {
        return Ok(None);
    }

    let text = String::from_utf8_lossy(&output.stdout).replace('\u{FFFD}', "");
    if text.trim().is_empty() {
        return Ok(None);
    }

    Ok(Some(text))
}

async fn get_pdf_page_count(pdf_path: &Path) -> Result<usize> {
    let output = Command::new("pdfinfo")
        .arg(pdf_path)
        .output()
        .await
        .context("failed to run pdfinfo")?;

    if !output.status.success() {
        anyhow::bail!("pdfinfo exited with non-zero status");
    }

    parse_page_count(&String::from_utf8_lossy(&output.stdout))
}

fn parse_page_count(pdfinfo_stdout: &str) -> Result<usize> {
    let regex = Regex::new(r"(?m)^Pages:\s+(\d+)\s*$")?;
    regex
        .captures(pdfinfo_stdout)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<usize>().ok())
        .ok_or_else(|| anyhow::anyhow!("unable to parse page count from pdfinfo"))
}

pub(crate) async fn has_command(binary: &str) -> bool {
    // Some poppler tools exit non-zero on --version, so probe PATH instead.
    Command::new("which")
        .arg(binary)
        .output()
        .await
        .map(|out| out.status.success() && !out.stdout.is_empty())
        .unwrap_or(false)
}
