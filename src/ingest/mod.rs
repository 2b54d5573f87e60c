pub mod pdf;
pub mod text;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::Database;
use crate::models::{Chunk, ChunkKind, IngestManifest, IngestMode, IngestRequest, IngestStatus};
use crate::ollama::OllamaClient;
use crate::tantivy_store::TantivyStore;
use crate::vector_store::{VectorEntry, VectorIndex, VectorStore};

use self::text::TextSplitter;

const EMBED_BATCH_SIZE: usize = 16;

#[derive(Clone)]
pub struct Ingestor {
    config: AppConfig,
    db: Database,
    ollama: OllamaClient,
    vectors: VectorStore,
    tantivy: TantivyStore,
    exclusive: Arc<Mutex<()>>,
}

#[derive(Debug, Clone)]
pub struct IngestResult {
    pub chunk_count: i64,
    pub skipped: bool,
}

impl Ingestor {
    pub fn new(
        config: AppConfig,
        db: Database,
        ollama: OllamaClient,
        vectors: VectorStore,
        tantivy: TantivyStore,
    ) -> Self {
        Self {
            config,
            db,
            ollama,
            vectors,
            tantivy,
            exclusive: Arc::new(Mutex::new(())),
        }
    }

    /// Runs one ingest job. Jobs on clones of the same `Ingestor` wait for
    /// each other. A failure is recorded as a `failed` status before the
    /// error is returned.
    pub async fn ingest<F>(
        &self,
        job_id: &str,
        request: IngestRequest,
        mut progress: F,
    ) -> Result<IngestResult>
    where
        F: FnMut(IngestStatus) + Send,
    {
        let _running = self.exclusive.lock().await;

        let now = Utc::now();
        let mut status = IngestStatus {
            job_id: job_id.to_string(),
            status: "running".to_string(),
            stage: "hashing_source".to_string(),
            message: None,
            chunk_count: 0,
            started_at: now,
            updated_at: now,
        };

        let result = self.run_stages(&request, &mut status, &mut progress).await;
        if let Err(err) = &result {
            status.status = "failed".to_string();
            status.message = Some(format!("{err:#}"));
            if let Err(report_err) = self.report(&mut status, &mut progress).await {
                tracing::warn!("could not record failure of job {job_id}: {report_err:#}");
            }
            tracing::error!("ingest job {} failed at {}: {:#}", job_id, status.stage, err);
        }
        result
    }

    async fn run_stages<F>(
        &self,
        request: &IngestRequest,
        status: &mut IngestStatus,
        progress: &mut F,
    ) -> Result<IngestResult>
    where
        F: FnMut(IngestStatus) + Send,
    {
        let pdf_path = request
            .pdf_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.pdf_path.clone());

        self.report(status, progress).await?;
        let pdf_hash = file_sha256(&pdf_path).await?;

        if !request.rebuild && self.vectors.exists().await {
            if let Some(latest) = self.db.latest_manifest().await? {
                if latest.pdf_hash == pdf_hash
                    && latest.mode == request.mode
                    && latest.embedding_model == self.config.models.embedding_model
                {
                    status.status = "completed".to_string();
                    status.stage = "skipped_unchanged".to_string();
                    status.message = Some("Source PDF unchanged; skipped re-ingest.".to_string());
                    status.chunk_count = latest.chunk_count;
                    self.report(status, progress).await?;

                    return Ok(IngestResult {
                        chunk_count: latest.chunk_count,
                        skipped: true,
                    });
                }
            }
        }

        status.stage = "extracting_pdf".to_string();
        self.report(status, progress).await?;
        let raw_text = pdf::extract_pdf_text(&pdf_path).await?;

        self.index_text(&raw_text, &pdf_hash, request.mode, status, progress)
            .await
            .with_context(|| format!("ingest of {} failed", pdf_path.display()))
    }

    /// Chunks, embeds and indexes extracted text. Callers hold `exclusive`.
    async fn index_text<F>(
        &self,
        raw_text: &str,
        source_hash: &str,
        mode: IngestMode,
        status: &mut IngestStatus,
        progress: &mut F,
    ) -> Result<IngestResult>
    where
        F: FnMut(IngestStatus) + Send,
    {
        let embedding_model = self.config.models.embedding_model.clone();

        status.stage = "chunking".to_string();
        self.report(status, progress).await?;
        let splitter = TextSplitter::new(
            self.config.retrieval.chunk_size,
            self.config.retrieval.chunk_overlap,
        )?;
        let chunks = build_chunks(raw_text, mode, &splitter, source_hash)?;
        if chunks.is_empty() {
            anyhow::bail!("no chunks generated (mode {})", mode.as_str());
        }
        tracing::info!("split text into {} chunks", chunks.len());
        status.chunk_count = chunks.len() as i64;

        status.stage = "embedding".to_string();
        self.report(status, progress).await?;
        let mut entries = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(EMBED_BATCH_SIZE) {
            let inputs: Vec<String> = batch.iter().map(|chunk| chunk.content.clone()).collect();
            let vectors = self
                .ollama
                .embed_batch(&embedding_model, &inputs)
                .await
                .with_context(|| {
                    format!("failed embedding chunks starting at {}", batch[0].ordinal)
                })?;

            entries.extend(batch.iter().zip(vectors).map(|(chunk, vector)| VectorEntry {
                chunk_id: chunk.id.clone(),
                vector,
            }));
        }

        status.stage = "indexing".to_string();
        self.report(status, progress).await?;
        let index = VectorIndex::build(&embedding_model, entries)?;
        self.commit(&chunks, index).await?;

        self.db
            .record_manifest(&IngestManifest {
                pdf_hash: source_hash.to_string(),
                mode,
                embedding_model,
                created_at: Utc::now(),
                chunk_count: chunks.len() as i64,
            })
            .await?;

        status.status = "completed".to_string();
        status.stage = "done".to_string();
        self.report(status, progress).await?;
        tracing::info!("ingestion completed with {} chunks", chunks.len());

        Ok(IngestResult {
            chunk_count: chunks.len() as i64,
            skipped: false,
        })
    }

    /// Swaps all three stores to `chunks`. SQLite gains the new rows first and
    /// loses the old ones last, so ids served by either index always resolve.
    async fn commit(&self, chunks: &[Chunk], index: VectorIndex) -> Result<()> {
        let ids: Vec<String> = chunks.iter().map(|chunk| chunk.id.clone()).collect();
        self.db.insert_chunks(chunks).await?;

        if let Err(err) = self.vectors.rebuild(index).await {
            if let Err(cleanup) = self.db.delete_chunks(&ids).await {
                tracing::warn!("could not remove chunks of the failed ingest: {cleanup:#}");
            }
            return Err(err);
        }

        let tantivy = self.tantivy.clone();
        let for_index = chunks.to_vec();
        tokio::task::spawn_blocking(move || tantivy.rebuild(&for_index))
            .await
            .context("tantivy rebuild task panicked")??;

        let pruned = self.db.retain_chunks(&ids).await?;
        tracing::debug!("pruned {pruned} chunks of the previous ingest");

        let stored = self.db.chunk_count().await?;
        let live = self.vectors.load().await?;
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        anyhow::ensure!(
            stored == ids.len() as i64
                && live.len() == ids.len()
                && live.chunk_ids().all(|id| wanted.contains(id)),
            "stores disagree after ingest: sqlite {} chunks, vector index {} for {} new chunks",
            stored,
            live.len(),
            ids.len()
        );
        Ok(())
    }

    /// Persists the status before handing it to `progress`, so a caller that
    /// drops terminal jobs from memory can still find them in SQLite.
    async fn report<F>(&self, status: &mut IngestStatus, progress: &mut F) -> Result<()>
    where
        F: FnMut(IngestStatus) + Send,
    {
        status.updated_at = Utc::now();
        self.db.upsert_ingest_status(status).await?;
        progress(status.clone());
        Ok(())
    }
}

fn build_chunks(
    raw_text: &str,
    mode: IngestMode,
    splitter: &TextSplitter,
    source_hash: &str,
) -> Result<Vec<Chunk>> {
    let (kind, contents) = match mode {
        IngestMode::Chunks => (
            ChunkKind::PdfText,
            splitter.split(&text::clean_text(raw_text)),
        ),
        IngestMode::QaPairs => {
            let pairs = text::extract_qa_pairs(raw_text)?;
            tracing::info!("extracted {} question-answer pairs", pairs.len());
            (
                ChunkKind::QaPair,
                pairs.iter().map(|pair| pair.to_chunk_text()).collect(),
            )
        }
    };

    Ok(contents
        .into_iter()
        .enumerate()
        .map(|(ordinal, content)| Chunk {
            id: Uuid::new_v4().to_string(),
            ordinal: ordinal as i64,
            char_count: content.chars().count() as i64,
            content,
            kind,
            source_hash: source_hash.to_string(),
        })
        .collect())
}

async fn file_sha256(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("PDF file not found at {}", path.display()))?;

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::test_support::Workspace;

    const FAQ: &str = "س1: هل الإعارة مجانية؟\nجواب: نعم الإعارة مجانية للأعضاء.\nس2: متى تغلق المكتبة؟\nجواب: تغلق المكتبة يوم الجمعة.";

    fn fresh_status(job_id: &str) -> IngestStatus {
        let now = Utc::now();
        IngestStatus {
            job_id: job_id.to_string(),
            status: "running".to_string(),
            stage: "hashing_source".to_string(),
            message: None,
            chunk_count: 0,
            started_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn chunk_mode_cleans_then_windows_the_text() {
        let raw = "Page 1\nمكتبة الوقف العامة تفتح يوميا\nPage 2\nوتغلق مساء الخميس";
        let splitter = TextSplitter::new(20, 5).unwrap();
        let chunks = build_chunks(raw, IngestMode::Chunks, &splitter, "h").unwrap();

        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.kind == ChunkKind::PdfText));
        assert!(chunks.iter().all(|c| c.char_count <= 20));
        assert!(chunks.iter().all(|c| !c.content.contains("Page")));
        let ordinals: Vec<i64> = chunks.iter().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, (0..chunks.len() as i64).collect::<Vec<_>>());
    }

    #[test]
    fn qa_mode_emits_one_chunk_per_pair() {
        let raw = "س1: ما ساعات العمل؟\nجواب: من الثامنة.\nس2: أين المكتبة؟\nجواب: في وسط المدينة.";
        let splitter = TextSplitter::new(1_000, 200).unwrap();
        let chunks = build_chunks(raw, IngestMode::QaPairs, &splitter, "h").unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].kind, ChunkKind::QaPair);
        assert_eq!(chunks[1].content, "سؤال: أين المكتبة؟\nجواب: في وسط المدينة.");
    }

    #[tokio::test]
    async fn hashing_a_missing_pdf_reports_its_path() {
        let err = file_sha256(Path::new("/nonexistent/FAQ-Arabic.pdf"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("FAQ-Arabic.pdf"));
    }

    #[tokio::test]
    async fn indexing_walks_the_stages_and_keeps_stores_in_agreement() {
        let server = MockServer::start_async().await;
        let embed = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed").body_contains("سؤال:");
                then.status(200)
                    .json_body(json!({ "embeddings": [[1.0, 0.0], [0.0, 1.0]] }));
            })
            .await;
        let ws = Workspace::new(&server.base_url()).await;
        let ingestor = ws.ingestor();

        let mut stages = Vec::new();
        let mut record = |status: IngestStatus| stages.push(status.stage);
        let mut status = fresh_status("job-a");
        let first = ingestor
            .index_text(FAQ, "hash-a", IngestMode::QaPairs, &mut status, &mut record)
            .await
            .unwrap();
        assert_eq!(stages, vec!["chunking", "embedding", "indexing", "done"]);
        assert_eq!(first.chunk_count, 2);

        let mut status = fresh_status("job-b");
        ingestor
            .index_text(FAQ, "hash-b", IngestMode::QaPairs, &mut status, &mut |_: IngestStatus| {})
            .await
            .unwrap();
        embed.assert_hits_async(2).await;

        assert_eq!(ws.db.chunk_count().await.unwrap(), 2);
        let vector_ids: Vec<String> = ws
            .vectors
            .load()
            .await
            .unwrap()
            .chunk_ids()
            .map(str::to_string)
            .collect();
        assert_eq!(ws.db.get_chunks_by_ids(&vector_ids).await.unwrap().len(), 2);

        let lexical_ids: Vec<String> = ws
            .tantivy
            .search("المكتبة", 10)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert!(!lexical_ids.is_empty());
        assert_eq!(
            ws.db.get_chunks_by_ids(&lexical_ids).await.unwrap().len(),
            lexical_ids.len()
        );
        assert_eq!(ws.db.latest_manifest().await.unwrap().unwrap().pdf_hash, "hash-b");
    }

    #[tokio::test]
    async fn text_that_cleans_to_nothing_is_rejected() {
        let ws = Workspace::new("http://127.0.0.1:9").await;
        let mut status = fresh_status("job-latin");
        let err = ws
            .ingestor()
            .index_text("Chapter One: Introduction", "h", IngestMode::Chunks, &mut status, &mut |_: IngestStatus| {})
            .await
            .unwrap_err();

        assert!(err.to_string().contains("no chunks generated"));
        assert_eq!(ws.db.chunk_count().await.unwrap(), 0);
        assert!(ws.db.latest_manifest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unchanged_pdf_is_skipped_without_touching_the_backend() {
        let ws = Workspace::new("http://127.0.0.1:9").await;
        ws.seed(&[("c1", "الإعارة مجانية", vec![1.0, 0.0])]).await;
        tokio::fs::write(&ws.config.pdf_path, b"%PDF-1.4 faq").await.unwrap();
        ws.db
            .record_manifest(&IngestManifest {
                pdf_hash: file_sha256(&ws.config.pdf_path).await.unwrap(),
                mode: IngestMode::Chunks,
                embedding_model: ws.config.models.embedding_model.clone(),
                created_at: Utc::now(),
                chunk_count: 1,
            })
            .await
            .unwrap();

        let mut stages = Vec::new();
        let result = ws
            .ingestor()
            .ingest("job-skip", IngestRequest::default(), |status| stages.push(status.stage))
            .await
            .unwrap();

        assert!(result.skipped);
        assert_eq!(result.chunk_count, 1);
        assert_eq!(stages, vec!["hashing_source", "skipped_unchanged"]);
        let stored = ws.db.get_ingest_status("job-skip").await.unwrap().unwrap();
        assert_eq!(stored.status, "completed");
    }

    #[tokio::test]
    async fn jobs_wait_for_the_running_one_and_record_failures() {
        let ws = Workspace::new("http://127.0.0.1:9").await;
        let ingestor = ws.ingestor();
        let held = ingestor.exclusive.lock().await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let task = {
            let ingestor = ingestor.clone();
            tokio::spawn(async move {
                ingestor
                    .ingest("job-wait", IngestRequest::default(), move |status| {
                        let _ = tx.send(status);
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        drop(held);
        let err = task.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("PDF file not found"));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.stage, "hashing_source");
        let last = rx.recv().await.unwrap();
        assert_eq!(last.status, "failed");

        let stored = ws.db.get_ingest_status("job-wait").await.unwrap().unwrap();
        assert_eq!(stored.status, "failed");
        assert!(stored.message.unwrap().contains("PDF file not found"));
    }
}
