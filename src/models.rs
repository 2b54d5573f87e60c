use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    PdfText,
    QaPair,
}

impl ChunkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkKind::PdfText => "pdf_text",
            ChunkKind::QaPair => "qa_pair",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "qa_pair" => ChunkKind::QaPair,
            _ => ChunkKind::PdfText,
        }
    }
}

/// How the cleaned PDF text is turned into indexable chunks.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum IngestMode {
    /// Overlapping character windows over the whole document.
    #[default]
    Chunks,
    /// One chunk per detected question/answer pair.
    QaPairs,
}

impl IngestMode {
    pub fn as_str(self) -> &'static str {
        match self {
            IngestMode::Chunks => "chunks",
            IngestMode::QaPairs => "qa-pairs",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub ordinal: i64,
    pub content: String,
    pub kind: ChunkKind,
    pub char_count: i64,
    pub source_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
}

impl QaPair {
    pub fn to_chunk_text(&self) -> String {
        format!("سؤال: {}\nجواب: {}", self.question, self.answer)
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub chunk: Chunk,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestManifest {
    pub pdf_hash: String,
    pub mode: IngestMode,
    pub embedding_model: String,
    pub created_at: DateTime<Utc>,
    pub chunk_count: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestRequest {
    #[serde(default)]
    pub pdf_path: Option<String>,
    #[serde(default)]
    pub mode: IngestMode,
    #[serde(default)]
    pub rebuild: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub job_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestStatus {
    pub job_id: String,
    pub status: String,
    pub stage: String,
    pub message: Option<String>,
    pub chunk_count: i64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IngestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "completed" | "failed")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResponse {
    pub answer: String,
}
