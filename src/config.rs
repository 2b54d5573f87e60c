use std::env;
use std::path::PathBuf;

pub const DEFAULT_NO_ANSWER_MSG: &str = "عذرًا، لا أملك معلومات كافية للإجابة على هذا السؤال.";

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub answer_model: String,
    pub embedding_model: String,
}

#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

#[derive(Clone, Debug)]
pub struct GenerationConfig {
    pub max_output_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub pdf_path: PathBuf,
    pub templates_dir: PathBuf,
    pub ollama_base_url: String,
    pub models: ModelConfig,
    pub retrieval: RetrievalConfig,
    pub generation: GenerationConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup, falling back to the
    /// built-in defaults for missing or unparsable values.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = lookup("FAQ_CHATBOT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));
        let pdf_path = lookup("FAQ_CHATBOT_PDF_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("FAQ-Arabic.pdf"));

        let parse_usize = |key: &str, default: usize| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };

        Self {
            bind_addr: lookup("FAQ_CHATBOT_BIND").unwrap_or_else(|| "127.0.0.1:8000".to_string()),
            pdf_path,
            templates_dir: lookup("FAQ_CHATBOT_TEMPLATES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./templates")),
            ollama_base_url: lookup("OLLAMA_BASE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:11434".to_string()),
            models: ModelConfig {
                answer_model: lookup("ANSWER_MODEL")
                    .unwrap_or_else(|| "qwen2.5:7b-instruct".to_string()),
                embedding_model: lookup("EMBEDDING_MODEL").unwrap_or_else(|| "bge-m3".to_string()),
            },
            retrieval: RetrievalConfig {
                top_k: parse_usize("TOP_K_RESULTS", 3).max(1),
                chunk_size: parse_usize("CHUNK_SIZE", 1_000).max(1),
                chunk_overlap: parse_usize("CHUNK_OVERLAP", 200),
            },
            generation: GenerationConfig {
                max_output_tokens: parse_usize("MAX_OUTPUT_TOKENS", 300),
                temperature: 0.3,
                top_p: 0.85,
            },
            data_dir,
        }
    }

    pub fn vector_db_dir(&self) -> PathBuf {
        self.data_dir.join("vector_db")
    }

    pub fn tantivy_dir(&self) -> PathBuf {
        self.data_dir.join("tantivy")
    }

    pub fn index_template_path(&self) -> PathBuf {
        self.templates_dir.join("index.html")
    }

    pub fn sqlite_dsn(&self) -> String {
        format!(
            "sqlite://{}",
            self.data_dir.join("chatbot.sqlite3").display()
        )
    }
}
