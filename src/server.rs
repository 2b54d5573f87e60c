use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use askama::Template;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::{AppConfig, DEFAULT_NO_ANSWER_MSG};
use crate::db::Database;
use crate::ingest::Ingestor;
use crate::models::{AskRequest, AskResponse, Chunk, IngestRequest, IngestResponse, IngestStatus};
use crate::query::QueryEngine;

type JobTable = Arc<Mutex<HashMap<String, IngestStatus>>>;

#[derive(Clone)]
struct AppState {
    config: AppConfig,
    db: Database,
    engine: QueryEngine,
    ingestor: Ingestor,
    jobs: JobTable,
}

impl AppState {
    fn new(config: AppConfig, db: Database, engine: QueryEngine, ingestor: Ingestor) -> Self {
        Self {
            config,
            db,
            engine,
            ingestor,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Binds the listener and returns it together with the address actually
/// bound, so callers can announce the server only once it is reachable.
pub async fn bind(config: &AppConfig) -> Result<(TcpListener, SocketAddr)> {
    let addr: SocketAddr = config.bind_addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    Ok((listener, local))
}

pub async fn run_server(
    listener: TcpListener,
    config: AppConfig,
    db: Database,
    engine: QueryEngine,
    ingestor: Ingestor,
) -> Result<()> {
    let state = AppState::new(config, db, engine, ingestor);

    let app = Router::new()
        .route("/", get(index_page))
        .route("/ask", post(ask_question))
        .route("/api/ingest", post(start_ingest))
        .route("/api/ingest/:job_id", get(get_ingest_status))
        .route("/api/sources/:chunk_id", get(get_source))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Template)]
#[template(path = "chat.html")]
pub struct IndexTemplate<'a> {
    pub title: &'a str,
    pub greeting: &'a str,
    pub error_message: &'a str,
}

impl Default for IndexTemplate<'_> {
    fn default() -> Self {
        Self {
            title: "روبوت الأسئلة الشائعة للمكتبات الوقفية",
            greeting: "مرحبًا! كيف يمكنني مساعدتك اليوم؟",
            error_message: "عذرًا، حدث خطأ في معالجة سؤالك.",
        }
    }
}

/// Serves `templates/index.html` when setup or an operator has written it,
/// otherwise the built-in page.
async fn index_page(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    let path = state.config.index_template_path();
    match tokio::fs::read_to_string(&path).await {
        Ok(body) => return Ok(Html(body)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!("failed reading {}: {}", path.display(), err),
    }

    let body = IndexTemplate::default().render()?;
    Ok(Html(body))
}

async fn ask_question(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Json<AskResponse> {
    if request.question.trim().is_empty() {
        return Json(AskResponse {
            answer: DEFAULT_NO_ANSWER_MSG.to_string(),
        });
    }

    let answer = match state.engine.answer_question(&request.question).await {
        Ok(answer) => answer,
        Err(err) => {
            tracing::error!("error processing question: {err:#}");
            DEFAULT_NO_ANSWER_MSG.to_string()
        }
    };

    Json(AskResponse { answer })
}

async fn start_ingest(
    State(state): State<AppState>,
    Json(mut request): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, ApiError> {
    if let Some(requested) = request.pdf_path.take() {
        let resolved = resolve_pdf_path(&state.config.data_dir, &requested).await?;
        request.pdf_path = Some(resolved.to_string_lossy().into_owned());
    }

    let job_id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let queued = IngestStatus {
        job_id: job_id.clone(),
        status: "started".to_string(),
        stage: "queued".to_string(),
        message: None,
        chunk_count: 0,
        started_at: now,
        updated_at: now,
    };
    state.db.upsert_ingest_status(&queued).await?;
    track_job(&state.jobs, queued);

    let ingestor = state.ingestor.clone();
    let jobs = state.jobs.clone();
    let task_job_id = job_id.clone();
    tokio::spawn(async move {
        // The ingestor records failures in SQLite itself.
        let outcome = ingestor
            .ingest(&task_job_id, request, |status| track_job(&jobs, status))
            .await;
        if let Ok(result) = outcome {
            tracing::info!(
                "ingest job {} finished (skipped={}, chunks={})",
                task_job_id,
                result.skipped,
                result.chunk_count
            );
        }
        if let Ok(mut jobs) = jobs.lock() {
            jobs.remove(&task_job_id);
        }
    });

    Ok(Json(IngestResponse {
        job_id,
        status: "started".to_string(),
    }))
}

/// Keeps running jobs in memory; finished ones are served from SQLite.
fn track_job(jobs: &JobTable, status: IngestStatus) {
    let Ok(mut jobs) = jobs.lock() else {
        return;
    };
    if status.is_terminal() {
        jobs.remove(&status.job_id);
    } else {
        jobs.insert(status.job_id.clone(), status);
    }
}

/// Resolves a requested PDF against `data_dir`. Anything that does not name
/// an existing file inside it is refused with the same message.
async fn resolve_pdf_path(data_dir: &FsPath, requested: &str) -> Result<PathBuf, ApiError> {
    let root = tokio::fs::canonicalize(data_dir)
        .await
        .map_err(|err| anyhow::anyhow!("data directory {} unavailable: {err}", data_dir.display()))?;
    let refused = || {
        ApiError::bad_request(format!(
            "pdf_path must name an existing file inside {}",
            data_dir.display()
        ))
    };

    let resolved = tokio::fs::canonicalize(root.join(requested))
        .await
        .map_err(|_| refused())?;
    let is_file = tokio::fs::metadata(&resolved)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false);
    if !resolved.starts_with(&root) || !is_file {
        return Err(refused());
    }
    Ok(resolved)
}

async fn get_ingest_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<IngestStatus>, ApiError> {
    let cached = state
        .jobs
        .lock()
        .map_err(|_| ApiError::from(anyhow::anyhow!("lock poisoned")))?
        .get(&job_id)
        .cloned();
    if let Some(status) = cached {
        return Ok(Json(status));
    }

    match state.db.get_ingest_status(&job_id).await? {
        Some(status) => Ok(Json(status)),
        None => Err(ApiError::not_found(format!("ingest job not found: {}", job_id))),
    }
}

async fn get_source(
    State(state): State<AppState>,
    Path(chunk_id): Path<String>,
) -> Result<Json<Chunk>, ApiError> {
    match state.db.get_chunk(&chunk_id).await? {
        Some(chunk) => Ok(Json(chunk)),
        None => Err(ApiError::not_found(format!("chunk not found: {}", chunk_id))),
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{value:#}"),
        }
    }
}

impl From<askama::Error> for ApiError {
    fn from(value: askama::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: value.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}
