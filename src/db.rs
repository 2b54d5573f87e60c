use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};

use crate::config::AppConfig;
use crate::models::{Chunk, ChunkKind, IngestManifest, IngestMode, IngestStatus};

const CHUNK_COLUMNS: &str = "id, ordinal, content, kind, char_count, source_hash";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let options = SqliteConnectOptions::from_str(&config.sqlite_dsn())?.create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                ordinal INTEGER NOT NULL,
                content TEXT NOT NULL,
                kind TEXT NOT NULL,
                char_count INTEGER NOT NULL,
                source_hash TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS manifests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pdf_hash TEXT NOT NULL,
                mode TEXT NOT NULL,
                embedding_model TEXT NOT NULL,
                created_at TEXT NOT NULL,
                chunk_count INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ingest_jobs (
                job_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                stage TEXT NOT NULL,
                message TEXT,
                chunk_count INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Adds a chunk set next to whatever is already stored.
    pub async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            insert_chunk_tx(&mut tx, chunk).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Deletes every chunk whose id is not in `keep`.
    pub async fn retain_chunks(&self, keep: &[String]) -> Result<u64> {
        if keep.is_empty() {
            let done = sqlx::query("DELETE FROM chunks").execute(&self.pool).await?;
            return Ok(done.rows_affected());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM chunks WHERE id NOT IN (");
        let mut separated = qb.separated(",");
        for id in keep {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let done = qb.build().execute(&self.pool).await?;
        Ok(done.rows_affected())
    }

    pub async fn delete_chunks(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM chunks WHERE id IN (");
        let mut separated = qb.separated(",");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    pub async fn chunk_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    pub async fn get_chunk(&self, chunk_id: &str) -> Result<Option<Chunk>> {
        let row = sqlx::query(&format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?"))
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(row_to_chunk))
    }

    /// Returns the chunks in the order of `ids`; unknown ids are skipped.
    pub async fn get_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id IN ("));
        let mut separated = qb.separated(",");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows: Vec<SqliteRow> = qb.build().fetch_all(&self.pool).await?;
        let mut chunks: Vec<Chunk> = rows.into_iter().map(row_to_chunk).collect();

        chunks.sort_by_key(|chunk| {
            ids.iter()
                .position(|id| id == &chunk.id)
                .unwrap_or(usize::MAX)
        });

        Ok(chunks)
    }

    pub async fn record_manifest(&self, manifest: &IngestManifest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO manifests (pdf_hash, mode, embedding_model, created_at, chunk_count)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&manifest.pdf_hash)
        .bind(manifest.mode.as_str())
        .bind(&manifest.embedding_model)
        .bind(manifest.created_at.to_rfc3339())
        .bind(manifest.chunk_count)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn latest_manifest(&self) -> Result<Option<IngestManifest>> {
        let row = sqlx::query(
            r#"
            SELECT pdf_hash, mode, embedding_model, created_at, chunk_count
            FROM manifests
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| IngestManifest {
            pdf_hash: r.get("pdf_hash"),
            mode: match r.get::<String, _>("mode").as_str() {
                "qa-pairs" => IngestMode::QaPairs,
                _ => IngestMode::Chunks,
            },
            embedding_model: r.get("embedding_model"),
            created_at: parse_timestamp(&r.get::<String, _>("created_at")),
            chunk_count: r.get("chunk_count"),
        }))
    }

    pub async fn upsert_ingest_status(&self, status: &IngestStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_jobs (job_id, status, stage, message, chunk_count, started_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                status = excluded.status,
                stage = excluded.stage,
                message = excluded.message,
                chunk_count = excluded.chunk_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&status.job_id)
        .bind(&status.status)
        .bind(&status.stage)
        .bind(&status.message)
        .bind(status.chunk_count)
        .bind(status.started_at.to_rfc3339())
        .bind(status.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_ingest_status(&self, job_id: &str) -> Result<Option<IngestStatus>> {
        let row = sqlx::query(
            r#"
            SELECT job_id, status, stage, message, chunk_count, started_at, updated_at
            FROM ingest_jobs
            WHERE job_id = ?
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| IngestStatus {
            job_id: r.get("job_id"),
            status: r.get("status"),
            stage: r.get("stage"),
            message: r.get("message"),
            chunk_count: r.get("chunk_count"),
            started_at: parse_timestamp(&r.get::<String, _>("started_at")),
            updated_at: parse_timestamp(&r.get::<String, _>("updated_at")),
        }))
    }
}

async fn insert_chunk_tx(tx: &mut Transaction<'_, Sqlite>, chunk: &Chunk) -> Result<()> {
    sqlx::query(&format!(
        "INSERT INTO chunks ({CHUNK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)"
    ))
    .bind(&chunk.id)
    .bind(chunk.ordinal)
    .bind(&chunk.content)
    .bind(chunk.kind.as_str())
    .bind(chunk.char_count)
    .bind(&chunk.source_hash)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn row_to_chunk(row: SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        ordinal: row.get("ordinal"),
        content: row.get("content"),
        kind: ChunkKind::from_db(&row.get::<String, _>("kind")),
        char_count: row.get("char_count"),
        source_hash: row.get("source_hash"),
    }
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
