pub mod config;
pub mod db;
pub mod ingest;
pub mod models;
pub mod ollama;
pub mod query;
pub mod retrieval;
pub mod server;
pub mod setup;
pub mod tantivy_store;
pub mod vector_store;

#[cfg(test)]
mod test_support;

pub use config::AppConfig;
pub use server::run_server;

use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
