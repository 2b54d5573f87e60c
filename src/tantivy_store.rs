use std::path::PathBuf;

use anyhow::Result;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, Schema, Value, STORED, STRING, TEXT};
use tantivy::{doc, Index, TantivyDocument};

use crate::models::Chunk;

/// BM25 index over chunk content, rebuilt from scratch on every ingest.
#[derive(Clone)]
pub struct TantivyStore {
    index_dir: PathBuf,
}

#[derive(Clone, Copy)]
struct TantivyFields {
    chunk_id: Field,
    content: Field,
}

impl TantivyStore {
    pub fn new(index_dir: PathBuf) -> Self {
        Self { index_dir }
    }

    pub fn rebuild(&self, chunks: &[Chunk]) -> Result<()> {
        if self.index_dir.exists() {
            std::fs::remove_dir_all(&self.index_dir)?;
        }
        std::fs::create_dir_all(&self.index_dir)?;

        let (schema, fields) = build_schema();
        let index = Index::create_in_dir(&self.index_dir, schema)?;
        let mut writer = index.writer(50_000_000)?;

        for chunk in chunks {
            writer.add_document(doc!(
                fields.chunk_id => chunk.id.clone(),
                fields.content => chunk.content.clone(),
            ))?;
        }

        writer.commit()?;
        Ok(())
    }

    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<(String, f32)>> {
        if limit == 0 || query.trim().is_empty() || !self.index_dir.exists() {
            return Ok(vec![]);
        }

        let index = Index::open_in_dir(&self.index_dir)?;
        let fields = resolve_fields(&index.schema())?;
        let reader = index.reader()?;
        let searcher = reader.searcher();

        // Free-form questions contain ':' and quotes; take whatever parses.
        let query_parser = QueryParser::for_index(&index, vec![fields.content]);
        let (query, _errors) = query_parser.parse_query_lenient(query);
        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

        let mut out = Vec::with_capacity(top_docs.len());
        for (score, addr) in top_docs {
            let doc = searcher.doc::<TantivyDocument>(addr)?;
            if let Some(chunk_id) = doc
                .get_first(fields.chunk_id)
                .and_then(|value| value.as_str())
            {
                out.push((chunk_id.to_string(), score));
            }
        }

        Ok(out)
    }
}

fn build_schema() -> (Schema, TantivyFields) {
    let mut builder = Schema::builder();

    let chunk_id = builder.add_text_field("chunk_id", STRING | STORED);
    let content = builder.add_text_field("content", TEXT);

    (builder.build(), TantivyFields { chunk_id, content })
}

fn resolve_fields(schema: &Schema) -> Result<TantivyFields> {
    Ok(TantivyFields {
        chunk_id: schema
            .get_field("chunk_id")
            .map_err(|err| anyhow::anyhow!(err.to_string()))?,
        content: schema
            .get_field("content")
            .map_err(|err| anyhow::anyhow!(err.to_string()))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkKind;

    fn chunk(id: &str, content: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            ordinal: 0,
            content: content.to_string(),
            kind: ChunkKind::PdfText,
            char_count: content.chars().count() as i64,
            source_hash: "h".to_string(),
        }
    }

    #[test]
    fn arabic_terms_are_searchable() {
        let dir = tempfile::tempdir().unwrap();
        let store = TantivyStore::new(dir.path().join("tantivy"));
        store
            .rebuild(&[
                chunk("hours", "ساعات العمل من الثامنة صباحا"),
                chunk("loans", "الإعارة مجانية لجميع الأعضاء"),
            ])
            .unwrap();

        let hits = store.search("هل الإعارة مجانية؟", 5).unwrap();
        assert_eq!(hits[0].0, "loans");
    }

    #[test]
    fn missing_index_yields_no_hits() {
        let dir = tempfile::tempdir().unwrap();
        let store = TantivyStore::new(dir.path().join("absent"));
        assert!(store.search("سؤال", 3).unwrap().is_empty());
    }
}
