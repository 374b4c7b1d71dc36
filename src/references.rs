use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, Schema, Value, STORED, STRING, TEXT};
use tantivy::{doc, Index, TantivyDocument};
use walkdir::WalkDir;

const PASSAGE_TARGET_CHARS: usize = 1_200;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Reference {
    pub source: String,
    pub title: String,
    pub excerpt: String,
    pub score: f32,
}

/// Source lookup used while drafting. Failures are recovered by the caller.
#[async_trait]
pub trait ReferenceSearch: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Reference>>;
}

/// Used when no reference library is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReferenceSearch;

#[async_trait]
impl ReferenceSearch for NoReferenceSearch {
    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<Reference>> {
        Ok(vec![])
    }
}

/// BM25 index over a directory of `.txt` / `.md` files, one document per
/// passage.
#[derive(Clone)]
pub struct ReferenceLibrary {
    index_dir: PathBuf,
}

#[derive(Clone, Copy)]
struct LibraryFields {
    source: Field,
    title: Field,
    content: Field,
}

impl ReferenceLibrary {
    pub fn new(index_dir: PathBuf) -> Self {
        Self { index_dir }
    }

    /// Re-indexes every text file under `source_dir`. Returns the number of
    /// passages written.
    pub fn rebuild(&self, source_dir: &Path) -> Result<usize> {
        if self.index_dir.exists() {
            std::fs::remove_dir_all(&self.index_dir)?;
        }
        std::fs::create_dir_all(&self.index_dir)?;

        let (schema, fields) = build_schema();
        let index = Index::create_in_dir(&self.index_dir, schema)?;
        let mut writer = index.writer(50_000_000)?;
        let mut passages = 0usize;

        for entry in WalkDir::new(source_dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file() && is_reference_file(entry.path()))
        {
            let path = entry.path();
            let text = match std::fs::read_to_string(path) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!("skipping unreadable reference {}: {}", path.display(), err);
                    continue;
                }
            };
            let title = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().replace(['_', '-'], " "))
                .unwrap_or_default();
            let source = path
                .strip_prefix(source_dir)
                .unwrap_or(path)
                .display()
                .to_string();

            for passage in split_passages(&text) {
                writer.add_document(doc!(
                    fields.source => source.clone(),
                    fields.title => title.clone(),
                    fields.content => passage,
                ))?;
                passages += 1;
            }
        }

        writer.commit()?;
        tracing::info!(
            passages,
            "reference library indexed from {}",
            source_dir.display()
        );
        Ok(passages)
    }

    pub fn search_blocking(&self, query: &str, limit: usize) -> Result<Vec<Reference>> {
        if !self.index_dir.exists() || query.trim().is_empty() {
            return Ok(vec![]);
        }

        let index = Index::open_in_dir(&self.index_dir)?;
        let fields = resolve_fields(&index.schema())?;
        let reader = index.reader()?;
        let searcher = reader.searcher();

        let query_parser = QueryParser::for_index(&index, vec![fields.content, fields.title]);
        let (query, _errors) = query_parser.parse_query_lenient(query);
        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

        let mut out = Vec::with_capacity(top_docs.len());
        for (score, addr) in top_docs {
            let doc = searcher.doc::<TantivyDocument>(addr)?;
            let text = |field: Field| {
                doc.get_first(field)
                    .and_then(|value| value.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            out.push(Reference {
                source: text(fields.source),
                title: text(fields.title),
                excerpt: text(fields.content),
                score,
            });
        }

        Ok(out)
    }
}

#[async_trait]
impl ReferenceSearch for ReferenceLibrary {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Reference>> {
        let library = self.clone();
        let query = query.to_string();
        tokio::task::spawn_blocking(move || library.search_blocking(&query, limit))
            .await
            .context("reference search task panicked")?
    }
}

fn is_reference_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "txt" | "md"))
        .unwrap_or(false)
}

/// Groups blank-line separated paragraphs into passages of roughly
/// `PASSAGE_TARGET_CHARS`.
fn split_passages(text: &str) -> Vec<String> {
    let mut passages = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if !current.is_empty() && current.len() + paragraph.len() > PASSAGE_TARGET_CHARS {
            passages.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        passages.push(current);
    }

    passages
}

fn build_schema() -> (Schema, LibraryFields) {
    let mut builder = Schema::builder();

    let source = builder.add_text_field("source", STRING | STORED);
    let title = builder.add_text_field("title", TEXT | STORED);
    let content = builder.add_text_field("content", TEXT | STORED);

    (
        builder.build(),
        LibraryFields {
            source,
            title,
            content,
        },
    )
}

fn resolve_fields(schema: &Schema) -> Result<LibraryFields> {
    let field = |name: &str| {
        schema
            .get_field(name)
            .map_err(|err| anyhow::anyhow!(err.to_string()))
    };
    Ok(LibraryFields {
        source: field("source")?,
        title: field("title")?,
        content: field("content")?,
    })
}
