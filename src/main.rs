use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tracing_subscriber::EnvFilter;

use report_writer::db::Database;
use report_writer::guide::GuideNormalizer;
use report_writer::ingest::DocumentExtractor;
use report_writer::llm::ResponseGenerator;
use report_writer::ollama::{OllamaClient, OllamaGenerator};
use report_writer::orchestrator::{Collaborators, Orchestrator};
use report_writer::references::{NoReferenceSearch, ReferenceLibrary, ReferenceSearch};
use report_writer::{run_server, AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env();
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let db = Arc::new(Database::new(&config).await?);
    let ollama = OllamaClient::new(config.ollama_base_url.clone(), config.request_timeout)?;

    let generation_limit = Arc::new(Semaphore::new(1));
    let conversation: Arc<dyn ResponseGenerator> = Arc::new(OllamaGenerator::new(
        ollama.clone(),
        config.models.conversation_model.clone(),
        generation_limit.clone(),
    ));
    let structuring: Arc<dyn ResponseGenerator> = Arc::new(OllamaGenerator::new(
        ollama,
        config.models.structuring_model.clone(),
        generation_limit,
    ));

    let references = build_references(&config).await?;

    let normalizer = GuideNormalizer::new(
        Arc::new(DocumentExtractor),
        Some(structuring),
        config.tokens.guide_tokens,
    );
    let orchestrator = Orchestrator::new(
        Collaborators::from_store(db, conversation, references),
        config.tokens.clone(),
    );

    run_server(config, normalizer, orchestrator).await
}

async fn build_references(config: &AppConfig) -> Result<Arc<dyn ReferenceSearch>> {
    let Some(source_dir) = config.reference_dir.clone() else {
        tracing::info!("no reference directory configured; drafting without sources");
        return Ok(Arc::new(NoReferenceSearch));
    };

    let library = ReferenceLibrary::new(config.reference_index_dir());
    let indexer = library.clone();
    let passages = tokio::task::spawn_blocking(move || indexer.rebuild(&source_dir))
        .await
        .context("reference indexing task panicked")??;
    tracing::info!(passages, "reference library indexed");

    Ok(Arc::new(library))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
