use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::Semaphore;
use tracing_subscriber::EnvFilter;

use report_writer::config::AppConfig;
use report_writer::guide::GuideNormalizer;
use report_writer::ingest::DocumentExtractor;
use report_writer::llm::ResponseGenerator;
use report_writer::ollama::{OllamaClient, OllamaGenerator};

#[derive(Parser, Debug)]
#[command(name = "normalize-guide")]
#[command(about = "Normalize a report guide (JSON, DOCX, PDF or text) into the canonical structure")]
struct Cli {
    path: PathBuf,
    /// Skip the model-assisted structuring tier.
    #[arg(long, default_value_t = false)]
    no_assist: bool,
    /// Print the guide on a single line.
    #[arg(long, default_value_t = false)]
    compact: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = AppConfig::from_env();
    let bytes = tokio::fs::read(&cli.path)
        .await
        .with_context(|| format!("failed to read {}", cli.path.display()))?;

    let generator: Option<Arc<dyn ResponseGenerator>> = if cli.no_assist {
        None
    } else {
        let client = OllamaClient::new(config.ollama_base_url.clone(), config.request_timeout)?;
        Some(Arc::new(OllamaGenerator::new(
            client,
            config.models.structuring_model.clone(),
            Arc::new(Semaphore::new(1)),
        )))
    };

    let normalizer = GuideNormalizer::new(
        Arc::new(DocumentExtractor),
        generator,
        config.tokens.guide_tokens,
    );
    let normalized = normalizer.normalize_with_tier(&bytes).await;

    eprintln!(
        "tier={} chapters={} sections={}",
        normalized.tier.as_str(),
        normalized.guide.chapters.len(),
        normalized.guide.section_count()
    );
    let json = if cli.compact {
        serde_json::to_string(&normalized.guide)?
    } else {
        serde_json::to_string_pretty(&normalized.guide)?
    };
    println!("{json}");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
