//! Guide normalization: arbitrary uploaded bytes in, a complete [`Guide`] out.
//!
//! Tiers run in order until one produces a guide:
//!
//! 1. the bytes already are a serialized guide,
//! 2. the structuring model rewrites the extracted text as guide JSON,
//! 3. the heuristic outline parser reads the extracted text.
//!
//! Text is extracted at most once, right before the first tier that needs it.
//! Nothing in here returns an error to the caller.

pub mod heuristic;
pub mod partial;
pub mod sanitize;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::ingest::TextExtractor;
use crate::llm::{ChatTurn, GenerationRequest, ResponseGenerator};
use crate::models::Guide;

pub use heuristic::parse_outline;
pub use partial::extract_partial_guide;
pub use sanitize::sanitize_json;

const STRUCTURING_TEMPERATURE: f32 = 0.2;

const STRUCTURING_SYSTEM_PROMPT: &str = "You convert report writing guides into JSON. \
Capture every chapter and every section the guide mentions, in order, and copy each \
section's requirements in full detail without summarising. Respond with a single JSON \
object and nothing else, shaped as: {\"title\": string, \"description\": string, \
\"chapters\": [{\"title\": string, \"description\": string, \"sections\": [{\"title\": \
string, \"requirements\": string or list of strings, \"subsections\": [{\"title\": \
string, \"requirements\": string}]}]}]}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuideTier {
    StructuredDocument,
    AssistedStructuring,
    HeuristicOutline,
    Placeholder,
}

impl GuideTier {
    pub fn as_str(self) -> &'static str {
        match self {
            GuideTier::StructuredDocument => "structured_document",
            GuideTier::AssistedStructuring => "assisted_structuring",
            GuideTier::HeuristicOutline => "heuristic_outline",
            GuideTier::Placeholder => "placeholder",
        }
    }
}

/// Input handed to each tier. `text` is `Some` for tiers that asked for it.
pub struct GuideSource<'a> {
    pub bytes: &'a [u8],
    pub text: Option<&'a str>,
}

impl GuideSource<'_> {
    fn require_text(&self) -> Result<&str> {
        self.text.context("tier needs extracted text")
    }
}

#[async_trait]
pub trait GuideStrategy: Send + Sync {
    fn tier(&self) -> GuideTier;

    fn needs_text(&self) -> bool;

    async fn try_parse(&self, source: &GuideSource<'_>) -> Result<Guide>;
}

pub struct StructuredDocument;

#[async_trait]
impl GuideStrategy for StructuredDocument {
    fn tier(&self) -> GuideTier {
        GuideTier::StructuredDocument
    }

    fn needs_text(&self) -> bool {
        false
    }

    async fn try_parse(&self, source: &GuideSource<'_>) -> Result<Guide> {
        let bytes = source
            .bytes
            .strip_prefix(b"\xEF\xBB\xBF")
            .unwrap_or(source.bytes)
            .trim_ascii();
        if !bytes.starts_with(b"{") {
            anyhow::bail!("input is not a JSON object");
        }
        let guide: Guide =
            serde_json::from_slice(bytes).context("input is not a serialized guide")?;
        Ok(guide.complete())
    }
}

pub struct AssistedStructuring {
    generator: Arc<dyn ResponseGenerator>,
    max_tokens: usize,
}

impl AssistedStructuring {
    pub fn new(generator: Arc<dyn ResponseGenerator>, max_tokens: usize) -> Self {
        Self {
            generator,
            max_tokens,
        }
    }
}

#[async_trait]
impl GuideStrategy for AssistedStructuring {
    fn tier(&self) -> GuideTier {
        GuideTier::AssistedStructuring
    }

    fn needs_text(&self) -> bool {
        true
    }

    async fn try_parse(&self, source: &GuideSource<'_>) -> Result<Guide> {
        let text = source.require_text()?;
        let generated = self
            .generator
            .generate(GenerationRequest {
                system: STRUCTURING_SYSTEM_PROMPT.to_string(),
                history: vec![ChatTurn::user(format!(
                    "Structure the following report guide:\n\n{text}"
                ))],
                max_tokens: self.max_tokens,
                temperature: STRUCTURING_TEMPERATURE,
            })
            .await
            .context("structuring model call failed")?;

        if generated.text.trim().is_empty() {
            anyhow::bail!("structuring model returned an empty response");
        }

        let parsed = sanitize_json(&generated.text)
            .and_then(|value| serde_json::from_value::<Guide>(value).ok())
            .filter(|guide| !guide.chapters.is_empty());
        if let Some(guide) = parsed {
            return Ok(guide.complete());
        }

        tracing::warn!("structuring output unparseable; salvaging partial structure");
        extract_partial_guide(&generated.text)
            .context("structuring output has no recoverable chapters")
    }
}

pub struct HeuristicOutline;

#[async_trait]
impl GuideStrategy for HeuristicOutline {
    fn tier(&self) -> GuideTier {
        GuideTier::HeuristicOutline
    }

    fn needs_text(&self) -> bool {
        true
    }

    async fn try_parse(&self, source: &GuideSource<'_>) -> Result<Guide> {
        Ok(parse_outline(source.require_text()?))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Normalized {
    pub guide: Guide,
    pub tier: GuideTier,
}

pub struct GuideNormalizer {
    extractor: Arc<dyn TextExtractor>,
    tiers: Vec<Box<dyn GuideStrategy>>,
}

impl GuideNormalizer {
    /// Full chain. Passing no generator skips the assisted tier.
    pub fn new(
        extractor: Arc<dyn TextExtractor>,
        generator: Option<Arc<dyn ResponseGenerator>>,
        max_tokens: usize,
    ) -> Self {
        let mut tiers: Vec<Box<dyn GuideStrategy>> = vec![Box::new(StructuredDocument)];
        if let Some(generator) = generator {
            tiers.push(Box::new(AssistedStructuring::new(generator, max_tokens)));
        }
        tiers.push(Box::new(HeuristicOutline));
        Self::with_tiers(extractor, tiers)
    }

    pub fn with_tiers(
        extractor: Arc<dyn TextExtractor>,
        tiers: Vec<Box<dyn GuideStrategy>>,
    ) -> Self {
        Self { extractor, tiers }
    }

    pub async fn normalize(&self, bytes: &[u8]) -> Guide {
        self.normalize_with_tier(bytes).await.guide
    }

    pub async fn normalize_with_tier(&self, bytes: &[u8]) -> Normalized {
        let mut text: Option<String> = None;

        for strategy in &self.tiers {
            if strategy.needs_text() && text.is_none() {
                match self.extractor.extract(bytes) {
                    Ok(extracted) if !extracted.trim().is_empty() => text = Some(extracted),
                    Ok(_) => {
                        tracing::warn!("guide text is empty; using placeholder guide");
                        return placeholder();
                    }
                    Err(err) => {
                        tracing::warn!(
                            "guide text extraction failed: {err}; using placeholder guide"
                        );
                        return placeholder();
                    }
                }
            }

            let source = GuideSource {
                bytes,
                text: text.as_deref(),
            };
            match strategy.try_parse(&source).await {
                Ok(guide) => {
                    tracing::info!(
                        tier = strategy.tier().as_str(),
                        chapters = guide.chapters.len(),
                        sections = guide.section_count(),
                        "guide normalized"
                    );
                    return Normalized {
                        guide,
                        tier: strategy.tier(),
                    };
                }
                Err(err) => {
                    tracing::debug!(
                        tier = strategy.tier().as_str(),
                        "guide tier declined: {err:#}"
                    );
                }
            }
        }

        tracing::warn!("no guide tier succeeded; using placeholder guide");
        placeholder()
    }
}

fn placeholder() -> Normalized {
    Normalized {
        guide: Guide::placeholder(),
        tier: GuideTier::Placeholder,
    }
}
