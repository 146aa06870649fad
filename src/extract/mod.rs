//! Item extraction: canonical text → `{overview, items[]}`.
//!
//! Two strategies implement [`Extractor`]:
//! - [`HeuristicExtractor`]: deterministic paragraph splitting, always available
//! - [`GenerativeExtractor`]: asks an `LlmProvider` for structured JSON and
//!   falls back to the heuristic on any failure
//!
//! Both run their output through the same [`PostProcessor`].

pub mod generative;
pub mod heuristic;

pub use generative::GenerativeExtractor;
pub use heuristic::HeuristicExtractor;

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{PipelineConfig, compile_patterns};
use crate::error::ConfigError;
use crate::pipeline::types::MessageKey;

/// One summarizable item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub title: String,
    pub summary: String,
    pub full_text: String,
    pub link: Option<String>,
}

/// Output of an extraction strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub overview: String,
    pub items: Vec<Item>,
}

/// Everything an extractor may look at for one message.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionInput<'a> {
    pub key: &'a MessageKey,
    pub subject: &'a str,
    pub sender: &'a str,
    pub text: &'a str,
    pub markup: &'a str,
}

/// Name recorded for results produced by [`HeuristicExtractor`].
pub const HEURISTIC_STRATEGY: &str = "heuristic";
/// Name recorded for results produced by the model in [`GenerativeExtractor`].
pub const GENERATIVE_STRATEGY: &str = "generative";

/// A result together with the strategy that actually produced it.
///
/// A generative extractor that fell back reports the heuristic here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub result: ExtractionResult,
    pub strategy: &'static str,
}

/// An extraction strategy. Never fails: strategies recover internally.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, input: &ExtractionInput<'_>) -> Extraction;
}

// ── Post-pass ───────────────────────────────────────────────────────

static PLACEHOLDER_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(item|article|section|story|news|untitled|no title|title|položka|článek|clanek|sekce|zpráva|bez názvu)?\s*(#|no\.?|č\.)?\s*\d*\s*[.:)-]?\s*$",
    )
    .unwrap()
});

static LINK_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\[link: [^\]]*\]").unwrap());

static ABSOLUTE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"'\)\]]+"#).unwrap());

/// Cleanup shared by every strategy.
#[derive(Debug, Clone)]
pub struct PostProcessor {
    phrases: Vec<Regex>,
    item_boilerplate: Vec<Regex>,
    max_items: usize,
    title_max_chars: usize,
}

impl PostProcessor {
    pub fn new(config: &PipelineConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            phrases: compile_patterns(&config.normalizer.boilerplate_patterns)?,
            item_boilerplate: compile_patterns(&config.extraction.item_boilerplate_patterns)?,
            max_items: config.extraction.max_items,
            title_max_chars: config.extraction.title_max_chars,
        })
    }

    /// Whether `text` looks like footer noise.
    pub fn is_boilerplate(&self, text: &str) -> bool {
        self.item_boilerplate.iter().any(|re| re.is_match(text))
    }

    /// Strip phrases, repair placeholder titles, drop noise and empty items, cap.
    pub fn finish(&self, result: ExtractionResult) -> ExtractionResult {
        let overview = self.strip(&result.overview);
        let items = result
            .items
            .into_iter()
            .filter_map(|item| self.finish_item(item))
            .take(self.max_items)
            .collect();
        ExtractionResult { overview, items }
    }

    fn finish_item(&self, item: Item) -> Option<Item> {
        let summary = self.strip(&item.summary);
        let full_text = self.strip(&item.full_text);
        if summary.is_empty() && full_text.is_empty() {
            return None;
        }
        if self.is_boilerplate(&format!("{summary}\n{full_text}")) {
            return None;
        }

        let mut title = self.strip(&item.title);
        if is_placeholder_title(&title) {
            let source = if summary.is_empty() { &full_text } else { &summary };
            let better = clean_title(&first_sentence(source, self.title_max_chars));
            if !better.is_empty() {
                title = better;
            }
        }

        Some(Item {
            title,
            summary,
            full_text,
            link: item.link.filter(|l| is_absolute_url(l)),
        })
    }

    fn strip(&self, text: &str) -> String {
        let mut out = text.to_string();
        for re in &self.phrases {
            out = re.replace_all(&out, "").into_owned();
        }
        out.lines()
            .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ── Text helpers ────────────────────────────────────────────────────

/// Generic "Item 1" / "Untitled" / empty titles.
pub fn is_placeholder_title(title: &str) -> bool {
    PLACEHOLDER_TITLE.is_match(title)
}

/// First sentence of `text` (terminator included), cut to `max_chars`.
pub fn first_sentence(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    let mut end = text.len();
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\n' {
            end = i;
            break;
        }
        if matches!(c, '.' | '!' | '?' | '…') {
            match chars.peek() {
                Some((_, next)) if next.is_whitespace() => {
                    end = i + c.len_utf8();
                    break;
                }
                None => break,
                _ => {}
            }
        }
    }
    truncate_chars(&text[..end], max_chars)
}

/// At most `max_chars` characters, trailing whitespace trimmed.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars()
        .take(max_chars)
        .collect::<String>()
        .trim()
        .to_string()
}

/// First absolute http(s) URL in `text`, trailing punctuation removed.
pub fn first_url(text: &str) -> Option<String> {
    ABSOLUTE_URL
        .find(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']).to_string())
}

/// Title text without inline link markers.
pub fn clean_title(title: &str) -> String {
    LINK_MARKER.replace_all(title, "").trim().to_string()
}

fn is_absolute_url(link: &str) -> bool {
    let lower = link.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}
