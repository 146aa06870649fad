//! Deterministic paragraph-based extraction.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::config::{ExtractionConfig, PipelineConfig};
use crate::error::ConfigError;
use crate::extract::{
    Extraction, ExtractionInput, ExtractionResult, Extractor, HEURISTIC_STRATEGY, Item,
    PostProcessor, clean_title, first_sentence, first_url, truncate_chars,
};

static PARAGRAPH_BREAK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n[ \t]*\n").unwrap());

/// Chars of a paragraph compared for near-duplicate detection.
const DEDUP_PREFIX_CHARS: usize = 80;

/// Splits canonical text into paragraphs and turns each into an item.
#[derive(Debug, Clone)]
pub struct HeuristicExtractor {
    config: ExtractionConfig,
    post: PostProcessor,
}

impl HeuristicExtractor {
    pub fn new(config: &PipelineConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            config: config.extraction.clone(),
            post: PostProcessor::new(config)?,
        })
    }

    /// Synchronous core of [`Extractor::extract`].
    pub fn extract_text(&self, subject: &str, text: &str) -> ExtractionResult {
        let lines: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();

        let overview = if lines.is_empty() {
            truncate_chars(subject, self.config.overview_max_chars)
        } else {
            truncate_chars(
                &lines
                    .iter()
                    .take(self.config.overview_lines)
                    .copied()
                    .collect::<Vec<_>>()
                    .join(" "),
                self.config.overview_max_chars,
            )
        };

        let mut items = self.paragraph_items(text);
        if items.is_empty() {
            items = lines
                .iter()
                .take(self.config.fallback_lines)
                .map(|line| Item {
                    title: clean_title(&truncate_chars(line, self.config.title_max_chars)),
                    summary: truncate_chars(line, self.config.fallback_summary_max_chars),
                    full_text: (*line).to_string(),
                    link: first_url(line),
                })
                .collect();
        }

        self.post.finish(ExtractionResult { overview, items })
    }

    fn paragraph_items(&self, text: &str) -> Vec<Item> {
        let mut seen = HashSet::new();
        PARAGRAPH_BREAK
            .split(text)
            .map(|block| {
                block
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .filter(|p| p.chars().count() >= self.config.min_paragraph_chars)
            .filter(|p| !self.post.is_boilerplate(p))
            .filter(|p| {
                let prefix: String = p.chars().take(DEDUP_PREFIX_CHARS).collect();
                seen.insert(prefix.to_lowercase())
            })
            .take(self.config.max_paragraphs)
            .map(|p| Item {
                title: clean_title(&first_sentence(&p, self.config.title_max_chars)),
                summary: first_sentence(&p, self.config.summary_max_chars),
                link: first_url(&p),
                full_text: p,
            })
            .collect()
    }
}

#[async_trait]
impl Extractor for HeuristicExtractor {
    async fn extract(&self, input: &ExtractionInput<'_>) -> Extraction {
        Extraction {
            result: self.extract_text(input.subject, input.text),
            strategy: HEURISTIC_STRATEGY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> HeuristicExtractor {
        HeuristicExtractor::new(&PipelineConfig::default()).unwrap()
    }

    const STORY_A: &str = "Rust 1.80 ships LazyLock in the standard library. \
        This removes the need for once_cell in many crates [link: https://blog.rust-lang.org/a]";
    const STORY_B: &str = "The borrow checker got smarter about closures this quarter. \
        Several long-standing false positives are gone.";

    #[test]
    fn paragraphs_become_items() {
        let text = format!("Weekly Rust digest\n\n{STORY_A}\n\n{STORY_B}");
        let result = extractor().extract_text("Digest", &text);

        assert_eq!(result.items.len(), 2);
        let first = &result.items[0];
        assert_eq!(first.title, "Rust 1.80 ships LazyLock in the standard library.");
        assert_eq!(first.link.as_deref(), Some("https://blog.rust-lang.org/a"));
        assert!(first.full_text.contains("once_cell"));
        assert!(result.overview.starts_with("Weekly Rust digest"));
    }

    #[test]
    fn near_duplicate_paragraphs_are_skipped() {
        let text = format!("{STORY_B}\n\n{STORY_B} Extra tail sentence here.");
        let result = extractor().extract_text("s", &text);
        assert_eq!(result.items.len(), 1);
    }

    #[test]
    fn boilerplate_paragraphs_are_skipped() {
        let footer = "You received this because you signed up. Update your preferences or read our privacy policy.";
        let text = format!("{STORY_B}\n\n{footer}");
        let result = extractor().extract_text("s", &text);
        assert_eq!(result.items.len(), 1);
    }

    #[test]
    fn short_text_falls_back_to_lines() {
        let result = extractor().extract_text("s", "Short one\nShort two\nShort three\nFour\nFive");
        assert_eq!(result.items.len(), 4);
        assert_eq!(result.items[0].title, "Short one");
        assert_eq!(result.items[3].full_text, "Four");
    }

    #[test]
    fn empty_text_uses_subject_as_overview() {
        let result = extractor().extract_text("Monthly update", "");
        assert_eq!(result.overview, "Monthly update");
        assert!(result.items.is_empty());
    }

    #[test]
    fn paragraph_count_is_bounded() {
        let text = (0..20)
            .map(|i| format!("Paragraph number {i} has enough words in it to count as a real story."))
            .collect::<Vec<_>>()
            .join("\n\n");
        let result = extractor().extract_text("s", &text);
        assert_eq!(result.items.len(), 8);
    }

    #[test]
    fn output_is_deterministic() {
        let text = format!("{STORY_A}\n\n{STORY_B}");
        let e = extractor();
        assert_eq!(e.extract_text("s", &text), e.extract_text("s", &text));
    }
}
