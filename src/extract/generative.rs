//! LLM-backed extraction with heuristic fallback.
//!
//! Flow:
//! 1. Build a bounded prompt (body truncated to `prompt_max_chars`)
//! 2. One completion call under a hard timeout, no retry
//! 3. Parse the first balanced JSON object and validate required keys
//! 4. Any failure → warn and return the heuristic result instead

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{ExtractionConfig, PipelineConfig};
use crate::error::{ConfigError, LlmError};
use crate::extract::{
    Extraction, ExtractionInput, ExtractionResult, Extractor, GENERATIVE_STRATEGY,
    HeuristicExtractor, Item, PostProcessor, first_url,
};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};

/// Asks an LLM for `{overview, items[]}`.
///
/// Owns a [`HeuristicExtractor`] and answers with it whenever the model
/// path fails, so `extract` always produces a usable result.
pub struct GenerativeExtractor {
    llm: Arc<dyn LlmProvider>,
    fallback: HeuristicExtractor,
    post: PostProcessor,
    config: ExtractionConfig,
}

impl GenerativeExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>, config: &PipelineConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            llm,
            fallback: HeuristicExtractor::new(config)?,
            post: PostProcessor::new(config)?,
            config: config.extraction.clone(),
        })
    }

    async fn generate(&self, input: &ExtractionInput<'_>) -> Result<ExtractionResult, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt(self.config.max_items)),
            ChatMessage::user(build_user_prompt(input, self.config.prompt_max_chars)),
        ])
        .with_temperature(self.config.llm_temperature)
        .with_max_tokens(self.config.llm_max_tokens);

        let provider = self.llm.model_name().to_string();
        let response = tokio::time::timeout(self.config.llm_timeout, self.llm.complete(request))
            .await
            .map_err(|_| LlmError::Timeout {
                provider: provider.clone(),
                timeout: self.config.llm_timeout,
            })??;
        debug!(
            key = %input.key,
            model = %provider,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Extraction completion received"
        );

        let parsed = parse_extraction_response(&response.content).map_err(|reason| {
            debug!(raw_response = %response.content, "Unparsable extraction response");
            LlmError::InvalidResponse {
                provider: provider.clone(),
                reason,
            }
        })?;

        let result = self.post.finish(parsed);
        if result.items.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider,
                reason: "no items left after cleanup".into(),
            });
        }
        Ok(result)
    }
}

#[async_trait]
impl Extractor for GenerativeExtractor {
    async fn extract(&self, input: &ExtractionInput<'_>) -> Extraction {
        match self.generate(input).await {
            Ok(result) => Extraction {
                result,
                strategy: GENERATIVE_STRATEGY,
            },
            Err(e) => {
                warn!(
                    key = %input.key,
                    model = %self.llm.model_name(),
                    error = %e,
                    "Generative extraction failed, using heuristic"
                );
                self.fallback.extract(input).await
            }
        }
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt(max_items: usize) -> String {
    format!(
        "You extract the individual stories from an email newsletter.\n\n\
         Respond with ONLY a JSON object:\n\
         {{\"overview\": \"...\", \"items\": [{{\"title\": \"...\", \"summary\": \"...\", \"full_text\": \"...\", \"link\": \"https://...\"}}]}}\n\n\
         Rules:\n\
         - Write in the language of the newsletter\n\
         - overview: 1-3 sentences on what this issue covers\n\
         - At most {max_items} items, in the order they appear\n\
         - title: the story's real headline. Never \"Item 1\", \"Untitled\" or similar\n\
         - summary: 1-2 sentences\n\
         - link: the story's URL if the text has one, otherwise null\n\
         - Skip unsubscribe, preference and legal footers"
    )
}

fn build_user_prompt(input: &ExtractionInput<'_>, max_chars: usize) -> String {
    let body: String = input.text.chars().take(max_chars).collect();
    let mut prompt = String::with_capacity(body.len() + 256);
    prompt.push_str(&format!("From: {}\n", input.sender));
    prompt.push_str(&format!("Subject: {}\n", input.subject));
    prompt.push_str(&format!("\nNewsletter:\n{body}"));
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    overview: String,
    items: Vec<ItemResponse>,
}

#[derive(Debug, Deserialize)]
struct ItemResponse {
    title: String,
    summary: String,
    #[serde(default)]
    full_text: Option<String>,
    #[serde(default)]
    link: Option<String>,
}

/// Parse a model response into an `ExtractionResult`.
fn parse_extraction_response(raw: &str) -> Result<ExtractionResult, String> {
    let json = extract_json_object(raw).ok_or("no JSON object in response")?;
    let response: ExtractionResponse =
        serde_json::from_str(json).map_err(|e| format!("JSON parse error: {e}"))?;

    if response.items.is_empty() {
        return Err("response has no items".into());
    }

    let items = response
        .items
        .into_iter()
        .map(|item| {
            let full_text = item
                .full_text
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| item.summary.clone());
            let link = item
                .link
                .and_then(|l| first_url(&l))
                .or_else(|| first_url(&full_text));
            Item {
                title: item.title.trim().to_string(),
                summary: item.summary.trim().to_string(),
                full_text: full_text.trim().to_string(),
                link,
            }
        })
        .collect();

    Ok(ExtractionResult {
        overview: response.overview.trim().to_string(),
        items,
    })
}

/// First balanced `{...}` in `text`, aware of strings and escapes.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
