//! Model access for the generative extractor.
//!
//! [`create_provider`] turns an [`LlmConfig`] into an `Arc<dyn LlmProvider>`
//! backed by a rig-core client. Nothing outside this module names rig types.

pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::error::LlmError;

/// Hosted model APIs the digest can summarize with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl LlmBackend {
    pub fn name(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }

    /// Environment variable holding this backend's API key.
    pub fn api_key_var(self) -> &'static str {
        match self {
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
        }
    }

    /// Model used when `DIGEST_LLM_MODEL` is unset.
    pub fn default_model(self) -> &'static str {
        match self {
            Self::Anthropic => "claude-sonnet-4-20250514",
            Self::OpenAi => "gpt-4o-mini",
        }
    }
}

impl fmt::Display for LlmBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            other => Err(format!(
                "unknown backend '{other}' (expected anthropic or openai)"
            )),
        }
    }
}

/// Credentials and model choice for the generative strategy.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    pub model: String,
}

/// Build the provider for `config`.
///
/// rig clients accept any key at construction, so a bad key only surfaces
/// on the first completion, where the extractor falls back per message.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::{anthropic, openai};

    let key = config.api_key.expose_secret();
    let provider: Arc<dyn LlmProvider> = match config.backend {
        LlmBackend::Anthropic => {
            let client: rig::client::Client<anthropic::client::AnthropicExt> =
                anthropic::Client::new(key).map_err(|e| client_error(config.backend, e))?;
            Arc::new(RigAdapter::new(
                client.completion_model(&config.model),
                &config.model,
            ))
        }
        LlmBackend::OpenAi => {
            let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
                openai::Client::new(key).map_err(|e| client_error(config.backend, e))?;
            Arc::new(RigAdapter::new(
                client.completion_model(&config.model),
                &config.model,
            ))
        }
    };

    info!(backend = %config.backend, model = %config.model, "Extraction model ready");
    Ok(provider)
}

fn client_error(backend: LlmBackend, e: impl fmt::Display) -> LlmError {
    LlmError::RequestFailed {
        provider: backend.to_string(),
        reason: format!("client setup failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::extract::GenerativeExtractor;

    fn config(backend: LlmBackend, model: &str) -> LlmConfig {
        LlmConfig {
            backend,
            api_key: SecretString::from("test-key"),
            model: model.to_string(),
        }
    }

    // ── Backend selection ───────────────────────────────────────────

    #[test]
    fn backend_names_parse_case_insensitively() {
        assert_eq!("Anthropic".parse::<LlmBackend>(), Ok(LlmBackend::Anthropic));
        assert_eq!(" openai ".parse::<LlmBackend>(), Ok(LlmBackend::OpenAi));
        assert!("gemini".parse::<LlmBackend>().is_err());
    }

    #[test]
    fn each_backend_has_its_own_key_and_model() {
        assert_eq!(LlmBackend::Anthropic.api_key_var(), "ANTHROPIC_API_KEY");
        assert_eq!(LlmBackend::OpenAi.api_key_var(), "OPENAI_API_KEY");
        assert_eq!(LlmBackend::OpenAi.default_model(), "gpt-4o-mini");
        assert_eq!(LlmBackend::OpenAi.to_string(), "openai");
    }

    // ── Provider construction ───────────────────────────────────────

    #[test]
    fn providers_report_the_configured_model() {
        for (backend, model) in [
            (LlmBackend::Anthropic, "claude-haiku-test"),
            (LlmBackend::OpenAi, "gpt-test"),
        ] {
            let provider = create_provider(&config(backend, model)).unwrap();
            assert_eq!(provider.model_name(), model);
        }
    }

    #[test]
    fn provider_plugs_into_generative_extractor() {
        let provider = create_provider(&config(LlmBackend::Anthropic, "claude-haiku-test")).unwrap();
        assert!(GenerativeExtractor::new(provider, &PipelineConfig::default()).is_ok());
    }
}
