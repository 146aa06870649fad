//! Configuration types.
//!
//! `PipelineConfig` carries every phrase list, whitelist and limit the
//! pipeline stages use. It is built once at startup and handed to each
//! stage explicitly. `RunConfig` holds the run-mode switches read from the
//! environment.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};

// ── Normalizer ──────────────────────────────────────────────────────

/// Boilerplate phrases removed from bodies, in order. Case-insensitive regexes.
pub const DEFAULT_BOILERPLATE_PATTERNS: &[&str] = &[
    r"nezobrazuje se vám (newsletter|e-?mail) správně\??",
    r"if you are having trouble viewing this (e-?mail|message)[.,]?",
    r"click here to view in your browser[.,]?",
    r"click here to view[^\n]*",
    r"view (this )?(e-?mail |message )?in (your )?browser:[^\n]*",
    r"view (this )?(e-?mail |message )?in (your )?browser",
    r"zobrazit v (webovém )?prohlížeči",
    r"if you can'?t see (the )?images[^\n]*",
    r"unsubscribe:[^\n]*",
    r"to unsubscribe[^\n]*",
    r"if you no longer wish to receive[^\n]*",
    r"preferences:[^\n]*",
    r"manage your subscription[^\n]*",
    r"local tracking pixel",
];

/// Lines matching any of these are dropped entirely.
pub const DEFAULT_LINE_DROP_PATTERNS: &[&str] = &[
    r"unsubscribe",
    r"odhlásit",
    r"odhlášení",
    r"manage your subscription",
    r"(email|e-mail|notification) preferences",
    r"preferences",
    r"nastavení odběru",
];

/// A line matching any of these starts a quoted reply; it and everything
/// after it is cut.
pub const DEFAULT_QUOTE_CUTOFF_PATTERNS: &[&str] = &[r"^on .* wrote:", r"^dne .* napsal"];

/// Signature openers. Only checked from the second line on.
pub const DEFAULT_SIGNATURE_PATTERNS: &[&str] = &[
    r"^--\s*$",
    r"^s pozdravem",
    r"^děkuji,",
    r"^regards,",
    r"^best,",
];

/// Content normalizer settings.
#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    pub boilerplate_patterns: Vec<String>,
    pub line_drop_patterns: Vec<String>,
    pub quote_cutoff_patterns: Vec<String>,
    pub signature_patterns: Vec<String>,
    /// Non-blank lines shorter than this (in chars) are dropped.
    pub min_line_chars: usize,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            boilerplate_patterns: to_owned(DEFAULT_BOILERPLATE_PATTERNS),
            line_drop_patterns: to_owned(DEFAULT_LINE_DROP_PATTERNS),
            quote_cutoff_patterns: to_owned(DEFAULT_QUOTE_CUTOFF_PATTERNS),
            signature_patterns: to_owned(DEFAULT_SIGNATURE_PATTERNS),
            min_line_chars: 3,
        }
    }
}

// ── Sanitizer ───────────────────────────────────────────────────────

pub const DEFAULT_ALLOWED_TAGS: &[&str] = &[
    "a", "b", "blockquote", "br", "code", "div", "em", "h1", "h2", "h3", "h4", "h5", "h6", "hr",
    "i", "img", "li", "ol", "p", "pre", "span", "strong", "table", "tbody", "td", "th", "thead",
    "tr", "u", "ul",
];

/// Elements removed together with everything inside them.
pub const DEFAULT_DROPPED_TAGS: &[&str] = &[
    "script", "style", "head", "title", "meta", "link", "noscript", "iframe", "frame", "frameset",
    "object", "embed", "applet", "template", "svg", "math", "form", "input", "button", "select",
    "textarea", "base",
];

/// Markup sanitizer whitelist.
#[derive(Debug, Clone)]
pub struct SanitizerConfig {
    pub allowed_tags: BTreeSet<String>,
    /// Allowed attribute names per tag. Tags not listed keep no attributes.
    pub allowed_attributes: BTreeMap<String, BTreeSet<String>>,
    pub dropped_tags: BTreeSet<String>,
    /// Schemes allowed in `href` / `src` values.
    pub allowed_url_schemes: BTreeSet<String>,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        let mut allowed_attributes = BTreeMap::new();
        allowed_attributes.insert("a".to_string(), set(&["href", "title"]));
        allowed_attributes.insert("img".to_string(), set(&["src", "alt", "width", "height"]));
        allowed_attributes.insert("td".to_string(), set(&["colspan", "rowspan"]));
        allowed_attributes.insert("th".to_string(), set(&["colspan", "rowspan"]));

        Self {
            allowed_tags: set(DEFAULT_ALLOWED_TAGS),
            allowed_attributes,
            dropped_tags: set(DEFAULT_DROPPED_TAGS),
            allowed_url_schemes: set(&["http", "https", "mailto"]),
        }
    }
}

// ── Classifier ──────────────────────────────────────────────────────

/// Subjects matching any of these are confirmations / verifications, not digests.
pub const DEFAULT_SUBJECT_EXCLUSIONS: &[&str] = &[
    r"\bconfirm(ation)?\b",
    r"\bverif(y|ication)\b",
    r"\baction required\b",
    r"\bactivate your\b",
    r"\bpotvr(ďte|zení|dit)\b",
    r"\bověř(te|ení|it)\b",
    r"\bvyžadována akce\b",
    r"\baktivuj(te)?\b",
];

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub subject_exclusions: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            subject_exclusions: to_owned(DEFAULT_SUBJECT_EXCLUSIONS),
        }
    }
}

// ── Extraction ──────────────────────────────────────────────────────

/// Paragraphs and items matching any of these are footer noise, not content.
pub const DEFAULT_ITEM_BOILERPLATE_PATTERNS: &[&str] = &[
    r"unsubscribe",
    r"odhlásit",
    r"odhlášení",
    r"manage your subscription",
    r"preferences",
    r"privacy policy",
    r"zásady ochrany osobních údajů",
    r"cookie",
];

/// Limits shared by both extraction strategies.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Hard cap on items in any result.
    pub max_items: usize,
    /// Cap on paragraphs the heuristic turns into items.
    pub max_paragraphs: usize,
    pub min_paragraph_chars: usize,
    pub overview_lines: usize,
    pub overview_max_chars: usize,
    pub title_max_chars: usize,
    pub summary_max_chars: usize,
    /// Lines used verbatim when no paragraph qualifies.
    pub fallback_lines: usize,
    pub fallback_summary_max_chars: usize,
    /// Body chars included in the generative prompt.
    pub prompt_max_chars: usize,
    pub item_boilerplate_patterns: Vec<String>,
    pub llm_timeout: Duration,
    pub llm_max_tokens: u32,
    pub llm_temperature: f32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_items: 12,
            max_paragraphs: 8,
            min_paragraph_chars: 60,
            overview_lines: 3,
            overview_max_chars: 400,
            title_max_chars: 80,
            summary_max_chars: 300,
            fallback_lines: 4,
            fallback_summary_max_chars: 200,
            prompt_max_chars: 6000,
            item_boilerplate_patterns: to_owned(DEFAULT_ITEM_BOILERPLATE_PATTERNS),
            llm_timeout: Duration::from_secs(30),
            llm_max_tokens: 2048,
            llm_temperature: 0.2,
        }
    }
}

/// Everything the pipeline stages need, constructed once per process.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub normalizer: NormalizerConfig,
    pub sanitizer: SanitizerConfig,
    pub classifier: ClassifierConfig,
    pub extraction: ExtractionConfig,
    /// Concurrent extractions per batch.
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            normalizer: NormalizerConfig::default(),
            sanitizer: SanitizerConfig::default(),
            classifier: ClassifierConfig::default(),
            extraction: ExtractionConfig::default(),
            workers: 4,
        }
    }
}

// ── Run mode ────────────────────────────────────────────────────────

/// What to do with a sender that is not in the priority table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnresolvedPolicy {
    /// Drop the message.
    Drop,
    /// Keep it with the given priority.
    AssignDefault(i32),
    /// Keep it with the given priority and mark it as forced in the audit trail.
    ForceInclude(i32),
}

impl UnresolvedPolicy {
    /// Parse a policy name (`drop`, `default`, `force`) with the default priority.
    pub fn parse(name: &str, default_priority: i32) -> Result<Self, ConfigError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "default" | "assign-default" => Ok(Self::AssignDefault(default_priority)),
            "force" | "force-include" => Ok(Self::ForceInclude(default_priority)),
            other => Err(ConfigError::InvalidValue {
                key: "DIGEST_UNRESOLVED_POLICY".into(),
                message: format!("unknown policy '{other}' (expected drop, default or force)"),
            }),
        }
    }
}

/// Run-mode configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mailbox_dir: PathBuf,
    pub mailbox: String,
    pub since_days: i64,
    pub imap_host: String,
    pub imap_user: String,
    pub imap_password: SecretString,
    pub priority_file: PathBuf,
    pub cache_path: PathBuf,
    pub output_dir: PathBuf,
    pub unresolved_policy: UnresolvedPolicy,
    pub workers: usize,
    pub audit: bool,
    /// `Some` when the generative strategy is enabled and has credentials.
    pub llm: Option<LlmConfig>,
    /// Key variable that was unset when generative extraction was requested.
    /// The run degrades to heuristic extraction and `main` warns about it.
    pub missing_llm_key: Option<&'static str>,
    pub llm_timeout: Duration,
    pub log_dir: Option<PathBuf>,
}

impl RunConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let default_priority: i32 = parse_or(&get, "DIGEST_DEFAULT_PRIORITY", 3)?;
        let unresolved_policy = match get("DIGEST_UNRESOLVED_POLICY") {
            Some(name) => UnresolvedPolicy::parse(&name, default_priority)?,
            None => UnresolvedPolicy::Drop,
        };

        let workers: usize = parse_or(&get, "DIGEST_WORKERS", 4)?;
        if workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DIGEST_WORKERS".into(),
                message: "must be at least 1".into(),
            });
        }

        let llm_timeout = Duration::from_secs(parse_or(&get, "DIGEST_LLM_TIMEOUT_SECS", 30)?);
        let (llm, missing_llm_key) = if parse_flag(&get, "DIGEST_GENERATIVE", false)? {
            match llm_config(&get)? {
                Ok(llm) => (Some(llm), None),
                Err(var) => (None, Some(var)),
            }
        } else {
            (None, None)
        };

        Ok(Self {
            mailbox_dir: get("DIGEST_MAILBOX_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./mail")),
            mailbox: get("DIGEST_MAILBOX").unwrap_or_else(|| "INBOX".to_string()),
            since_days: parse_or(&get, "DIGEST_SINCE_DAYS", 1)?,
            imap_host: get("IMAP_HOST").unwrap_or_default(),
            imap_user: get("IMAP_USER").unwrap_or_default(),
            imap_password: SecretString::from(get("IMAP_PASSWORD").unwrap_or_default()),
            priority_file: get("DIGEST_PRIORITY_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config/priorities.csv")),
            cache_path: get("DIGEST_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/extraction-cache.db")),
            output_dir: get("DIGEST_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./out")),
            unresolved_policy,
            workers,
            audit: parse_flag(&get, "DIGEST_AUDIT", true)?,
            llm,
            missing_llm_key,
            llm_timeout,
            log_dir: get("DIGEST_LOG_DIR").map(PathBuf::from),
        })
    }

    /// Pipeline config with the run-mode overrides applied.
    pub fn pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig {
            workers: self.workers,
            ..PipelineConfig::default()
        };
        config.extraction.llm_timeout = self.llm_timeout;
        config
    }
}

/// Generative settings, or the name of the API key variable that was missing.
fn llm_config<G>(get: &G) -> Result<Result<LlmConfig, &'static str>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let backend: LlmBackend = match get("DIGEST_LLM_BACKEND") {
        Some(name) => name.parse().map_err(|message| ConfigError::InvalidValue {
            key: "DIGEST_LLM_BACKEND".into(),
            message,
        })?,
        None => LlmBackend::Anthropic,
    };

    let Some(api_key) = get(backend.api_key_var()) else {
        return Ok(Err(backend.api_key_var()));
    };

    Ok(Ok(LlmConfig {
        backend,
        api_key: SecretString::from(api_key),
        model: get("DIGEST_LLM_MODEL").unwrap_or_else(|| backend.default_model().to_string()),
    }))
}

fn parse_or<G, T>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(default),
    }
}

fn parse_flag<G>(get: &G, key: &str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "on" | "yes" => Ok(true),
            "0" | "false" | "off" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected on/off, got '{v}'"),
            }),
        },
    }
}

/// Compile a configured pattern list, case-insensitive.
pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| ConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })
        })
        .collect()
}

fn to_owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let config = RunConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.mailbox, "INBOX");
        assert_eq!(config.unresolved_policy, UnresolvedPolicy::Drop);
        assert_eq!(config.workers, 4);
        assert!(config.audit);
        assert!(config.llm.is_none());
        assert_eq!(config.llm_timeout, Duration::from_secs(30));
    }

    #[test]
    fn unresolved_policy_uses_default_priority() {
        let config = RunConfig::from_lookup(lookup(&[
            ("DIGEST_UNRESOLVED_POLICY", "force"),
            ("DIGEST_DEFAULT_PRIORITY", "5"),
        ]))
        .unwrap();
        assert_eq!(config.unresolved_policy, UnresolvedPolicy::ForceInclude(5));
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let err = RunConfig::from_lookup(lookup(&[("DIGEST_UNRESOLVED_POLICY", "maybe")]));
        assert!(matches!(err, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn non_numeric_priority_is_rejected() {
        let err = RunConfig::from_lookup(lookup(&[("DIGEST_DEFAULT_PRIORITY", "high")]));
        assert!(matches!(err, Err(ConfigError::InvalidValue { key, .. }) if key == "DIGEST_DEFAULT_PRIORITY"));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = RunConfig::from_lookup(lookup(&[("DIGEST_WORKERS", "0")]));
        assert!(err.is_err());
    }

    #[test]
    fn generative_without_key_degrades_to_heuristic() {
        let config = RunConfig::from_lookup(lookup(&[("DIGEST_GENERATIVE", "on")])).unwrap();
        assert!(config.llm.is_none());
        assert_eq!(config.missing_llm_key, Some("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = RunConfig::from_lookup(lookup(&[
            ("DIGEST_GENERATIVE", "on"),
            ("DIGEST_LLM_BACKEND", "gemini"),
        ]));
        assert!(matches!(err, Err(ConfigError::InvalidValue { key, .. }) if key == "DIGEST_LLM_BACKEND"));
    }

    #[test]
    fn log_dir_is_optional() {
        assert!(RunConfig::from_lookup(lookup(&[])).unwrap().log_dir.is_none());
        let config = RunConfig::from_lookup(lookup(&[("DIGEST_LOG_DIR", "/var/log/digest")])).unwrap();
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/digest")));
    }

    #[test]
    fn generative_with_key_builds_llm_config() {
        let config = RunConfig::from_lookup(lookup(&[
            ("DIGEST_GENERATIVE", "true"),
            ("DIGEST_LLM_BACKEND", "openai"),
            ("OPENAI_API_KEY", "sk-test"),
        ]))
        .unwrap();
        let llm = config.llm.unwrap();
        assert_eq!(llm.backend, LlmBackend::OpenAi);
        assert_eq!(llm.model, "gpt-4o-mini");
        assert!(config.missing_llm_key.is_none());
    }

    #[test]
    fn pipeline_config_picks_up_overrides() {
        let config = RunConfig::from_lookup(lookup(&[
            ("DIGEST_WORKERS", "2"),
            ("DIGEST_LLM_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();
        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.workers, 2);
        assert_eq!(pipeline.extraction.llm_timeout, Duration::from_secs(5));
    }

    #[test]
    fn default_pattern_lists_compile() {
        let config = PipelineConfig::default();
        assert!(compile_patterns(&config.normalizer.boilerplate_patterns).is_ok());
        assert!(compile_patterns(&config.normalizer.line_drop_patterns).is_ok());
        assert!(compile_patterns(&config.normalizer.quote_cutoff_patterns).is_ok());
        assert!(compile_patterns(&config.normalizer.signature_patterns).is_ok());
        assert!(compile_patterns(&config.classifier.subject_exclusions).is_ok());
        assert!(compile_patterns(&config.extraction.item_boilerplate_patterns).is_ok());
    }

    #[test]
    fn invalid_pattern_reports_the_pattern() {
        let err = compile_patterns(&["(unclosed".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { pattern, .. } if pattern == "(unclosed"));
    }

    #[test]
    fn sanitizer_defaults_never_allow_script() {
        let config = SanitizerConfig::default();
        assert!(!config.allowed_tags.contains("script"));
        assert!(config.dropped_tags.contains("script"));
        assert!(!config.allowed_url_schemes.contains("javascript"));
    }
}
