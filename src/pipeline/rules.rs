//! Regex rules that decide whether a message belongs in the digest.
//!
//! - Newsletter signal: `List-Unsubscribe` header, or "unsubscribe" anywhere
//!   in subject, sender or body
//! - Exclusion rules: confirmations, verifications, "action required"
//!   (English and Czech), plus anything added at runtime
//!
//! A message proceeds only if it is a newsletter and no exclusion matches.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::config::ClassifierConfig;
use crate::error::ConfigError;
use crate::pipeline::types::{Disposition, RawMessage};

static UNSUBSCRIBE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)unsubscribe").unwrap());

/// Which field a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    Sender,
    Subject,
    /// Plain body, or markup body when there is no plain body.
    Content,
}

/// A single exclusion rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct ExclusionRule {
    /// Source pattern.
    pub pattern: String,
    pub regex: Regex,
    pub field: RuleField,
    /// Why this rule triggers.
    pub reason: String,
}

/// Newsletter detection and exclusion filtering.
pub struct Classifier {
    exclusion_rules: Vec<ExclusionRule>,
}

impl Classifier {
    /// Classifier with the built-in bilingual subject exclusions.
    pub fn default_rules() -> Result<Self, ConfigError> {
        Self::new(&ClassifierConfig::default())
    }

    /// Classifier with the configured subject exclusions.
    pub fn new(config: &ClassifierConfig) -> Result<Self, ConfigError> {
        let mut classifier = Self::empty();
        for pattern in &config.subject_exclusions {
            classifier
                .add_exclusion_rule(pattern, RuleField::Subject, "confirmation or verification")
                .map_err(|source| ConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })?;
        }
        Ok(classifier)
    }

    /// Classifier with no exclusion rules (for testing).
    pub fn empty() -> Self {
        Self {
            exclusion_rules: Vec::new(),
        }
    }

    /// Add a case-insensitive exclusion rule.
    pub fn add_exclusion_rule(
        &mut self,
        pattern: &str,
        field: RuleField,
        reason: &str,
    ) -> Result<(), regex::Error> {
        let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        self.exclusion_rules.push(ExclusionRule {
            pattern: pattern.to_string(),
            regex,
            field,
            reason: reason.to_string(),
        });
        Ok(())
    }

    pub fn rule_count(&self) -> usize {
        self.exclusion_rules.len()
    }

    /// Header signal, or the literal token "unsubscribe" in subject, sender or body.
    pub fn is_newsletter(&self, message: &RawMessage) -> bool {
        message.list_unsubscribe
            || UNSUBSCRIBE_TOKEN.is_match(&message.subject)
            || UNSUBSCRIBE_TOKEN.is_match(&message.sender)
            || UNSUBSCRIBE_TOKEN.is_match(content(message))
    }

    /// First exclusion rule matching the message.
    pub fn excluded_by(&self, message: &RawMessage) -> Option<&ExclusionRule> {
        self.exclusion_rules.iter().find(|rule| {
            let text = match rule.field {
                RuleField::Sender => message.sender.as_str(),
                RuleField::Subject => message.subject.as_str(),
                RuleField::Content => content(message),
            };
            rule.regex.is_match(text)
        })
    }

    /// Drop disposition for the message, or `None` if it proceeds.
    pub fn evaluate(&self, message: &RawMessage) -> Option<Disposition> {
        if !self.is_newsletter(message) {
            return Some(Disposition::NotNewsletter);
        }
        if let Some(rule) = self.excluded_by(message) {
            debug!(
                subject = %message.subject,
                pattern = %rule.pattern,
                reason = %rule.reason,
                "Exclusion rule matched"
            );
            return Some(Disposition::SubjectExcluded);
        }
        None
    }
}

fn content(message: &RawMessage) -> &str {
    if message.plain_body.is_empty() {
        &message.markup_body
    } else {
        &message.plain_body
    }
}
