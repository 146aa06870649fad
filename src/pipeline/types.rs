//! Shared types for the digest pipeline.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;
use crate::extract::ExtractionResult;

// ── Inbound message ─────────────────────────────────────────────────

/// One message as handed over by a mailbox source.
///
/// Immutable once fetched. Every field may be empty: sources fill in what
/// the transport delivered and the pipeline recovers from the gaps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Transport-local identifier (IMAP UID, file name, ...).
    pub transport_id: String,
    /// Globally-unique `Message-ID` header, if the message carried one.
    pub message_id: Option<String>,
    /// Free-form `From` header.
    pub sender: String,
    pub subject: String,
    /// Parsed `Date` header. `None` when missing or unparsable.
    pub timestamp: Option<DateTime<Utc>>,
    /// `text/plain` body (empty if absent).
    pub plain_body: String,
    /// `text/html` body (empty if absent).
    pub markup_body: String,
    /// The message carried an explicit `List-Unsubscribe` header.
    pub list_unsubscribe: bool,
}

// ── Identity ────────────────────────────────────────────────────────

/// Stable per-message identity used for dedup and caching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageKey(String);

impl MessageKey {
    /// Wrap an already-derived key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for MessageKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ── Priority ────────────────────────────────────────────────────────

/// Where a message's priority came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrioritySource {
    /// Exact sender address match.
    Exact,
    /// Sender domain (or a parent domain) match.
    Domain,
    /// Unresolved sender, assigned the configured default.
    Default,
    /// Unresolved sender, force-included under the configured default.
    Forced,
}

/// A resolved priority. Lower value = more important.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPriority {
    pub value: i32,
    pub source: PrioritySource,
}

// ── Selected message ────────────────────────────────────────────────

/// A message that survived every filter, with everything needed to render it.
///
/// Only lives for the duration of one run.
#[derive(Debug, Clone)]
pub struct SelectedMessage {
    pub key: MessageKey,
    pub raw: RawMessage,
    pub priority: ResolvedPriority,
    pub canonical_text: String,
    pub sanitized_markup: String,
    pub extraction: ExtractionResult,
    /// `raw.timestamp`, or the run's `now` when absent.
    pub sort_timestamp: DateTime<Utc>,
    /// The extraction came from the cache rather than a fresh extraction.
    pub from_cache: bool,
}

// ── Audit trail ─────────────────────────────────────────────────────

/// Why a candidate message was kept or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Disposition {
    /// No message id and nothing to hash.
    NoIdentity,
    /// Same key as an earlier message in the batch.
    Duplicate,
    NotNewsletter,
    SubjectExcluded,
    NoSenderAddress,
    NotInPriorityTable,
    Included,
    /// Included with the default priority (unresolved sender).
    IncludedDefault,
    /// Force-included (unresolved sender).
    IncludedForced,
}

impl Disposition {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NoIdentity => "no-identity",
            Self::Duplicate => "duplicate",
            Self::NotNewsletter => "not-newsletter",
            Self::SubjectExcluded => "subject-excluded",
            Self::NoSenderAddress => "no-sender-address",
            Self::NotInPriorityTable => "not-in-priority-table",
            Self::Included => "included",
            Self::IncludedDefault => "included-default",
            Self::IncludedForced => "included-forced",
        }
    }

    /// Whether the candidate ends up in the output collection.
    pub fn is_included(&self) -> bool {
        matches!(
            self,
            Self::Included | Self::IncludedDefault | Self::IncludedForced
        )
    }
}

/// One audit record per candidate. Observability only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub key: Option<MessageKey>,
    pub transport_id: String,
    pub subject: String,
    pub sender: String,
    pub disposition: Disposition,
}

impl AuditRecord {
    pub fn new(raw: &RawMessage, key: Option<&MessageKey>, disposition: Disposition) -> Self {
        Self {
            key: key.cloned(),
            transport_id: raw.transport_id.clone(),
            subject: raw.subject.clone(),
            sender: raw.sender.clone(),
            disposition,
        }
    }
}

/// Result of processing one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Selected messages in final digest order.
    pub selected: Vec<SelectedMessage>,
    /// One record per candidate, in batch order.
    pub audit: Vec<AuditRecord>,
}

impl BatchOutcome {
    /// Number of audit records carrying the given disposition.
    pub fn count(&self, disposition: Disposition) -> usize {
        self.audit
            .iter()
            .filter(|r| r.disposition == disposition)
            .count()
    }

    /// Number of audit records for messages that made it into the digest.
    pub fn included(&self) -> usize {
        self.audit
            .iter()
            .filter(|r| r.disposition.is_included())
            .count()
    }
}

// ── Mailbox source ──────────────────────────────────────────────────

/// Parameters of one fetch.
#[derive(Debug, Clone)]
pub struct FetchQuery {
    pub host: String,
    pub user: String,
    pub credential: SecretString,
    /// Only messages on or after this instant are wanted.
    pub since: DateTime<Utc>,
    pub mailbox: String,
}

/// Trait for mailbox sources: pure I/O, no business logic.
///
/// Sources own connection handling, search and retry. The pipeline only
/// relies on the `RawMessage` fields they produce.
#[async_trait]
pub trait MailboxSource: Send + Sync {
    /// Source name for logging (e.g. "eml-dir", "imap").
    fn name(&self) -> &str;

    /// Fetch the batch of messages matching `query`.
    async fn fetch(&self, query: &FetchQuery) -> Result<Vec<RawMessage>, SourceError>;
}
