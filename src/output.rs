//! Digest artifacts on disk.
//!
//! One JSON file per selected message, a `digest.json` index in final digest
//! order, and optionally an `audit.jsonl` trail with one line per candidate.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::extract::Item;
use crate::pipeline::types::{BatchOutcome, MessageKey, PrioritySource, SelectedMessage};

const INDEX_FILE: &str = "digest.json";
const AUDIT_FILE: &str = "audit.jsonl";
const MAX_PREFIX_CHARS: usize = 40;

#[derive(Debug, Serialize)]
struct MessageArtifact<'a> {
    key: &'a MessageKey,
    subject: &'a str,
    sender: &'a str,
    date: Option<String>,
    priority: i32,
    priority_source: PrioritySource,
    overview: &'a str,
    items: &'a [Item],
    sanitized_html: &'a str,
    cached: bool,
}

impl<'a> MessageArtifact<'a> {
    fn from_selected(s: &'a SelectedMessage) -> Self {
        Self {
            key: &s.key,
            subject: &s.raw.subject,
            sender: &s.raw.sender,
            date: s.raw.timestamp.map(|t| t.to_rfc3339()),
            priority: s.priority.value,
            priority_source: s.priority.source,
            overview: &s.extraction.overview,
            items: &s.extraction.items,
            sanitized_html: &s.sanitized_markup,
            cached: s.from_cache,
        }
    }
}

#[derive(Debug, Serialize)]
struct IndexEntry<'a> {
    key: &'a MessageKey,
    file: String,
    subject: &'a str,
    priority: i32,
}

#[derive(Debug, Serialize)]
struct DigestIndex<'a> {
    generated_at: String,
    count: usize,
    messages: Vec<IndexEntry<'a>>,
}

/// What [`ArtifactWriter::write`] managed to produce.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub written: usize,
    pub failed: usize,
}

/// Writes digest artifacts into one directory.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    dir: PathBuf,
    audit: bool,
}

impl ArtifactWriter {
    pub fn new(dir: impl Into<PathBuf>, audit: bool) -> Self {
        Self {
            dir: dir.into(),
            audit,
        }
    }

    /// Write all artifacts for a processed batch.
    ///
    /// A message whose file cannot be written is logged and left out of the
    /// index. Failing to create the directory or write the index is an error.
    pub async fn write(
        &self,
        outcome: &BatchOutcome,
        now: DateTime<Utc>,
    ) -> Result<WriteSummary, PipelineError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| PipelineError::ArtifactWrite {
                path: self.dir.display().to_string(),
                source,
            })?;

        let mut summary = WriteSummary::default();
        let mut entries = Vec::with_capacity(outcome.selected.len());

        for selected in &outcome.selected {
            let file = artifact_file_name(&selected.key);
            match self.write_message(&file, selected).await {
                Ok(()) => {
                    summary.written += 1;
                    entries.push(IndexEntry {
                        key: &selected.key,
                        file,
                        subject: &selected.raw.subject,
                        priority: selected.priority.value,
                    });
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(key = %selected.key, error = %e, "Failed to write message artifact");
                }
            }
        }

        let index = DigestIndex {
            generated_at: now.to_rfc3339(),
            count: entries.len(),
            messages: entries,
        };
        self.write_file(INDEX_FILE, serde_json::to_vec_pretty(&index)?)
            .await?;

        if self.audit {
            let mut lines = String::new();
            for record in &outcome.audit {
                lines.push_str(&serde_json::to_string(record)?);
                lines.push('\n');
            }
            self.write_file(AUDIT_FILE, lines.into_bytes()).await?;
        }

        info!(
            dir = %self.dir.display(),
            written = summary.written,
            failed = summary.failed,
            "Digest artifacts written"
        );
        Ok(summary)
    }

    async fn write_message(
        &self,
        file: &str,
        selected: &SelectedMessage,
    ) -> Result<(), PipelineError> {
        let json = serde_json::to_vec_pretty(&MessageArtifact::from_selected(selected))?;
        self.write_file(file, json).await
    }

    async fn write_file(&self, file: &str, contents: Vec<u8>) -> Result<(), PipelineError> {
        let path = self.dir.join(file);
        tokio::fs::write(&path, contents)
            .await
            .map_err(|source| PipelineError::ArtifactWrite {
                path: path.display().to_string(),
                source,
            })
    }
}

/// `<readable-prefix>-<hash8>.json`, safe on any filesystem.
///
/// The hash keeps keys that sanitize to the same prefix apart.
pub fn artifact_file_name(key: &MessageKey) -> String {
    let prefix: String = key
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_PREFIX_CHARS)
        .collect();
    let prefix = prefix.trim_matches('.');
    let hash = hex::encode(Sha256::digest(key.as_str().as_bytes()));
    format!("{prefix}-{}.json", &hash[..8])
}
