//! Error types for the digest pipeline.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a mailbox source while fetching a batch.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Mailbox {mailbox} not found under {root}")]
    MailboxNotFound { root: String, mailbox: String },

    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Extraction cache errors. Always recoverable from the pipeline's point of view.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Fetch stage failed: {0}")]
    Fetch(#[from] SourceError),

    #[error("Artifact write failed for {path}: {source}")]
    ArtifactWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact serialization failed: {0}")]
    ArtifactSerialize(#[from] serde_json::Error),
}
