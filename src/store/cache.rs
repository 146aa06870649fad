//! The `ExtractionCache` trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::extract::ExtractionResult;
use crate::pipeline::types::MessageKey;

/// One persisted cache record.
///
/// `strategy` and `updated_at` are informational; lookups ignore them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: MessageKey,
    pub result: ExtractionResult,
    pub strategy: String,
    pub updated_at: DateTime<Utc>,
}

/// Content-addressed store for extraction results.
///
/// Keyed purely by `MessageKey`, independent of the strategy that produced
/// the result: switching strategies does not invalidate earlier entries.
/// Writes replace the whole record; the last writer wins.
#[async_trait]
pub trait ExtractionCache: Send + Sync {
    /// Look up a previous result.
    async fn get(&self, key: &MessageKey) -> Result<Option<ExtractionResult>, CacheError>;

    /// Store a result, replacing any earlier one for the same key.
    async fn put(
        &self,
        key: &MessageKey,
        strategy: &str,
        result: &ExtractionResult,
    ) -> Result<(), CacheError>;
}
