//! Digest processor: one fetched batch → sorted selected messages.
//!
//! Stages, strictly in order:
//! 1. Deduplicate by `MessageKey`
//! 2. Classify (newsletter signal, exclusion rules)
//! 3. Resolve sender priority under the unresolved policy
//! 4. Normalize text and sanitize markup
//! 5. Extract items (cache first, bounded concurrency, order preserved)
//! 6. Sort by priority ascending, then timestamp descending
//!
//! No single message aborts the batch. Every candidate gets exactly one
//! audit record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{ConfigError, PipelineError};
use crate::extract::{ExtractionInput, ExtractionResult, Extractor};
use crate::pipeline::dedup::{Candidate, deduplicate};
use crate::pipeline::normalize::Normalizer;
use crate::pipeline::priority::PriorityResolver;
use crate::pipeline::rules::Classifier;
use crate::pipeline::sanitize::Sanitizer;
use crate::pipeline::types::{
    AuditRecord, BatchOutcome, Disposition, FetchQuery, MailboxSource, MessageKey, PrioritySource,
    RawMessage, ResolvedPriority, SelectedMessage,
};
use crate::store::ExtractionCache;

/// A candidate that passed classification and priority resolution.
struct Accepted {
    index: usize,
    key: MessageKey,
    raw: RawMessage,
    priority: ResolvedPriority,
}

/// An accepted candidate with its canonical text and sanitized markup.
struct Prepared {
    accepted: Accepted,
    canonical_text: String,
    sanitized_markup: String,
}

/// Runs the digest stages over one batch.
pub struct DigestProcessor {
    classifier: Classifier,
    resolver: PriorityResolver,
    normalizer: Normalizer,
    sanitizer: Sanitizer,
    extractor: Arc<dyn Extractor>,
    cache: Option<Arc<dyn ExtractionCache>>,
    workers: usize,
}

impl DigestProcessor {
    /// Build a processor from pipeline config. No cache until [`with_cache`](Self::with_cache).
    pub fn new(
        config: &PipelineConfig,
        resolver: PriorityResolver,
        extractor: Arc<dyn Extractor>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            classifier: Classifier::new(&config.classifier)?,
            resolver,
            normalizer: Normalizer::new(&config.normalizer)?,
            sanitizer: Sanitizer::new(config.sanitizer.clone()),
            extractor,
            cache: None,
            workers: config.workers.max(1),
        })
    }

    /// Check and fill this cache around extraction.
    pub fn with_cache(mut self, cache: Arc<dyn ExtractionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace the classifier (e.g. to add runtime exclusion rules).
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Fetch a batch from `source` and process it.
    ///
    /// A fetch failure aborts the run before anything is processed.
    pub async fn run(
        &self,
        source: &dyn MailboxSource,
        query: &FetchQuery,
        now: DateTime<Utc>,
    ) -> Result<BatchOutcome, PipelineError> {
        info!(
            source = source.name(),
            mailbox = %query.mailbox,
            since = %query.since,
            "Fetching batch"
        );
        let batch = source.fetch(query).await?;
        Ok(self.process_batch(batch, now).await)
    }

    /// Process one batch. `now` stands in for missing timestamps.
    pub async fn process_batch(&self, batch: Vec<RawMessage>, now: DateTime<Utc>) -> BatchOutcome {
        let total = batch.len();
        info!(count = total, "Processing message batch");

        let deduped = deduplicate(batch);
        let mut audit = deduped.discarded;

        let mut accepted = Vec::with_capacity(deduped.unique.len());
        for candidate in deduped.unique {
            match self.accept(candidate) {
                Ok(a) => accepted.push(a),
                Err((index, record)) => audit.push((index, record)),
            }
        }

        let prepared: Vec<Prepared> = accepted.into_iter().map(|a| self.prepare(a)).collect();

        let extracted: Vec<(Prepared, ExtractionResult, bool)> = stream::iter(prepared)
            .map(|p| async move {
                let (result, from_cache) = self.extract_cached(&p).await;
                (p, result, from_cache)
            })
            .buffered(self.workers)
            .collect()
            .await;

        let mut selected = Vec::with_capacity(extracted.len());
        for (p, extraction, from_cache) in extracted {
            let Prepared {
                accepted,
                canonical_text,
                sanitized_markup,
            } = p;
            let disposition = match accepted.priority.source {
                PrioritySource::Exact | PrioritySource::Domain => Disposition::Included,
                PrioritySource::Default => Disposition::IncludedDefault,
                PrioritySource::Forced => Disposition::IncludedForced,
            };
            audit.push((
                accepted.index,
                AuditRecord::new(&accepted.raw, Some(&accepted.key), disposition),
            ));
            selected.push(SelectedMessage {
                sort_timestamp: accepted.raw.timestamp.unwrap_or(now),
                key: accepted.key,
                raw: accepted.raw,
                priority: accepted.priority,
                canonical_text,
                sanitized_markup,
                extraction,
                from_cache,
            });
        }

        sort_selected(&mut selected);
        audit.sort_by_key(|(index, _)| *index);

        let outcome = BatchOutcome {
            selected,
            audit: audit.into_iter().map(|(_, record)| record).collect(),
        };
        info!(
            total,
            selected = outcome.selected.len(),
            included = outcome.included(),
            forced = outcome.count(Disposition::IncludedForced),
            duplicate = outcome.count(Disposition::Duplicate),
            no_identity = outcome.count(Disposition::NoIdentity),
            not_newsletter = outcome.count(Disposition::NotNewsletter),
            excluded = outcome.count(Disposition::SubjectExcluded),
            unresolved = outcome.count(Disposition::NotInPriorityTable)
                + outcome.count(Disposition::NoSenderAddress),
            "Batch processing complete"
        );
        outcome
    }

    /// Classification and priority. `Err` carries the drop record.
    fn accept(&self, candidate: Candidate) -> Result<Accepted, (usize, AuditRecord)> {
        let Candidate { index, key, raw } = candidate;
        let reject = |disposition: Disposition, raw: &RawMessage| {
            debug!(key = %key, disposition = disposition.label(), "Dropping message");
            (index, AuditRecord::new(raw, Some(&key), disposition))
        };

        if let Some(disposition) = self.classifier.evaluate(&raw) {
            return Err(reject(disposition, &raw));
        }

        match self.resolver.resolve(&raw.sender) {
            Ok(priority) => Ok(Accepted {
                index,
                key,
                raw,
                priority,
            }),
            Err(disposition) => Err(reject(disposition, &raw)),
        }
    }

    fn prepare(&self, accepted: Accepted) -> Prepared {
        let raw = &accepted.raw;
        let canonical_text = self
            .normalizer
            .normalize(&raw.plain_body, &raw.markup_body, &raw.subject);
        let sanitized_markup = self.sanitizer.render(&raw.markup_body, &canonical_text);
        Prepared {
            accepted,
            canonical_text,
            sanitized_markup,
        }
    }

    /// Cached result if present, else a fresh extraction written back.
    /// Cache failures are logged and treated as misses.
    async fn extract_cached(&self, p: &Prepared) -> (ExtractionResult, bool) {
        let key = &p.accepted.key;

        if let Some(cache) = &self.cache {
            match cache.get(key).await {
                Ok(Some(result)) => {
                    debug!(key = %key, "Extraction cache hit");
                    return (result, true);
                }
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Cache lookup failed, extracting"),
            }
        }

        let input = ExtractionInput {
            key,
            subject: &p.accepted.raw.subject,
            sender: &p.accepted.raw.sender,
            text: &p.canonical_text,
            markup: &p.sanitized_markup,
        };
        let extraction = self.extractor.extract(&input).await;

        if let Some(cache) = &self.cache
            && let Err(e) = cache
                .put(key, extraction.strategy, &extraction.result)
                .await
        {
            warn!(key = %key, error = %e, "Cache write failed");
        }

        (extraction.result, false)
    }
}

/// Stable sort: priority ascending, then newest first.
pub fn sort_selected(selected: &mut [SelectedMessage]) {
    selected.sort_by(|a, b| {
        a.priority
            .value
            .cmp(&b.priority.value)
            .then_with(|| b.sort_timestamp.cmp(&a.sort_timestamp))
    });
}
