//! Newsletter digest pipeline.
//!
//! Every fetched batch flows through:
//! 1. `dedup::deduplicate()`: one candidate per `MessageKey`
//! 2. `Classifier::evaluate()`: newsletter signal and exclusion rules
//! 3. `PriorityResolver::resolve()`: sender priority or drop
//! 4. `Normalizer` + `Sanitizer`: canonical text and embeddable markup
//! 5. `Extractor`: overview and items, through the extraction cache
//! 6. Sort: priority ascending, newest first
//!
//! `DigestProcessor` drives the stages and records one audit entry per
//! candidate.

pub mod dedup;
pub mod normalize;
pub mod priority;
pub mod processor;
pub mod rules;
pub mod sanitize;
pub mod types;

pub use processor::DigestProcessor;
