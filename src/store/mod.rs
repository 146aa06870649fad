//! Persistence layer: the libSQL-backed extraction cache.

pub mod cache;
pub mod libsql_cache;
mod migrations;

pub use cache::{CacheEntry, ExtractionCache};
pub use libsql_cache::LibSqlCache;
