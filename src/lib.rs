//! Newsletter Digest: turns a mailbox batch into a prioritized digest.

pub mod channels;
pub mod config;
pub mod error;
pub mod extract;
pub mod llm;
pub mod output;
pub mod pipeline;
pub mod store;
