//! Mailbox sources that feed the digest pipeline.

pub mod eml;

pub use eml::EmlDirectorySource;
