//! Sender priority resolution.
//!
//! The priority table is loaded once per run from a CSV with `email` and
//! `priority` columns. Rows whose key has a local part (`a@x.com`) match that
//! address exactly; `@x.com` and `x.com` rows match the domain and all of its
//! subdomains. Lower priority = more important.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::UnresolvedPolicy;
use crate::error::ConfigError;
use crate::pipeline::types::{Disposition, PrioritySource, ResolvedPriority};

/// Exact-address and domain-suffix priorities, keys lower-cased.
#[derive(Debug, Clone, Default)]
pub struct PriorityTable {
    exact: HashMap<String, i32>,
    domains: HashMap<String, i32>,
}

impl PriorityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry. Blank keys are ignored.
    pub fn insert(&mut self, email: &str, priority: i32) {
        let key = email.trim().to_lowercase();
        match key.split_once('@') {
            Some((local, domain)) if !local.is_empty() => {
                if !domain.is_empty() {
                    self.exact.insert(key, priority);
                }
            }
            Some((_, domain)) => {
                if !domain.is_empty() {
                    self.domains.insert(domain.to_string(), priority);
                }
            }
            None => {
                if !key.is_empty() {
                    self.domains.insert(key, priority);
                }
            }
        }
    }

    /// Parse CSV text. Rows with a blank email or non-integer priority are skipped.
    ///
    /// Columns are found by header name, so extra columns such as a quoted
    /// `"Doe, John"` display name are fine. Lines starting with `#` are comments.
    pub fn from_csv_str(csv: &str) -> Self {
        let mut table = Self::new();
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .comment(Some(b'#'))
            .from_reader(csv.trim_start_matches('\u{feff}').as_bytes());

        let columns: Vec<String> = match reader.headers() {
            Ok(header) => header.iter().map(str::to_lowercase).collect(),
            Err(e) => {
                warn!(error = %e, "Priority list header is unreadable");
                return table;
            }
        };
        let (Some(email_col), Some(priority_col)) = (
            columns.iter().position(|c| c == "email"),
            columns.iter().position(|c| c == "priority"),
        ) else {
            warn!(header = %columns.join(","), "Priority list header lacks email/priority columns");
            return table;
        };

        for record in reader.records() {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    debug!(error = %e, "Skipping malformed priority row");
                    continue;
                }
            };
            let email = record.get(email_col).unwrap_or("");
            let priority = record.get(priority_col).and_then(|p| p.parse::<i32>().ok());
            match priority {
                Some(priority) if !email.is_empty() => table.insert(email, priority),
                _ => debug!(row = ?record, "Skipping priority row"),
            }
        }
        table
    }

    /// Load the table from a CSV file. A missing file gives an empty table.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        match tokio::fs::read_to_string(path).await {
            Ok(csv) => {
                let table = Self::from_csv_str(&csv);
                info!(
                    path = %path.display(),
                    exact = table.exact.len(),
                    domains = table.domains.len(),
                    "Priority list loaded"
                );
                Ok(table)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Priority list not found, every sender is unresolved");
                Ok(Self::new())
            }
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Exact match first, then the domain and each parent domain.
    pub fn lookup(&self, address: &str) -> Option<ResolvedPriority> {
        let address = address.to_lowercase();
        if let Some(&value) = self.exact.get(&address) {
            return Some(ResolvedPriority {
                value,
                source: PrioritySource::Exact,
            });
        }

        let (_, mut domain) = address.rsplit_once('@')?;
        loop {
            if let Some(&value) = self.domains.get(domain) {
                return Some(ResolvedPriority {
                    value,
                    source: PrioritySource::Domain,
                });
            }
            domain = domain.split_once('.')?.1;
        }
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bare lower-cased address from a free-form `From` header.
///
/// Handles `"Name" <a@b>`, `a@b`, and `a@b (Name)`.
pub fn extract_address(header: &str) -> Option<String> {
    let candidate = match (header.rfind('<'), header.rfind('>')) {
        (Some(start), Some(end)) if end > start => &header[start + 1..end],
        _ => header
            .split_whitespace()
            .find(|token| token.contains('@'))
            .unwrap_or(""),
    };
    let address = candidate
        .trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '(' | ')' | ',' | ';' | '<' | '>'))
        .to_lowercase();

    let (local, domain) = address.rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() || address.contains(char::is_whitespace) {
        return None;
    }
    Some(address)
}

/// Resolves senders against a shared table under an `UnresolvedPolicy`.
#[derive(Debug, Clone)]
pub struct PriorityResolver {
    table: Arc<PriorityTable>,
    policy: UnresolvedPolicy,
}

impl PriorityResolver {
    pub fn new(table: Arc<PriorityTable>, policy: UnresolvedPolicy) -> Self {
        Self { table, policy }
    }

    /// Priority for a sender header, or the disposition that drops the message.
    ///
    /// Senders without a parsable address count as unresolved under the
    /// default and force policies.
    pub fn resolve(&self, sender: &str) -> Result<ResolvedPriority, Disposition> {
        let resolved = match extract_address(sender) {
            Some(address) => self.table.lookup(&address),
            None if self.policy == UnresolvedPolicy::Drop => {
                return Err(Disposition::NoSenderAddress);
            }
            None => None,
        };

        if let Some(priority) = resolved {
            return Ok(priority);
        }

        match self.policy {
            UnresolvedPolicy::Drop => Err(Disposition::NotInPriorityTable),
            UnresolvedPolicy::AssignDefault(value) => Ok(ResolvedPriority {
                value,
                source: PrioritySource::Default,
            }),
            UnresolvedPolicy::ForceInclude(value) => Ok(ResolvedPriority {
                value,
                source: PrioritySource::Forced,
            }),
        }
    }
}
