//! Local mailbox source: a directory of `.eml` files per mailbox.
//!
//! Layout is `<root>/<mailbox>/*.eml`, one RFC 5322 message per file. Files
//! are read in name order, so a batch is reproducible. The file name is the
//! transport id.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use mail_parser::{HeaderName, Message, MessageParser, PartType};
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::pipeline::types::{FetchQuery, MailboxSource, RawMessage};

/// Reads messages from `.eml` files on disk.
#[derive(Debug, Clone)]
pub struct EmlDirectorySource {
    root: PathBuf,
}

impl EmlDirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl MailboxSource for EmlDirectorySource {
    fn name(&self) -> &str {
        "eml-directory"
    }

    async fn fetch(&self, query: &FetchQuery) -> Result<Vec<RawMessage>, SourceError> {
        let dir = self.root.join(&query.mailbox);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(SourceError::MailboxNotFound {
                root: self.root.display().to_string(),
                mailbox: query.mailbox.clone(),
            });
        }
        debug!(user = %query.user, host = %query.host, dir = %dir.display(), "Reading local mailbox");

        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("eml"))
            {
                paths.push(path);
            }
        }
        paths.sort();

        let mut messages = Vec::with_capacity(paths.len());
        for path in paths {
            let transport_id = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(file = %transport_id, error = %e, "Skipping unreadable message file");
                    continue;
                }
            };
            let Some(raw) = parse_eml(&bytes, &transport_id) else {
                warn!(file = %transport_id, "Skipping unparsable message file");
                continue;
            };

            if raw.timestamp.is_some_and(|t| t < query.since) {
                debug!(file = %transport_id, "Message older than window, skipping");
                continue;
            }
            messages.push(raw);
        }

        info!(mailbox = %query.mailbox, count = messages.len(), "Fetched messages");
        Ok(messages)
    }
}

/// Parse one RFC 5322 message into a [`RawMessage`].
pub fn parse_eml(bytes: &[u8], transport_id: &str) -> Option<RawMessage> {
    let parsed = MessageParser::default().parse(bytes)?;

    Some(RawMessage {
        transport_id: transport_id.to_string(),
        message_id: parsed.message_id().map(|id| id.to_string()),
        sender: sender_header(&parsed),
        subject: parsed.subject().unwrap_or_default().to_string(),
        timestamp: message_date(&parsed),
        plain_body: body_part(&parsed, false),
        markup_body: body_part(&parsed, true),
        list_unsubscribe: parsed.header(HeaderName::ListUnsubscribe).is_some(),
    })
}

/// `Name <address>` from the first `From` entry.
fn sender_header(parsed: &Message<'_>) -> String {
    let Some(addr) = parsed.from().and_then(|a| a.first()) else {
        return String::new();
    };
    match (addr.name(), addr.address()) {
        (Some(name), Some(address)) => format!("{name} <{address}>"),
        (None, Some(address)) => address.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => String::new(),
    }
}

/// The `Date` header in UTC, offset applied.
fn message_date(parsed: &Message<'_>) -> Option<DateTime<Utc>> {
    let d = parsed.date()?;
    let local = NaiveDate::from_ymd_opt(i32::from(d.year), u32::from(d.month), u32::from(d.day))?
        .and_hms_opt(u32::from(d.hour), u32::from(d.minute), u32::from(d.second))?;

    let offset = i64::from(d.tz_hour) * 3600 + i64::from(d.tz_minute) * 60;
    let offset = if d.tz_before_gmt { -offset } else { offset };
    Some(local.and_utc() - Duration::seconds(offset))
}

/// First body part of the requested kind, without cross-conversion.
///
/// mail-parser lists an HTML part under the text bodies (and vice versa)
/// when the other alternative is missing; those are skipped here.
fn body_part(parsed: &Message<'_>, html: bool) -> String {
    let ids = if html {
        &parsed.html_body
    } else {
        &parsed.text_body
    };
    ids.iter()
        .find_map(|&id| {
            let part = parsed.parts.get(usize::try_from(id).ok()?)?;
            match (&part.body, html) {
                (PartType::Text(text), false) => Some(text.to_string()),
                (PartType::Html(markup), true) => Some(markup.to_string()),
                _ => None,
            }
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use secrecy::SecretString;

    use super::*;

    const NEWSLETTER: &str = "From: \"Rust Weekly\" <news@rust.example>\r\n\
        To: me@example.com\r\n\
        Subject: This week in Rust\r\n\
        Message-ID: <issue-42@rust.example>\r\n\
        Date: Wed, 15 May 2024 09:30:00 +0200\r\n\
        List-Unsubscribe: <https://rust.example/unsub>\r\n\
        Content-Type: text/plain; charset=utf-8\r\n\
        \r\n\
        Hello readers.\r\n";

    const HTML_ONLY: &str = "From: promo@shop.example\r\n\
        Subject: Sale\r\n\
        Date: Tue, 14 May 2024 10:00:00 -0500\r\n\
        Content-Type: text/html; charset=utf-8\r\n\
        \r\n\
        <p>Big sale</p>\r\n";

    const BAD_DATE: &str = "From: news@rust.example\r\n\
        Subject: Undated issue\r\n\
        Date: not a date at all\r\n\
        Content-Type: text/plain; charset=utf-8\r\n\
        \r\n\
        Body.\r\n";

    fn query(since: DateTime<Utc>) -> FetchQuery {
        FetchQuery {
            host: "localhost".into(),
            user: "me".into(),
            credential: SecretString::from(""),
            since,
            mailbox: "INBOX".into(),
        }
    }

    // ── Parsing ─────────────────────────────────────────────────────

    #[test]
    fn parses_headers_and_plain_body() {
        let raw = parse_eml(NEWSLETTER.as_bytes(), "a.eml").unwrap();
        assert_eq!(raw.transport_id, "a.eml");
        assert_eq!(raw.message_id.as_deref(), Some("issue-42@rust.example"));
        assert_eq!(raw.sender, "Rust Weekly <news@rust.example>");
        assert_eq!(raw.subject, "This week in Rust");
        assert!(raw.list_unsubscribe);
        assert!(raw.plain_body.contains("Hello readers."));
        assert!(raw.markup_body.is_empty());
        assert_eq!(
            raw.timestamp,
            Some(Utc.with_ymd_and_hms(2024, 5, 15, 7, 30, 0).unwrap())
        );
    }

    #[test]
    fn html_only_message_has_no_plain_body() {
        let raw = parse_eml(HTML_ONLY.as_bytes(), "b.eml").unwrap();
        assert!(raw.plain_body.is_empty());
        assert!(raw.markup_body.contains("<p>Big sale</p>"));
        assert!(!raw.list_unsubscribe);
        assert_eq!(raw.sender, "promo@shop.example");
        assert_eq!(
            raw.timestamp,
            Some(Utc.with_ymd_and_hms(2024, 5, 14, 15, 0, 0).unwrap())
        );
    }

    #[test]
    fn unparsable_date_gives_no_timestamp() {
        let raw = parse_eml(BAD_DATE.as_bytes(), "c.eml").unwrap();
        assert_eq!(raw.subject, "Undated issue");
        assert!(raw.timestamp.is_none());
    }

    // ── Directory fetch ─────────────────────────────────────────────

    #[tokio::test]
    async fn fetches_eml_files_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = dir.path().join("INBOX");
        std::fs::create_dir(&inbox).unwrap();
        std::fs::write(inbox.join("2.eml"), HTML_ONLY).unwrap();
        std::fs::write(inbox.join("1.eml"), NEWSLETTER).unwrap();
        std::fs::write(inbox.join("notes.txt"), "not a message").unwrap();

        let source = EmlDirectorySource::new(dir.path());
        let since = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let batch = source.fetch(&query(since)).await.unwrap();

        let ids: Vec<&str> = batch.iter().map(|m| m.transport_id.as_str()).collect();
        assert_eq!(ids, vec!["1.eml", "2.eml"]);
    }

    #[tokio::test]
    async fn messages_before_since_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = dir.path().join("INBOX");
        std::fs::create_dir(&inbox).unwrap();
        std::fs::write(inbox.join("1.eml"), NEWSLETTER).unwrap();
        std::fs::write(inbox.join("2.eml"), HTML_ONLY).unwrap();

        let source = EmlDirectorySource::new(dir.path());
        let since = Utc.with_ymd_and_hms(2024, 5, 15, 0, 0, 0).unwrap();
        let batch = source.fetch(&query(since)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].transport_id, "1.eml");
    }

    #[tokio::test]
    async fn undated_messages_survive_the_since_filter() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = dir.path().join("INBOX");
        std::fs::create_dir(&inbox).unwrap();
        std::fs::write(inbox.join("1.eml"), BAD_DATE).unwrap();

        let source = EmlDirectorySource::new(dir.path());
        let batch = source.fetch(&query(Utc::now())).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch[0].timestamp.is_none());
    }

    #[tokio::test]
    async fn missing_mailbox_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = EmlDirectorySource::new(dir.path());
        let result = source.fetch(&query(Utc::now())).await;
        assert!(matches!(result, Err(SourceError::MailboxNotFound { .. })));
    }
}
