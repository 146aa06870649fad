//! Message identity and batch deduplication.

use std::collections::HashSet;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::pipeline::types::{AuditRecord, Disposition, MessageKey, RawMessage};

/// Identity of a message.
///
/// The `Message-ID` (angle brackets stripped) when present, otherwise the
/// SHA-256 hex of `subject|timestamp|plain body`. `None` when there is
/// nothing to identify the message by.
pub fn message_key(raw: &RawMessage) -> Option<MessageKey> {
    if let Some(id) = raw.message_id.as_deref().map(strip_angle_brackets)
        && !id.is_empty()
    {
        return Some(MessageKey::new(id));
    }

    if raw.subject.is_empty() && raw.timestamp.is_none() && raw.plain_body.is_empty() {
        return None;
    }

    let timestamp = raw.timestamp.map(|t| t.to_rfc3339()).unwrap_or_default();
    let digest = Sha256::digest(format!("{}|{}|{}", raw.subject, timestamp, raw.plain_body));
    Some(MessageKey::new(hex::encode(digest)))
}

fn strip_angle_brackets(id: &str) -> &str {
    id.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
}

/// A message that survived deduplication, tagged with its batch position.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub index: usize,
    pub key: MessageKey,
    pub raw: RawMessage,
}

/// Output of [`deduplicate`].
#[derive(Debug, Default)]
pub struct Deduplicated {
    /// Unique messages in batch order.
    pub unique: Vec<Candidate>,
    /// Audit records for discarded messages, with their batch positions.
    pub discarded: Vec<(usize, AuditRecord)>,
}

/// Collapse duplicate deliveries. The first occurrence of each key wins.
pub fn deduplicate(batch: Vec<RawMessage>) -> Deduplicated {
    let mut seen = HashSet::with_capacity(batch.len());
    let mut out = Deduplicated::default();

    for (index, raw) in batch.into_iter().enumerate() {
        let Some(key) = message_key(&raw) else {
            debug!(transport_id = %raw.transport_id, "Message has no identity, discarding");
            out.discarded
                .push((index, AuditRecord::new(&raw, None, Disposition::NoIdentity)));
            continue;
        };

        if !seen.insert(key.clone()) {
            debug!(key = %key, transport_id = %raw.transport_id, "Duplicate delivery, discarding");
            out.discarded
                .push((index, AuditRecord::new(&raw, Some(&key), Disposition::Duplicate)));
            continue;
        }

        out.unique.push(Candidate { index, key, raw });
    }

    out
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn msg(transport_id: &str, message_id: Option<&str>, subject: &str) -> RawMessage {
        RawMessage {
            transport_id: transport_id.into(),
            message_id: message_id.map(String::from),
            subject: subject.into(),
            plain_body: format!("body of {subject}"),
            ..Default::default()
        }
    }

    fn keys(d: &Deduplicated) -> Vec<String> {
        d.unique.iter().map(|c| c.key.to_string()).collect()
    }

    // ── Keys ────────────────────────────────────────────────────────

    #[test]
    fn message_id_brackets_are_stripped() {
        let raw = msg("1", Some("  <abc@mail.example.com> "), "s");
        assert_eq!(message_key(&raw).unwrap().as_str(), "abc@mail.example.com");
    }

    #[test]
    fn missing_id_falls_back_to_content_hash() {
        let raw = msg("1", None, "Weekly");
        let key = message_key(&raw).unwrap();
        assert_eq!(key.as_str().len(), 64);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));

        let expected = hex::encode(Sha256::digest("Weekly||body of Weekly"));
        assert_eq!(key.as_str(), expected);
    }

    #[test]
    fn hash_includes_timestamp() {
        let mut a = msg("1", Some("<>"), "Weekly");
        let mut b = a.clone();
        a.timestamp = Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap());
        b.timestamp = Some(Utc.with_ymd_and_hms(2024, 5, 8, 8, 0, 0).unwrap());
        assert_ne!(message_key(&a), message_key(&b));
    }

    #[test]
    fn empty_message_has_no_identity() {
        let raw = RawMessage {
            transport_id: "9".into(),
            message_id: Some("  ".into()),
            ..Default::default()
        };
        assert!(message_key(&raw).is_none());
    }

    // ── Batch ───────────────────────────────────────────────────────

    #[test]
    fn first_occurrence_wins() {
        let batch = vec![
            msg("1", Some("<a@x>"), "first"),
            msg("2", Some("<b@x>"), "other"),
            msg("3", Some("a@x"), "second copy"),
        ];
        let d = deduplicate(batch);
        assert_eq!(keys(&d), vec!["a@x", "b@x"]);
        assert_eq!(d.unique[0].raw.subject, "first");
        assert_eq!(d.discarded.len(), 1);
        assert_eq!(d.discarded[0].0, 2);
        assert_eq!(d.discarded[0].1.disposition, Disposition::Duplicate);
    }

    #[test]
    fn no_identity_messages_are_discarded() {
        let batch = vec![RawMessage::default(), msg("2", Some("<b@x>"), "s")];
        let d = deduplicate(batch);
        assert_eq!(d.unique.len(), 1);
        assert_eq!(d.unique[0].index, 1);
        assert_eq!(d.discarded[0].1.disposition, Disposition::NoIdentity);
    }

    #[test]
    fn deduplication_is_idempotent() {
        let batch = vec![
            msg("1", Some("<a@x>"), "a"),
            msg("2", None, "hashed"),
            msg("3", Some("<a@x>"), "dup"),
            msg("4", None, "hashed"),
        ];
        let once = deduplicate(batch);
        let again = deduplicate(once.unique.iter().map(|c| c.raw.clone()).collect());
        assert_eq!(keys(&once), keys(&again));
        assert!(again.discarded.is_empty());
    }

    #[test]
    fn duplicate_position_does_not_matter() {
        let a = msg("1", Some("<a@x>"), "a");
        let b = msg("2", Some("<b@x>"), "b");
        let front = deduplicate(vec![a.clone(), a.clone(), b.clone()]);
        let back = deduplicate(vec![a.clone(), b.clone(), a.clone()]);
        assert_eq!(keys(&front), keys(&back));
    }
}
