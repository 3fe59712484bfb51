//! External wire message value.
//!
//! The broker-facing counterpart of the internal signal: headers plus a
//! text or byte payload. Immutable once constructed; header filters and
//! mappers produce new copies.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// Content type of upstream "nothing changed" notifications; such payloads
/// carry no signal and are dropped before any mapper runs.
pub const EMPTY_NOTIFICATION_CONTENT_TYPE: &str = "application/vnd.twinlink.empty-notification";

/// Message payload, text or bytes, mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePayload {
    Text(String),
    Bytes(Bytes),
}

impl MessagePayload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Bytes(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// External wire message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalMessage {
    headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<MessagePayload>,
    /// Topic path string carried alongside the payload, if the wire
    /// protocol exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    topic_path: Option<String>,
    /// Ordered mapper ids requested for this message; empty means the
    /// connection default.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    payload_mapping: Vec<String>,
    /// Source address the message was consumed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_address: Option<String>,
}

impl ExternalMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_text_payload(mut self, text: impl Into<String>) -> Self {
        self.payload = Some(MessagePayload::Text(text.into()));
        self
    }

    pub fn with_bytes_payload(mut self, bytes: impl Into<Bytes>) -> Self {
        self.payload = Some(MessagePayload::Bytes(bytes.into()));
        self
    }

    pub fn with_topic_path(mut self, topic_path: impl Into<String>) -> Self {
        self.topic_path = Some(topic_path.into());
        self
    }

    pub fn with_payload_mapping(mut self, mapping: Vec<String>) -> Self {
        self.payload_mapping = mapping;
        self
    }

    pub fn with_source_address(mut self, address: impl Into<String>) -> Self {
        self.source_address = Some(address.into());
        self
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Case-insensitive header lookup; wire protocols disagree on casing.
    pub fn find_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn payload(&self) -> Option<&MessagePayload> {
        self.payload.as_ref()
    }

    pub fn text_payload(&self) -> Option<&str> {
        self.payload.as_ref().and_then(MessagePayload::as_text)
    }

    pub fn topic_path(&self) -> Option<&str> {
        self.topic_path.as_deref()
    }

    pub fn payload_mapping(&self) -> &[String] {
        &self.payload_mapping
    }

    pub fn source_address(&self) -> Option<&str> {
        self.source_address.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.find_header(CONTENT_TYPE_HEADER)
    }

    pub fn is_empty_notification(&self) -> bool {
        self.content_type()
            .map(|ct| ct.eq_ignore_ascii_case(EMPTY_NOTIFICATION_CONTENT_TYPE))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Header filters
// ---------------------------------------------------------------------------

/// Keep-or-drop header projection producing a new message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderFilter {
    /// Keep only the named headers.
    Include(BTreeSet<String>),
    /// Keep everything except the named headers.
    Exclude(BTreeSet<String>),
}

impl HeaderFilter {
    fn keeps(&self, header: &str) -> bool {
        let named = |set: &BTreeSet<String>| set.iter().any(|h| h.eq_ignore_ascii_case(header));
        match self {
            Self::Include(set) => named(set),
            Self::Exclude(set) => !named(set),
        }
    }

    pub fn apply(&self, message: &ExternalMessage) -> ExternalMessage {
        let mut filtered = message.clone();
        filtered.headers = message
            .headers
            .iter()
            .filter(|(name, _)| self.keeps(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        filtered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ExternalMessage {
        ExternalMessage::new()
            .with_header("Content-Type", "application/json")
            .with_header("device-id", "ns:thing-1")
            .with_header("x-trace", "abc")
            .with_text_payload("{}")
    }

    #[test]
    fn test_find_header_ignores_case() {
        let msg = sample();
        assert_eq!(msg.find_header("content-type"), Some("application/json"));
        assert_eq!(msg.find_header("CONTENT-TYPE"), Some("application/json"));
        assert_eq!(msg.find_header("missing"), None);
    }

    #[test]
    fn test_empty_notification_detection() {
        let msg = ExternalMessage::new()
            .with_header(CONTENT_TYPE_HEADER, EMPTY_NOTIFICATION_CONTENT_TYPE);
        assert!(msg.is_empty_notification());
        assert!(!sample().is_empty_notification());
    }

    #[test]
    fn test_exclude_and_complement_include_round_trip() {
        let msg = sample();
        let excluded: BTreeSet<String> = ["device-id".to_string()].into_iter().collect();
        let complement: BTreeSet<String> = msg
            .headers()
            .keys()
            .filter(|k| !excluded.contains(*k))
            .cloned()
            .collect();

        let without = HeaderFilter::Exclude(excluded.clone()).apply(&msg);
        assert!(without.find_header("device-id").is_none());

        // Excluding S is the same projection as including its complement.
        let kept = HeaderFilter::Include(complement).apply(&msg);
        assert_eq!(kept.headers(), without.headers());

        // The two complementary projections union back to the original set.
        let only_excluded = HeaderFilter::Include(excluded).apply(&msg);
        let mut union = without.headers().clone();
        union.extend(
            only_excluded
                .headers()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        assert_eq!(&union, msg.headers());
    }

    #[test]
    fn test_filter_does_not_touch_payload() {
        let msg = sample();
        let filtered = HeaderFilter::Exclude(BTreeSet::new()).apply(&msg);
        assert_eq!(filtered.text_payload(), msg.text_payload());
        assert_eq!(filtered.headers(), msg.headers());
    }
}
