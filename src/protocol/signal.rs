//! Internal signal envelope.
//!
//! A signal is the internal protocol value representing a command, event,
//! message, or response exchanged between platform components. The payload
//! stays an opaque JSON value; the gateway only reads the envelope
//! (topic path, headers, entity id, read subjects).

use crate::protocol::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Header carrying the acknowledgements the requester expects.
pub const REQUESTED_ACKS_HEADER: &str = "requested-acks";
/// Header correlating responses across hops.
pub const CORRELATION_ID_HEADER: &str = "correlation-id";
/// Header naming the address error responses should be delivered to.
pub const REPLY_TO_HEADER: &str = "reply-to";

// ---------------------------------------------------------------------------
// Entity identity
// ---------------------------------------------------------------------------

/// Namespaced entity id of the form `namespace:name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub namespace: String,
    pub name: String,
}

impl EntityId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn parse(value: &str) -> Result<Self, GatewayError> {
        match value.split_once(':') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => {
                Ok(Self::new(ns, name))
            }
            _ => Err(GatewayError::configuration_invalid(format!(
                "entity id '{value}' is not of the form namespace:name"
            ))),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

// ---------------------------------------------------------------------------
// Topic path
// ---------------------------------------------------------------------------

/// Signal channel: persisted twin or live interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Twin,
    Live,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Twin => "twin",
            Self::Live => "live",
        }
    }
}

/// Topic criterion segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicCriterion {
    Commands,
    Events,
    Messages,
    Errors,
    Acks,
}

impl TopicCriterion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commands => "commands",
            Self::Events => "events",
            Self::Messages => "messages",
            Self::Errors => "errors",
            Self::Acks => "acks",
        }
    }
}

/// Structured topic path `namespace/name/things/<channel>/<criterion>/<action>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicPath {
    pub namespace: String,
    pub entity_name: String,
    pub channel: Channel,
    pub criterion: TopicCriterion,
    pub action: String,
}

impl TopicPath {
    const GROUP: &'static str = "things";

    pub fn new(
        entity_id: &EntityId,
        channel: Channel,
        criterion: TopicCriterion,
        action: impl Into<String>,
    ) -> Self {
        Self {
            namespace: entity_id.namespace.clone(),
            entity_name: entity_id.name.clone(),
            channel,
            criterion,
            action: action.into(),
        }
    }

    pub fn entity_id(&self) -> EntityId {
        EntityId::new(self.namespace.clone(), self.entity_name.clone())
    }

    pub fn path(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}/{}",
            self.namespace,
            self.entity_name,
            Self::GROUP,
            self.channel.as_str(),
            self.criterion.as_str(),
            self.action
        )
    }

    pub fn parse(path: &str) -> Result<Self, GatewayError> {
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() != 6 || parts[2] != Self::GROUP {
            return Err(GatewayError::configuration_invalid(format!(
                "topic path '{path}' is not of the form ns/name/things/channel/criterion/action"
            )));
        }
        let channel = match parts[3] {
            "twin" => Channel::Twin,
            "live" => Channel::Live,
            other => {
                return Err(GatewayError::configuration_invalid(format!(
                    "unknown channel '{other}' in topic path"
                )))
            }
        };
        let criterion = match parts[4] {
            "commands" => TopicCriterion::Commands,
            "events" => TopicCriterion::Events,
            "messages" => TopicCriterion::Messages,
            "errors" => TopicCriterion::Errors,
            "acks" => TopicCriterion::Acks,
            other => {
                return Err(GatewayError::configuration_invalid(format!(
                    "unknown criterion '{other}' in topic path"
                )))
            }
        };
        Ok(Self {
            namespace: parts[0].to_string(),
            entity_name: parts[1].to_string(),
            channel,
            criterion,
            action: parts[5].to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Subscription topics
// ---------------------------------------------------------------------------

/// Coarse topic classes a target can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubscriptionTopic {
    TwinEvents,
    LiveEvents,
    LiveMessages,
    LiveCommands,
}

impl SubscriptionTopic {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TwinEvents => "twin-events",
            Self::LiveEvents => "live-events",
            Self::LiveMessages => "live-messages",
            Self::LiveCommands => "live-commands",
        }
    }

    /// Whether a concrete signal topic falls under this subscription class.
    pub fn covers(self, topic: &TopicPath) -> bool {
        match self {
            Self::TwinEvents => {
                topic.channel == Channel::Twin && topic.criterion == TopicCriterion::Events
            }
            Self::LiveEvents => {
                topic.channel == Channel::Live && topic.criterion == TopicCriterion::Events
            }
            Self::LiveMessages => {
                topic.channel == Channel::Live && topic.criterion == TopicCriterion::Messages
            }
            Self::LiveCommands => {
                topic.channel == Channel::Live && topic.criterion == TopicCriterion::Commands
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Signal headers: an ordered string map with typed accessors for the
/// handful of headers the gateway interprets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalHeaders(BTreeMap<String, String>);

impl SignalHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn put(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.get(CORRELATION_ID_HEADER)
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.get(REPLY_TO_HEADER)
    }

    /// Acknowledgement labels the requester expects, comma-separated.
    pub fn requested_acks(&self) -> Vec<AckLabel> {
        self.get(REQUESTED_ACKS_HEADER)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(AckLabel::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Acknowledgements
// ---------------------------------------------------------------------------

/// Label naming one acknowledgement party.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AckLabel(String);

impl AckLabel {
    /// Conventional label for in-band live responses; never weak-acked.
    pub const LIVE_RESPONSE: &'static str = "live-response";

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_live_response(&self) -> bool {
        self.0 == Self::LIVE_RESPONSE
    }
}

impl From<&str> for AckLabel {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AckLabel {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for AckLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single party's answer for one signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub label: AckLabel,
    pub entity_id: EntityId,
    /// HTTP-status-like outcome.
    pub status: u16,
    #[serde(default)]
    pub headers: SignalHeaders,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Synthesized, non-authoritative success issued when the signal never
    /// reached the target's publish step.
    #[serde(default)]
    pub weak: bool,
}

impl Acknowledgement {
    pub fn success(label: AckLabel, entity_id: EntityId) -> Self {
        Self {
            label,
            entity_id,
            status: 200,
            headers: SignalHeaders::new(),
            payload: None,
            weak: false,
        }
    }

    pub fn weak_success(label: AckLabel, entity_id: EntityId) -> Self {
        let mut ack = Self::success(label, entity_id);
        ack.weak = true;
        ack
    }

    pub fn failed(label: AckLabel, entity_id: EntityId, error: &GatewayError) -> Self {
        Self {
            label,
            entity_id,
            status: error.status,
            headers: SignalHeaders::new(),
            payload: Some(serde_json::json!({
                "code": error.code,
                "message": error.message,
            })),
            weak: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status < 400
    }
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// Internal protocol envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub topic: TopicPath,
    pub entity_id: EntityId,
    #[serde(default)]
    pub headers: SignalHeaders,
    /// Opaque payload; the gateway never interprets it beyond filtering.
    pub payload: serde_json::Value,
    /// Authorization subjects allowed to read this signal.
    #[serde(default)]
    pub read_subjects: Vec<String>,
}

impl Signal {
    pub fn new(topic: TopicPath, payload: serde_json::Value) -> Self {
        let entity_id = topic.entity_id();
        Self {
            topic,
            entity_id,
            headers: SignalHeaders::new(),
            payload,
            read_subjects: Vec::new(),
        }
    }

    pub fn with_headers(mut self, headers: SignalHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_read_subjects(mut self, subjects: Vec<String>) -> Self {
        self.read_subjects = subjects;
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.correlation_id()
    }

    /// Error response signal answering this one.
    pub fn error_response(&self, error: &GatewayError) -> Signal {
        let mut headers = SignalHeaders::new();
        if let Some(corr) = self.correlation_id() {
            headers.put(CORRELATION_ID_HEADER, corr);
        }
        Signal {
            topic: TopicPath::new(
                &self.entity_id,
                self.topic.channel,
                TopicCriterion::Errors,
                "error",
            ),
            entity_id: self.entity_id.clone(),
            headers,
            payload: serde_json::to_value(error).unwrap_or_default(),
            read_subjects: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_parse() {
        let id = EntityId::parse("org.acme:device-7").unwrap();
        assert_eq!(id.namespace, "org.acme");
        assert_eq!(id.name, "device-7");
        assert!(EntityId::parse("no-colon").is_err());
        assert!(EntityId::parse(":empty-ns").is_err());
    }

    #[test]
    fn test_topic_path_round_trip() {
        let topic = TopicPath::new(
            &EntityId::new("org.acme", "device-7"),
            Channel::Twin,
            TopicCriterion::Events,
            "modified",
        );
        let parsed = TopicPath::parse(&topic.path()).unwrap();
        assert_eq!(parsed, topic);
    }

    #[test]
    fn test_subscription_topic_covers() {
        let twin_event = TopicPath::new(
            &EntityId::new("ns", "t"),
            Channel::Twin,
            TopicCriterion::Events,
            "modified",
        );
        assert!(SubscriptionTopic::TwinEvents.covers(&twin_event));
        assert!(!SubscriptionTopic::LiveEvents.covers(&twin_event));
        assert!(!SubscriptionTopic::LiveMessages.covers(&twin_event));
    }

    #[test]
    fn test_requested_acks_header() {
        let headers = SignalHeaders::new().with(REQUESTED_ACKS_HEADER, "custom-ack, live-response");
        let acks = headers.requested_acks();
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[0].as_str(), "custom-ack");
        assert!(acks[1].is_live_response());
    }

    #[test]
    fn test_error_response_carries_correlation() {
        let signal = Signal::new(
            TopicPath::new(
                &EntityId::new("ns", "t"),
                Channel::Live,
                TopicCriterion::Commands,
                "modify",
            ),
            serde_json::json!({}),
        )
        .with_headers(SignalHeaders::new().with(CORRELATION_ID_HEADER, "c-9"));
        let response = signal.error_response(&GatewayError::enforcement_rejected("dev-1"));
        assert_eq!(response.topic.criterion, TopicCriterion::Errors);
        assert_eq!(response.correlation_id(), Some("c-9"));
    }
}
