//! Mapper contract and built-in mappers.
//!
//! A mapper converts an external wire message to zero or more internal
//! signals (inbound) or an internal signal to zero or more external
//! messages (outbound). Returning an empty list is a legitimate drop,
//! several entries duplicate, and an error is scoped to the one input.

use crate::connections::model::MapperDefinition;
use crate::protocol::error::GatewayError;
use crate::protocol::message::{ExternalMessage, CONTENT_TYPE_HEADER};
use crate::protocol::signal::{Signal, SignalHeaders, TopicPath};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Wire content type of the protocol envelope.
pub const ENVELOPE_CONTENT_TYPE: &str = "application/vnd.twinlink+json";

/// Header mappers use to mark duplicated copies apart.
pub const DUPLICATE_INDEX_HEADER: &str = "duplicate-index";

/// Mapper capability.
pub trait MessageMapper: Send + Sync {
    fn map_inbound(&self, message: &ExternalMessage) -> Result<Vec<Signal>, GatewayError>;
    fn map_outbound(&self, signal: &Signal) -> Result<Vec<ExternalMessage>, GatewayError>;
}

// ---------------------------------------------------------------------------
// Content type gate
// ---------------------------------------------------------------------------

/// Allow/block lists short-circuiting mapper invocation with a drop.
#[derive(Debug, Clone, Default)]
pub struct ContentTypeGate {
    allow: Vec<String>,
    block: Vec<String>,
}

impl ContentTypeGate {
    pub fn new(allow: Vec<String>, block: Vec<String>) -> Self {
        Self { allow, block }
    }

    pub fn permits(&self, content_type: Option<&str>) -> bool {
        let matched = |list: &[String]| {
            content_type
                .map(|ct| list.iter().any(|entry| entry.eq_ignore_ascii_case(ct)))
                .unwrap_or(false)
        };
        if matched(&self.block) {
            return false;
        }
        if self.allow.is_empty() {
            return true;
        }
        matched(&self.allow)
    }
}

// ---------------------------------------------------------------------------
// Protocol envelope
// ---------------------------------------------------------------------------

/// JSON envelope carried on the wire by the default mapper.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    topic: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extra: Option<Value>,
}

fn parse_envelope(mapper: &str, text: &str) -> Result<Signal, GatewayError> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|e| GatewayError::mapping_failed(mapper, format!("invalid envelope: {e}")))?;
    let topic = TopicPath::parse(&envelope.topic)?;
    let mut headers = SignalHeaders::new();
    for (name, value) in envelope.headers {
        headers.put(name, value);
    }
    let entity_id = topic.entity_id();
    Ok(Signal {
        topic,
        entity_id,
        headers,
        payload: envelope.value,
        read_subjects: Vec::new(),
    })
}

fn render_envelope(mapper: &str, signal: &Signal) -> Result<String, GatewayError> {
    let envelope = Envelope {
        topic: signal.topic.path(),
        headers: signal
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        value: signal.payload.clone(),
        extra: None,
    };
    serde_json::to_string(&envelope)
        .map_err(|e| GatewayError::mapping_failed(mapper, format!("envelope encode: {e}")))
}

// ---------------------------------------------------------------------------
// Built-in mappers
// ---------------------------------------------------------------------------

/// Default mapper translating the JSON protocol envelope.
pub struct ProtocolJsonMapper;

impl ProtocolJsonMapper {
    pub const ALIAS: &'static str = "protocol-json";
}

impl MessageMapper for ProtocolJsonMapper {
    fn map_inbound(&self, message: &ExternalMessage) -> Result<Vec<Signal>, GatewayError> {
        match message.text_payload() {
            Some(text) if !text.is_empty() => Ok(vec![parse_envelope(Self::ALIAS, text)?]),
            // No payload to map is a drop, not an error.
            _ => Ok(Vec::new()),
        }
    }

    fn map_outbound(&self, signal: &Signal) -> Result<Vec<ExternalMessage>, GatewayError> {
        let text = render_envelope(Self::ALIAS, signal)?;
        Ok(vec![ExternalMessage::new()
            .with_header(CONTENT_TYPE_HEADER, ENVELOPE_CONTENT_TYPE)
            .with_topic_path(signal.topic.path())
            .with_text_payload(text)])
    }
}

/// Passthrough mapper carrying the raw payload; the topic path must
/// travel beside the payload on the wire.
pub struct RawPayloadMapper;

impl RawPayloadMapper {
    pub const ALIAS: &'static str = "raw";
}

impl MessageMapper for RawPayloadMapper {
    fn map_inbound(&self, message: &ExternalMessage) -> Result<Vec<Signal>, GatewayError> {
        let Some(path) = message
            .topic_path()
            .map(str::to_string)
            .or_else(|| message.find_header("topic").map(str::to_string))
        else {
            return Err(GatewayError::mapping_failed(
                Self::ALIAS,
                "raw messages need a topic path or 'topic' header",
            ));
        };
        let topic = TopicPath::parse(&path)?;
        let payload = match message.text_payload() {
            Some(text) => serde_json::from_str(text)
                .unwrap_or_else(|_| Value::String(text.to_string())),
            None => return Ok(Vec::new()),
        };
        Ok(vec![Signal::new(topic, payload)])
    }

    fn map_outbound(&self, signal: &Signal) -> Result<Vec<ExternalMessage>, GatewayError> {
        let text = match &signal.payload {
            Value::String(text) => text.clone(),
            other => serde_json::to_string(other)
                .map_err(|e| GatewayError::mapping_failed(Self::ALIAS, e.to_string()))?,
        };
        Ok(vec![ExternalMessage::new()
            .with_header(CONTENT_TYPE_HEADER, "text/plain")
            .with_header("topic", signal.topic.path())
            .with_topic_path(signal.topic.path())
            .with_text_payload(text)])
    }
}

/// Envelope mapper emitting N structurally identical copies, told apart
/// only by the duplicate-index header.
pub struct DuplicatingMapper {
    count: usize,
}

impl DuplicatingMapper {
    pub const ALIAS: &'static str = "duplicator";

    pub fn from_definition(definition: &MapperDefinition) -> Result<Self, GatewayError> {
        let count = match definition.options.get("count") {
            Some(value) => value.as_u64().ok_or_else(|| {
                GatewayError::configuration_invalid("duplicator 'count' must be a positive integer")
            })? as usize,
            None => 2,
        };
        if count == 0 {
            return Err(GatewayError::configuration_invalid(
                "duplicator 'count' must be at least 1",
            ));
        }
        Ok(Self { count })
    }
}

impl MessageMapper for DuplicatingMapper {
    fn map_inbound(&self, message: &ExternalMessage) -> Result<Vec<Signal>, GatewayError> {
        let base = ProtocolJsonMapper.map_inbound(message)?;
        let mut signals = Vec::with_capacity(base.len() * self.count);
        for signal in base {
            for index in 0..self.count {
                let mut copy = signal.clone();
                copy.headers.put(DUPLICATE_INDEX_HEADER, index.to_string());
                signals.push(copy);
            }
        }
        Ok(signals)
    }

    fn map_outbound(&self, signal: &Signal) -> Result<Vec<ExternalMessage>, GatewayError> {
        let base = ProtocolJsonMapper.map_outbound(signal)?;
        let mut messages = Vec::with_capacity(base.len() * self.count);
        for message in base {
            for index in 0..self.count {
                messages.push(
                    message
                        .clone()
                        .with_header(DUPLICATE_INDEX_HEADER, index.to_string()),
                );
            }
        }
        Ok(messages)
    }
}
