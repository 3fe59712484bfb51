//! `{{ prefix:name }}` template token resolution.
//!
//! Pure substitution against pluggable named sources; no state. Sources
//! cover wire headers, thing identity, and the signal topic.

use crate::protocol::error::GatewayError;
use crate::protocol::signal::{EntityId, TopicPath};
use std::collections::BTreeMap;

/// A named resolution context.
pub trait PlaceholderSource: Sync {
    /// Prefix this source answers for, e.g. `header`.
    fn prefix(&self) -> &'static str;
    fn resolve(&self, name: &str) -> Option<String>;
}

/// Resolves `header:<name>` against wire message headers (case-insensitive).
pub struct HeaderSource<'a> {
    headers: &'a BTreeMap<String, String>,
}

impl<'a> HeaderSource<'a> {
    pub fn new(headers: &'a BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl PlaceholderSource for HeaderSource<'_> {
    fn prefix(&self) -> &'static str {
        "header"
    }

    fn resolve(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }
}

/// Resolves `thing:id|namespace|name` against an entity id.
pub struct ThingSource<'a> {
    id: &'a EntityId,
}

impl<'a> ThingSource<'a> {
    pub fn new(id: &'a EntityId) -> Self {
        Self { id }
    }
}

impl PlaceholderSource for ThingSource<'_> {
    fn prefix(&self) -> &'static str {
        "thing"
    }

    fn resolve(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.to_string()),
            "namespace" => Some(self.id.namespace.clone()),
            "name" => Some(self.id.name.clone()),
            _ => None,
        }
    }
}

/// Resolves `topic:<segment>` against a signal topic path.
pub struct TopicSource<'a> {
    topic: &'a TopicPath,
}

impl<'a> TopicSource<'a> {
    pub fn new(topic: &'a TopicPath) -> Self {
        Self { topic }
    }
}

impl PlaceholderSource for TopicSource<'_> {
    fn prefix(&self) -> &'static str {
        "topic"
    }

    fn resolve(&self, name: &str) -> Option<String> {
        match name {
            "full" => Some(self.topic.path()),
            "namespace" => Some(self.topic.namespace.clone()),
            "entityName" => Some(self.topic.entity_name.clone()),
            "channel" => Some(self.topic.channel.as_str().to_string()),
            "criterion" => Some(self.topic.criterion.as_str().to_string()),
            "action" => Some(self.topic.action.clone()),
            _ => None,
        }
    }
}

/// Whether a template contains any `{{ ... }}` token.
pub fn contains_placeholder(template: &str) -> bool {
    template
        .find("{{")
        .map(|start| template[start..].contains("}}"))
        .unwrap_or(false)
}

/// Template resolver over an ordered set of sources.
#[derive(Default)]
pub struct PlaceholderResolver<'a> {
    sources: Vec<&'a dyn PlaceholderSource>,
}

impl<'a> PlaceholderResolver<'a> {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: &'a dyn PlaceholderSource) -> Self {
        self.sources.push(source);
        self
    }

    fn resolve_token(&self, token: &str) -> Option<String> {
        let (prefix, name) = token.split_once(':')?;
        self.sources
            .iter()
            .find(|s| s.prefix() == prefix)
            .and_then(|s| s.resolve(name))
    }

    /// Substitute every token; any unresolved token is an error.
    pub fn resolve(&self, template: &str) -> Result<String, GatewayError> {
        let mut output = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            output.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| {
                GatewayError::configuration_invalid(format!(
                    "unterminated placeholder in '{template}'"
                ))
            })?;
            let token = after[..end].trim();
            let value = self
                .resolve_token(token)
                .ok_or_else(|| GatewayError::placeholder_unresolved(token))?;
            output.push_str(&value);
            rest = &after[end + 2..];
        }
        output.push_str(rest);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::signal::{Channel, TopicCriterion};

    #[test]
    fn test_resolve_thing_and_topic() {
        let id = EntityId::new("org.acme", "device-7");
        let topic = TopicPath::new(&id, Channel::Twin, TopicCriterion::Events, "modified");
        let thing = ThingSource::new(&id);
        let topic_src = TopicSource::new(&topic);
        let resolver = PlaceholderResolver::new()
            .with_source(&thing)
            .with_source(&topic_src);

        assert_eq!(
            resolver.resolve("devices/{{ thing:namespace }}/{{thing:name}}").unwrap(),
            "devices/org.acme/device-7"
        );
        assert_eq!(
            resolver.resolve("{{ topic:criterion }}/{{ topic:action }}").unwrap(),
            "events/modified"
        );
    }

    #[test]
    fn test_resolve_header_case_insensitive() {
        let mut headers = BTreeMap::new();
        headers.insert("Device-Id".to_string(), "org.acme:device-7".to_string());
        let source = HeaderSource::new(&headers);
        let resolver = PlaceholderResolver::new().with_source(&source);
        assert_eq!(
            resolver.resolve("{{ header:device-id }}").unwrap(),
            "org.acme:device-7"
        );
    }

    #[test]
    fn test_unresolved_token_errors() {
        let resolver = PlaceholderResolver::new();
        let err = resolver.resolve("{{ header:missing }}").unwrap_err();
        assert_eq!(err.code, "connectivity:placeholder.unresolved");
    }

    #[test]
    fn test_plain_template_passes_through() {
        let resolver = PlaceholderResolver::new();
        assert_eq!(resolver.resolve("telemetry/raw").unwrap(), "telemetry/raw");
        assert!(!contains_placeholder("telemetry/raw"));
        assert!(contains_placeholder("a/{{ thing:id }}"));
    }
}
