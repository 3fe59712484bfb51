//! Per-target signal filtering.
//!
//! Given a connection's configured targets and an outbound signal, compute
//! the subset of targets authorized and topically matched to receive it.
//! Pure function; targets are evaluated independently with no cross-target
//! precedence, and the input target order is preserved.

use crate::connections::model::{Connection, FilteredTopic, Target};
use crate::protocol::signal::Signal;
use crate::routing::rql;
use serde_json::Value;

/// Resolve an RQL field path against a signal, with optional enrichment
/// fields taking precedence.
fn signal_field(signal: &Signal, extra: Option<&Value>, path: &str) -> Option<Value> {
    if path == "thingId" {
        return Some(Value::String(signal.entity_id.to_string()));
    }
    let pointer = format!("/{path}");
    if let Some(extra) = extra {
        if let Some(value) = extra.pointer(&pointer) {
            return Some(value.clone());
        }
    }
    signal.payload.pointer(&pointer).cloned()
}

fn topic_matches(filtered: &FilteredTopic, signal: &Signal, extra: Option<&Value>) -> bool {
    if !filtered.topic.covers(&signal.topic) {
        return false;
    }
    if !filtered.namespaces.is_empty()
        && !filtered.namespaces.contains(&signal.entity_id.namespace)
    {
        return false;
    }
    match &filtered.filter {
        Some(filter) => match rql::parse(filter) {
            Ok(expr) => expr.eval(&|path| signal_field(signal, extra, path)),
            // Filters are validated at configuration time; an unparseable
            // filter at runtime excludes the topic.
            Err(_) => false,
        },
        None => true,
    }
}

/// Whether a single target should receive the signal.
pub fn target_matches(target: &Target, signal: &Signal, extra: Option<&Value>) -> bool {
    // A target with an empty authorization context never matches.
    if target.authorization.is_empty() {
        return false;
    }
    if !target.authorization.intersects(&signal.read_subjects) {
        return false;
    }
    target
        .topics
        .iter()
        .any(|filtered| topic_matches(filtered, signal, extra))
}

/// Targets of `connection` authorized and subscribed for `signal`.
pub fn filter_targets<'a>(
    connection: &'a Connection,
    signal: &Signal,
    extra: Option<&Value>,
) -> Vec<&'a Target> {
    connection
        .targets
        .iter()
        .filter(|target| target_matches(target, signal, extra))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::model::{ConnectionType, ConnectivityStatus};
    use crate::protocol::signal::{
        Channel, EntityId, SubscriptionTopic, TopicCriterion, TopicPath,
    };
    use serde_json::json;

    fn event_signal() -> Signal {
        Signal::new(
            TopicPath::new(
                &EntityId::new("org.acme", "device-7"),
                Channel::Twin,
                TopicCriterion::Events,
                "modified",
            ),
            json!({"attributes": {"level": 4}}),
        )
        .with_read_subjects(vec!["subject:reader".to_string()])
    }

    fn target() -> Target {
        Target::new("telemetry/out")
            .with_authorization(vec!["subject:reader".to_string()])
            .with_topics(vec![FilteredTopic::new(SubscriptionTopic::TwinEvents)])
    }

    fn connection(targets: Vec<Target>) -> Connection {
        Connection::new(
            "c1",
            ConnectionType::Mqtt5,
            ConnectivityStatus::Open,
            "tcp://broker.local:1883",
        )
        .with_targets(targets)
    }

    #[test]
    fn test_authorized_subscribed_target_matches() {
        let conn = connection(vec![target()]);
        let matched = filter_targets(&conn, &event_signal(), None);
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn test_disjoint_subjects_do_not_match() {
        let conn = connection(vec![
            target().with_authorization(vec!["subject:other".to_string()])
        ]);
        assert!(filter_targets(&conn, &event_signal(), None).is_empty());
    }

    #[test]
    fn test_empty_authorization_fails_closed() {
        let conn = connection(vec![Target::new("t")
            .with_topics(vec![FilteredTopic::new(SubscriptionTopic::TwinEvents)])]);
        assert!(filter_targets(&conn, &event_signal(), None).is_empty());
    }

    #[test]
    fn test_namespace_restriction() {
        let restricted = target().with_topics(vec![FilteredTopic::new(
            SubscriptionTopic::TwinEvents,
        )
        .with_namespaces(vec!["org.other".to_string()])]);
        assert!(filter_targets(&connection(vec![restricted]), &event_signal(), None).is_empty());

        let allowed = target().with_topics(vec![FilteredTopic::new(SubscriptionTopic::TwinEvents)
            .with_namespaces(vec!["org.acme".to_string()])]);
        assert_eq!(
            filter_targets(&connection(vec![allowed]), &event_signal(), None).len(),
            1
        );
    }

    #[test]
    fn test_rql_filter_excludes_non_matching() {
        let filtered = target().with_topics(vec![FilteredTopic::new(
            SubscriptionTopic::TwinEvents,
        )
        .with_filter("gt(attributes/level,10)")]);
        assert!(filter_targets(&connection(vec![filtered]), &event_signal(), None).is_empty());

        let matching = target().with_topics(vec![FilteredTopic::new(SubscriptionTopic::TwinEvents)
            .with_filter("gt(attributes/level,3)")]);
        assert_eq!(
            filter_targets(&connection(vec![matching]), &event_signal(), None).len(),
            1
        );
    }

    #[test]
    fn test_filter_is_pure_and_deterministic() {
        let conn = connection(vec![target(), target().with_authorization(vec![])]);
        let signal = event_signal();
        let first = filter_targets(&conn, &signal, None);
        let second = filter_targets(&conn, &signal, None);
        let addresses: Vec<&str> = first.iter().map(|t| t.address.as_str()).collect();
        let addresses_again: Vec<&str> = second.iter().map(|t| t.address.as_str()).collect();
        assert_eq!(addresses, addresses_again);
    }

    #[test]
    fn test_enrichment_fields_visible_to_filter() {
        let enriched = target().with_topics(vec![FilteredTopic::new(SubscriptionTopic::TwinEvents)
            .with_filter(r#"eq(location,"kitchen")"#)]);
        let conn = connection(vec![enriched]);
        let extra = json!({"location": "kitchen"});
        assert_eq!(
            filter_targets(&conn, &event_signal(), Some(&extra)).len(),
            1
        );
        assert!(filter_targets(&conn, &event_signal(), None).is_empty());
    }
}
