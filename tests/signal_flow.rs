//! End-to-end signal mapping and delivery tests.

mod common;

use common::{device_source, gateway_at, mqtt_connection, reader_target, twin_event, wait_until};
use serde_json::json;
use std::sync::atomic::Ordering;
use twinlink::connections::model::{ConnectivityStatus, Enforcement, FilteredTopic, MapperDefinition};
use twinlink::mapping::mapper::{ProtocolJsonMapper, DUPLICATE_INDEX_HEADER};
use twinlink::mapping::mapper::MessageMapper;
use twinlink::protocol::signal::{
    Acknowledgement, AckLabel, SubscriptionTopic, TopicCriterion, CORRELATION_ID_HEADER,
    REQUESTED_ACKS_HEADER,
};
use tempfile::tempdir;

#[tokio::test]
async fn authorized_event_reaches_exactly_one_target() {
    let dir = tempdir().unwrap();
    let (gateway, state) = gateway_at(dir.path());

    let mut connection = mqtt_connection("c1", ConnectivityStatus::Open);
    connection.targets = vec![reader_target("telemetry/out")];
    gateway.service().create_connection(connection).await.unwrap();
    wait_until(|| gateway.broker().subscriber_count() == 1).await;

    // Matching read subject: exactly one publish.
    assert_eq!(gateway.publish_signal(&twin_event("subject:reader")), 1);
    wait_until(|| state.published_addresses() == vec!["telemetry/out".to_string()]).await;

    // Disjoint subject set: nothing leaves the gateway.
    assert_eq!(gateway.publish_signal(&twin_event("subject:other")), 0);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(state.published_addresses().len(), 1);
}

#[tokio::test]
async fn duplicating_mapper_emits_three_signals() {
    let dir = tempdir().unwrap();
    let (mut gateway, state) = gateway_at(dir.path());

    let mut connection = mqtt_connection("c1", ConnectivityStatus::Open);
    connection.sources = vec![
        device_source("telemetry/in").with_payload_mapping(vec!["triple".to_string()])
    ];
    connection.mapping_definitions = [(
        "triple".to_string(),
        MapperDefinition::new("duplicator").with_option("count", json!(3)),
    )]
    .into_iter()
    .collect();
    gateway.service().create_connection(connection).await.unwrap();
    wait_until(|| state.connect_attempts.load(Ordering::Relaxed) >= 1).await;

    let wire = ProtocolJsonMapper
        .map_outbound(&twin_event("subject:reader"))
        .unwrap()
        .remove(0)
        .with_source_address("telemetry/in");
    assert!(state.inject_inbound(wire));

    let mut signals = Vec::new();
    for _ in 0..3 {
        signals.push(gateway.next_forwarded().await.unwrap());
    }
    // Structurally identical except the mapper-assigned duplicate index.
    for (index, signal) in signals.iter().enumerate() {
        assert_eq!(
            signal.headers.get(DUPLICATE_INDEX_HEADER),
            Some(index.to_string().as_str())
        );
        assert_eq!(signal.topic, signals[0].topic);
        assert_eq!(signal.payload, signals[0].payload);
    }
    let metrics = gateway.service().retrieve_metrics("c1").await.unwrap();
    assert_eq!(metrics.consumed, 1);
    assert_eq!(metrics.mapped_inbound, 3);
}

#[tokio::test]
async fn spoofed_identity_is_rejected_with_error_response() {
    let dir = tempdir().unwrap();
    let (gateway, state) = gateway_at(dir.path());

    let mut connection = mqtt_connection("c1", ConnectivityStatus::Open);
    connection.sources = vec![device_source("telemetry/in")
        .with_enforcement(Enforcement {
            input: "{{ header:device-id }}".to_string(),
            filters: vec!["{{ thing:id }}".to_string()],
        })
        .with_reply_target("errors/out")];
    gateway.service().create_connection(connection).await.unwrap();
    wait_until(|| state.connect_attempts.load(Ordering::Relaxed) >= 1).await;

    let wire = ProtocolJsonMapper
        .map_outbound(&twin_event("subject:reader"))
        .unwrap()
        .remove(0)
        .with_source_address("telemetry/in")
        .with_header("device-id", "org.evil:device-7");
    assert!(state.inject_inbound(wire));

    // The violation is answered on the reply target, not forwarded.
    wait_until(|| state.published_addresses() == vec!["errors/out".to_string()]).await;
    let published = state.published.lock();
    let (_, response) = &published[0];
    let payload = response.text_payload().unwrap();
    assert!(payload.contains("connectivity:connection.id.enforcement.failed"));
    drop(published);

    let metrics = gateway.service().retrieve_metrics("c1").await.unwrap();
    assert_eq!(metrics.enforcement_failures, 1);
    assert_eq!(metrics.mapped_inbound, 0);
}

#[tokio::test]
async fn filtered_target_with_issued_ack_resolves_weakly() {
    let dir = tempdir().unwrap();
    let (mut gateway, state) = gateway_at(dir.path());

    let mut connection = mqtt_connection("c1", ConnectivityStatus::Open);
    connection.targets = vec![
        reader_target("telemetry/out").with_issued_ack(AckLabel::from("delivered")),
        reader_target("alerts/out")
            .with_topics(vec![FilteredTopic::new(SubscriptionTopic::TwinEvents)
                .with_filter("gt(attributes/level,10)")])
            .with_issued_ack(AckLabel::from("alerted")),
    ];
    gateway.service().create_connection(connection).await.unwrap();
    wait_until(|| gateway.broker().subscriber_count() == 1).await;

    let mut signal = twin_event("subject:reader");
    signal.headers.put(REQUESTED_ACKS_HEADER, "delivered,alerted");
    signal.headers.put(CORRELATION_ID_HEADER, "corr-7");
    assert_eq!(gateway.publish_signal(&signal), 1);

    let mut acks = Vec::new();
    for _ in 0..2 {
        let response = gateway.next_forwarded().await.unwrap();
        assert_eq!(response.topic.criterion, TopicCriterion::Acks);
        assert_eq!(response.correlation_id(), Some("corr-7"));
        acks.push(serde_json::from_value::<Acknowledgement>(response.payload).unwrap());
    }
    acks.sort_by(|a, b| a.label.as_str().cmp(b.label.as_str()));
    // The filtered-out target resolved with a synthetic weak success so
    // the requester is not left waiting; the published one is real.
    assert_eq!(acks[0].label.as_str(), "alerted");
    assert!(acks[0].weak);
    assert!(acks[0].is_success());
    assert_eq!(acks[1].label.as_str(), "delivered");
    assert!(!acks[1].weak);

    // Only the matching target actually published.
    assert_eq!(state.published_addresses(), vec!["telemetry/out".to_string()]);
}

#[tokio::test]
async fn publish_failure_converts_to_failed_ack() {
    let dir = tempdir().unwrap();
    let (mut gateway, state) = gateway_at(dir.path());

    let mut connection = mqtt_connection("c1", ConnectivityStatus::Open);
    connection.targets =
        vec![reader_target("telemetry/out").with_issued_ack(AckLabel::from("delivered"))];
    gateway.service().create_connection(connection).await.unwrap();
    wait_until(|| gateway.broker().subscriber_count() == 1).await;

    *state.publish_failure.lock() = Some(
        twinlink::protocol::error::GatewayError::connection_failed("broker refused"),
    );
    let mut signal = twin_event("subject:reader");
    signal.headers.put(REQUESTED_ACKS_HEADER, "delivered");
    gateway.publish_signal(&signal);

    let response = gateway.next_forwarded().await.unwrap();
    let ack: Acknowledgement = serde_json::from_value(response.payload).unwrap();
    assert!(!ack.is_success());
    assert_eq!(ack.status, 502);

    let metrics = gateway.service().retrieve_metrics("c1").await.unwrap();
    assert_eq!(metrics.failed_publishes, 1);
    assert_eq!(metrics.published, 0);
}

#[tokio::test]
async fn target_grouping_shares_mapper_invocations() {
    let dir = tempdir().unwrap();
    let (gateway, state) = gateway_at(dir.path());

    // Three targets, two distinct mapper chains: the default chain group
    // publishes one mapped message to two addresses, the raw chain its own.
    let mut connection = mqtt_connection("c1", ConnectivityStatus::Open);
    connection.targets = vec![
        reader_target("out/a"),
        reader_target("out/b"),
        reader_target("out/raw").with_payload_mapping(vec!["raw".to_string()]),
    ];
    gateway.service().create_connection(connection).await.unwrap();
    wait_until(|| gateway.broker().subscriber_count() == 1).await;

    gateway.publish_signal(&twin_event("subject:reader"));
    wait_until(|| state.published_addresses().len() == 3).await;

    let published = state.published.lock();
    let envelope_a = published.iter().find(|(a, _)| a == "out/a").unwrap();
    let envelope_b = published.iter().find(|(a, _)| a == "out/b").unwrap();
    let raw = published.iter().find(|(a, _)| a == "out/raw").unwrap();
    // Same group, same mapped message.
    assert_eq!(envelope_a.1.text_payload(), envelope_b.1.text_payload());
    // The raw chain produced a different wire shape.
    assert_ne!(raw.1.text_payload(), envelope_a.1.text_payload());
}
