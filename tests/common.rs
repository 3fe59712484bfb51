//! Common test harness utilities for integration tests.
//!
//! Builds gateways wired to the loopback transport so connection
//! lifecycle, mapping, and delivery can be exercised without a broker.

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use twinlink::config::Config;
use twinlink::connections::model::{
    Connection, ConnectionType, ConnectivityStatus, FilteredTopic, Source, Target,
};
use twinlink::core::time::SystemClock;
use twinlink::mapping::registry::MapperRegistry;
use twinlink::protocol::signal::{
    Channel, EntityId, Signal, SubscriptionTopic, TopicCriterion, TopicPath,
};
use twinlink::runtime::Gateway;
use twinlink::transports::loopback::LoopbackState;
use twinlink::transports::TransportRegistry;

/// Gateway on `dir` with the loopback transport handling every
/// connection type, tuned for fast tests.
pub fn gateway_at(dir: &Path) -> (Gateway<SystemClock>, Arc<LoopbackState>) {
    let state = LoopbackState::new();
    let mut transports = TransportRegistry::defaults();
    state.register_everywhere(&mut transports);
    let mut config = Config::default();
    config.storage.data_dir = dir.to_path_buf();
    config.client.connect_timeout_ms = 300;
    config.client.connect_retries = 2;
    config.client.backoff_min_ms = 10;
    config.client.backoff_max_ms = 50;
    config.client.ack_timeout_ms = 300;
    let gateway = Gateway::with_registries(
        config,
        SystemClock,
        None,
        transports,
        MapperRegistry::builtin(),
    )
    .expect("gateway construction");
    (gateway, state)
}

pub fn mqtt_connection(id: &str, status: ConnectivityStatus) -> Connection {
    Connection::new(id, ConnectionType::Mqtt5, status, "tcp://broker.local:1883")
}

/// A target subscribed to twin events, authorized for `subject:reader`.
pub fn reader_target(address: &str) -> Target {
    Target::new(address)
        .with_authorization(vec!["subject:reader".to_string()])
        .with_topics(vec![FilteredTopic::new(SubscriptionTopic::TwinEvents)])
}

pub fn device_source(address: &str) -> Source {
    Source::new(vec![address.to_string()])
        .with_authorization(vec!["subject:device".to_string()])
}

pub fn twin_event(subject: &str) -> Signal {
    Signal::new(
        TopicPath::new(
            &EntityId::new("org.acme", "device-7"),
            Channel::Twin,
            TopicCriterion::Events,
            "modified",
        ),
        serde_json::json!({"attributes": {"level": 4}}),
    )
    .with_read_subjects(vec![subject.to_string()])
}

/// Poll until `check` holds or the deadline passes.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline");
}
