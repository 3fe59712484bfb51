//! Connection lifecycle integration tests.

mod common;

use common::{gateway_at, mqtt_connection, reader_target, wait_until};
use std::sync::atomic::Ordering;
use twinlink::connections::client::ClientState;
use twinlink::connections::model::{ConnectivityStatus, Target};
use tempfile::tempdir;

#[tokio::test]
async fn open_then_close_runs_one_session() {
    let dir = tempdir().unwrap();
    let (gateway, state) = gateway_at(dir.path());
    let service = gateway.service();
    service
        .create_connection(mqtt_connection("c1", ConnectivityStatus::Closed))
        .await
        .unwrap();

    service.open_connection("c1").await.unwrap();
    let status = service.retrieve_status("c1").await.unwrap();
    assert_eq!(status.live, ClientState::Connected);
    assert_eq!(status.status, Some(ConnectivityStatus::Open));

    service.close_connection("c1").await.unwrap();
    let status = service.retrieve_status("c1").await.unwrap();
    assert_eq!(status.live, ClientState::Disconnected);
    assert_eq!(status.status, Some(ConnectivityStatus::Closed));

    assert_eq!(
        *state.lifecycle.lock(),
        vec!["connect".to_string(), "disconnect".to_string()]
    );
}

#[tokio::test]
async fn modify_while_open_closes_then_reopens() {
    let dir = tempdir().unwrap();
    let (gateway, state) = gateway_at(dir.path());
    let service = gateway.service();

    let mut connection = mqtt_connection("c1", ConnectivityStatus::Open);
    connection.targets = vec![reader_target("telemetry/out")];
    service.create_connection(connection).await.unwrap();
    wait_until(|| state.connect_attempts.load(Ordering::Relaxed) >= 1).await;

    let mut modified = mqtt_connection("c1", ConnectivityStatus::Open);
    modified.targets = vec![reader_target("telemetry/v2"), Target::new("audit/out")];
    service.modify_connection(modified).await.unwrap();

    // The session restarted under the new configuration: close before
    // reopen, and the modify reply only came back after the reopen.
    assert_eq!(
        *state.lifecycle.lock(),
        vec![
            "connect".to_string(),
            "disconnect".to_string(),
            "connect".to_string()
        ]
    );
    let retrieved = service.retrieve_connection("c1").await.unwrap();
    assert_eq!(retrieved.targets.len(), 2);
    assert_eq!(
        service.retrieve_status("c1").await.unwrap().live,
        ClientState::Connected
    );
}

#[tokio::test]
async fn modify_closed_connection_stays_closed() {
    let dir = tempdir().unwrap();
    let (gateway, state) = gateway_at(dir.path());
    let service = gateway.service();
    service
        .create_connection(mqtt_connection("c1", ConnectivityStatus::Closed))
        .await
        .unwrap();

    let mut modified = mqtt_connection("c1", ConnectivityStatus::Closed);
    modified.targets = vec![reader_target("telemetry/out")];
    service.modify_connection(modified).await.unwrap();
    assert_eq!(state.connect_attempts.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn failed_open_does_not_move_desired_status() {
    let dir = tempdir().unwrap();
    let (gateway, state) = gateway_at(dir.path());
    let service = gateway.service();
    service
        .create_connection(mqtt_connection("c1", ConnectivityStatus::Closed))
        .await
        .unwrap();

    state.fail_next_connects(vec![
        twinlink::connections::client::ConnectionFailure::connectivity("broker down", None),
    ]);
    let err = service.open_connection("c1").await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(
        service.retrieve_connection("c1").await.unwrap().status,
        ConnectivityStatus::Closed
    );
}

#[tokio::test]
async fn test_connection_probes_without_touching_state() {
    let dir = tempdir().unwrap();
    let (gateway, state) = gateway_at(dir.path());
    let service = gateway.service();

    let probe = mqtt_connection("probe", ConnectivityStatus::Closed);
    service.test_connection(&probe).await.unwrap();
    assert_eq!(
        *state.lifecycle.lock(),
        vec!["connect".to_string(), "disconnect".to_string()]
    );
    // The tested connection was never created.
    assert!(service.retrieve_connection("probe").await.is_err());
}

#[tokio::test]
async fn blocked_host_is_rejected_on_create_and_test() {
    let dir = tempdir().unwrap();
    let state = twinlink::transports::loopback::LoopbackState::new();
    let mut transports = twinlink::transports::TransportRegistry::defaults();
    state.register_everywhere(&mut transports);
    let mut config = twinlink::config::Config::default();
    config.storage.data_dir = dir.path().to_path_buf();
    config.security.blocked_hosts = vec!["broker.local".to_string()];
    let gateway = twinlink::runtime::Gateway::with_registries(
        config,
        twinlink::core::time::SystemClock,
        None,
        transports,
        twinlink::mapping::registry::MapperRegistry::builtin(),
    )
    .unwrap();

    let connection = mqtt_connection("c1", ConnectivityStatus::Closed);
    let err = gateway.service().create_connection(connection.clone()).await.unwrap_err();
    assert_eq!(err.code, "connectivity:connection.host.blocked");
    let err = gateway.service().test_connection(&connection).await.unwrap_err();
    assert_eq!(err.code, "connectivity:connection.host.blocked");
}
