//! Recovery and persistence integration tests.

mod common;

use common::{gateway_at, mqtt_connection, reader_target, wait_until};
use std::sync::atomic::Ordering;
use twinlink::connections::events::{ConnectionState, ConnectivityEvent, EventPayload};
use twinlink::connections::model::{ConnectionLifecycle, ConnectivityStatus};
use tempfile::tempdir;

#[tokio::test]
async fn replaying_to_deleted_terminates_and_blocks_access() {
    let dir = tempdir().unwrap();
    {
        let (gateway, _state) = gateway_at(dir.path());
        let service = gateway.service();
        service
            .create_connection(mqtt_connection("c1", ConnectivityStatus::Open))
            .await
            .unwrap();
        service.delete_connection("c1").await.unwrap();
    }

    let (gateway, state) = gateway_at(dir.path());
    assert_eq!(gateway.recover().await.unwrap(), 1);
    // The tombstone answers nothing and never starts a live session.
    let err = gateway.service().retrieve_connection("c1").await.unwrap_err();
    assert_eq!(err.code, "connectivity:connection.not.accessible");
    assert!(gateway.service().open_connection("c1").await.is_err());
    assert_eq!(state.connect_attempts.load(Ordering::Relaxed), 0);
}

#[test]
fn replayed_tombstone_keeps_last_connection_value() {
    // Replay determinism at the fold level: the snapshot equals the last
    // non-deleted connection with only the lifecycle overwritten.
    let connection = mqtt_connection("c1", ConnectivityStatus::Open);
    let events = vec![
        ConnectivityEvent::new(1, EventPayload::Created { connection: connection.clone() }),
        ConnectivityEvent::new(2, EventPayload::Closed),
        ConnectivityEvent::new(3, EventPayload::Deleted),
    ];
    let state = ConnectionState::replay(&events);
    assert!(state.is_deleted());
    let tombstone = state.connection.unwrap();
    assert_eq!(tombstone.lifecycle, ConnectionLifecycle::Deleted);
    assert_eq!(tombstone.uri, connection.uri);
    assert_eq!(tombstone.status, ConnectivityStatus::Closed);

    // Replaying the same sequence again reconstructs the same state.
    assert_eq!(ConnectionState::replay(&events), ConnectionState::replay(&events));
}

#[tokio::test]
async fn recovered_open_connection_reconnects_automatically() {
    let dir = tempdir().unwrap();
    {
        let (gateway, state) = gateway_at(dir.path());
        let mut connection = mqtt_connection("c1", ConnectivityStatus::Closed);
        connection.targets = vec![reader_target("telemetry/out")];
        gateway.service().create_connection(connection).await.unwrap();
        gateway.service().open_connection("c1").await.unwrap();
        assert_eq!(state.connect_attempts.load(Ordering::Relaxed), 1);
    }

    let (gateway, state) = gateway_at(dir.path());
    gateway.recover().await.unwrap();
    wait_until(|| state.connect_attempts.load(Ordering::Relaxed) >= 1).await;
    let retrieved = gateway.service().retrieve_connection("c1").await.unwrap();
    assert_eq!(retrieved.status, ConnectivityStatus::Open);
}

#[tokio::test]
async fn closed_connection_answers_metrics_without_session() {
    let dir = tempdir().unwrap();
    let (gateway, state) = gateway_at(dir.path());
    gateway
        .service()
        .create_connection(mqtt_connection("c1", ConnectivityStatus::Closed))
        .await
        .unwrap();

    let metrics = gateway.service().retrieve_metrics("c1").await.unwrap();
    assert!(metrics.is_zero());
    let status = gateway.service().retrieve_status("c1").await.unwrap();
    assert_eq!(status.status, Some(ConnectivityStatus::Closed));
    // The broker session factory was never invoked.
    assert_eq!(state.connect_attempts.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn cleanup_persistence_compacts_the_journal() {
    let dir = tempdir().unwrap();
    let (gateway, _state) = gateway_at(dir.path());
    let service = gateway.service();
    service
        .create_connection(mqtt_connection("c1", ConnectivityStatus::Closed))
        .await
        .unwrap();
    service.open_connection("c1").await.unwrap();
    service.close_connection("c1").await.unwrap();

    let removed = service.cleanup_persistence("c1").await.unwrap();
    assert_eq!(removed, 3);
    // State is intact after compaction.
    let retrieved = service.retrieve_connection("c1").await.unwrap();
    assert_eq!(retrieved.status, ConnectivityStatus::Closed);

    // A second cleanup has nothing left to drop.
    assert_eq!(service.cleanup_persistence("c1").await.unwrap(), 0);
}

#[tokio::test]
async fn modify_survives_restart() {
    let dir = tempdir().unwrap();
    {
        let (gateway, _state) = gateway_at(dir.path());
        gateway
            .service()
            .create_connection(mqtt_connection("c1", ConnectivityStatus::Closed))
            .await
            .unwrap();
        let mut modified = mqtt_connection("c1", ConnectivityStatus::Closed);
        modified.uri = "tcp://other.local:1883".to_string();
        gateway.service().modify_connection(modified).await.unwrap();
    }

    let (gateway, _state) = gateway_at(dir.path());
    gateway.recover().await.unwrap();
    let retrieved = gateway.service().retrieve_connection("c1").await.unwrap();
    assert_eq!(retrieved.uri, "tcp://other.local:1883");
}
