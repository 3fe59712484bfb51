//! Gateway runtime: wires the shared collaborators, recovers persisted
//! connections at startup, and routes signals between the platform core
//! and the per-connection actors.

use crate::connections::supervisor::{ConnectionService, GatewayContext};
use crate::core::config::Config;
use crate::core::time::Clock;
use crate::mapping::registry::MapperRegistry;
use crate::ops::telemetry::LogHandle;
use crate::protocol::signal::Signal;
use crate::routing::pubsub::SignalBroker;
use crate::storage::journal::ConnectionJournal;
use crate::transports::TransportRegistry;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use tracing_subscriber::filter::EnvFilter;

/// Unified gateway runtime: connection service, signal broker, and
/// shutdown handling.
pub struct Gateway<C: Clock> {
    config: Config,
    clock: C,
    service: ConnectionService,
    broker: SignalBroker,
    journal: ConnectionJournal,
    /// Inbound signals mapped by connections, destined for core
    /// processing.
    forwarded: mpsc::UnboundedReceiver<Signal>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    log_handle: Option<LogHandle>,
}

impl<C: Clock> Gateway<C> {
    pub fn new(config: Config, clock: C, log_handle: Option<LogHandle>) -> Result<Self> {
        Self::with_registries(
            config,
            clock,
            log_handle,
            TransportRegistry::defaults(),
            MapperRegistry::builtin(),
        )
    }

    /// Wire the gateway with explicit registries; the seam where broker
    /// client factories and dynamically configured mappers plug in.
    pub fn with_registries(
        config: Config,
        clock: C,
        log_handle: Option<LogHandle>,
        transports: TransportRegistry,
        mappers: MapperRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (forwarder, forwarded) = mpsc::unbounded_channel();
        let journal = ConnectionJournal::new(&config.storage.data_dir);
        let broker = SignalBroker::new();
        let ctx = GatewayContext {
            journal: journal.clone(),
            transports,
            mappers,
            broker: broker.clone(),
            forwarder,
            settings: config.client_settings(),
            blocked_hosts: Arc::new(config.security.blocked_hosts.clone()),
            snapshot_every: config.storage.snapshot_every,
            log_capacity: config.limits.log_capacity,
            extra: None,
        };
        let service = ConnectionService::new(ctx);
        Ok(Self {
            config,
            clock,
            service,
            broker,
            journal,
            forwarded,
            shutdown_tx,
            shutdown_rx,
            log_handle,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn service(&self) -> &ConnectionService {
        &self.service
    }

    /// The broker the platform core publishes live signals into.
    pub fn broker(&self) -> &SignalBroker {
        &self.broker
    }

    pub fn publish_signal(&self, signal: &Signal) -> usize {
        self.broker.publish(signal)
    }

    /// Next inbound signal a connection forwarded toward core processing.
    pub async fn next_forwarded(&mut self) -> Option<Signal> {
        self.forwarded.recv().await
    }

    /// Swap the reloadable log filter at runtime.
    pub fn set_log_level(&self, level: &str) -> Result<()> {
        let Some(handle) = &self.log_handle else {
            anyhow::bail!("telemetry was initialized without a reload handle");
        };
        let filter = EnvFilter::try_new(level)
            .map_err(|e| anyhow::anyhow!("invalid log level '{level}': {e}"))?;
        handle
            .reload(filter)
            .map_err(|e| anyhow::anyhow!("reload log filter: {e}"))
    }

    /// Spawn an actor for every connection present on disk. Each actor
    /// replays its own journal; deleted tombstones terminate themselves
    /// right after replay, open connections start their client.
    pub async fn recover(&self) -> Result<usize> {
        let ids = self.journal.list_connection_ids().await?;
        for id in &ids {
            self.service.activate(id);
        }
        Ok(ids.len())
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Recover persisted connections, then serve until shutdown or
    /// interrupt.
    pub async fn run(&mut self) -> Result<()> {
        let started = self.clock.now();
        let recovered = self.recover().await?;
        info!(
            recovered,
            elapsed_ms = self.clock.now().duration_since(started).as_millis() as u64,
            "gateway recovered persisted connections"
        );
        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => break,
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                    break;
                }
                signal = self.forwarded.recv() => match signal {
                    Some(signal) => {
                        // Core processing is an external collaborator; the
                        // gateway's job ends at handing the signal over.
                        debug!(topic = %signal.topic.path(), "signal forwarded to core");
                    }
                    None => break,
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::model::{Connection, ConnectionType, ConnectivityStatus};
    use crate::core::time::SystemClock;
    use crate::transports::loopback::LoopbackState;
    use tempfile::tempdir;

    fn gateway(dir: &std::path::Path) -> (Gateway<SystemClock>, std::sync::Arc<LoopbackState>) {
        let state = LoopbackState::new();
        let mut transports = TransportRegistry::defaults();
        state.register_everywhere(&mut transports);
        let mut config = Config::default();
        config.storage.data_dir = dir.to_path_buf();
        let gateway = Gateway::with_registries(
            config,
            SystemClock,
            None,
            transports,
            MapperRegistry::builtin(),
        )
        .unwrap();
        (gateway, state)
    }

    #[tokio::test]
    async fn test_recover_spawns_persisted_connections() {
        let dir = tempdir().unwrap();
        {
            let (gateway, _state) = gateway(dir.path());
            gateway
                .service()
                .create_connection(Connection::new(
                    "c1",
                    ConnectionType::Mqtt5,
                    ConnectivityStatus::Closed,
                    "tcp://broker.local:1883",
                ))
                .await
                .unwrap();
        }
        let (gateway, _state) = gateway(dir.path());
        assert_eq!(gateway.recover().await.unwrap(), 1);
        let retrieved = gateway.service().retrieve_connection("c1").await.unwrap();
        assert_eq!(retrieved.status, ConnectivityStatus::Closed);
    }

    #[tokio::test]
    async fn test_empty_data_dir_recovers_nothing() {
        let dir = tempdir().unwrap();
        let (gateway, _state) = gateway(dir.path());
        assert_eq!(gateway.recover().await.unwrap(), 0);
    }
}
