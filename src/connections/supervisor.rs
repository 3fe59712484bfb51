//! Per-connection supervisor actor and canonical registry.
//!
//! Each connection id resolves to at most one live actor process-wide; the
//! registry is the seam where a cluster sharding layer would sit. The
//! actor is the single authoritative owner of the connection's persisted
//! configuration: it replays the journal on spawn, folds every accepted
//! command into a persisted event, and supervises the client state machine
//! owning the live session. Validation failures passivate the actor
//! without persisting anything; a fresh instance picks up the persisted
//! state on next contact.

use crate::connections::client::{
    run_test_connection, ClientContext, ClientHandle, ClientSettings, ClientState, ExtraProvider,
};
use crate::connections::events::{ConnectionState, ConnectivityEvent, EventPayload};
use crate::connections::logs::{ConnectionLogger, LogEntry};
use crate::connections::metrics::{ConnectionMetrics, ConnectionMetricsSnapshot};
use crate::connections::model::{Connection, ConnectionLifecycle, ConnectivityStatus};
use crate::mapping::pipeline::MappingPipeline;
use crate::mapping::registry::MapperRegistry;
use crate::protocol::error::{ErrorKind, GatewayError};
use crate::protocol::signal::Signal;
use crate::routing::pubsub::SignalBroker;
use crate::storage::journal::ConnectionJournal;
use crate::transports::TransportRegistry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

type Reply<T> = oneshot::Sender<Result<T, GatewayError>>;

/// Commands a connection actor consumes, each with a typed reply.
pub enum ConnectionCommand {
    Create { connection: Connection, reply: Reply<Connection> },
    Modify { connection: Connection, reply: Reply<Connection> },
    Open { reply: Reply<()> },
    Close { reply: Reply<()> },
    Delete { reply: Reply<()> },
    Retrieve { reply: Reply<Connection> },
    RetrieveStatus { reply: Reply<ConnectionStatusReport> },
    RetrieveMetrics { reply: Reply<ConnectionMetricsSnapshot> },
    ResetMetrics { reply: Reply<()> },
    RetrieveLogs { reply: Reply<Vec<LogEntry>> },
    EnableLogs { reply: Reply<()> },
    ResetLogs { reply: Reply<()> },
    CleanupPersistence { reply: Reply<u64> },
}

/// Answer to `RetrieveConnectionStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatusReport {
    pub id: String,
    /// Desired status from persisted state; absent for unknown connections.
    pub status: Option<ConnectivityStatus>,
    pub lifecycle: Option<ConnectionLifecycle>,
    /// Live session state; `disconnected` for closed connections, which
    /// never start a client just to answer this.
    pub live: ClientState,
}

/// Shared collaborators every connection actor is wired with.
#[derive(Clone)]
pub struct GatewayContext {
    pub journal: ConnectionJournal,
    pub transports: TransportRegistry,
    pub mappers: MapperRegistry,
    pub broker: SignalBroker,
    pub forwarder: mpsc::UnboundedSender<Signal>,
    pub settings: ClientSettings,
    pub blocked_hosts: Arc<Vec<String>>,
    /// Snapshot cadence in persisted events.
    pub snapshot_every: u64,
    pub log_capacity: usize,
    pub extra: Option<ExtraProvider>,
}

enum Flow {
    Continue,
    Passivate,
}

struct ConnectionActor {
    id: String,
    ctx: GatewayContext,
    state: ConnectionState,
    client: Option<ClientHandle>,
    metrics: Arc<ConnectionMetrics>,
    logger: Arc<ConnectionLogger>,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    events_since_snapshot: u64,
}

impl ConnectionActor {
    fn new(id: String, ctx: GatewayContext, commands: mpsc::UnboundedReceiver<ConnectionCommand>) -> Self {
        let log_capacity = ctx.log_capacity;
        Self {
            id,
            ctx,
            state: ConnectionState::default(),
            client: None,
            metrics: Arc::new(ConnectionMetrics::default()),
            logger: Arc::new(ConnectionLogger::new(log_capacity)),
            commands,
            events_since_snapshot: 0,
        }
    }

    async fn run(mut self) {
        match self.ctx.journal.replay(&self.id).await {
            Ok(state) => self.state = state,
            Err(err) => {
                warn!(connection = %self.id, "recovery failed: {err:#}");
            }
        }
        // A replayed tombstone terminates the instance right after
        // recovery; queued commands are answered not-accessible.
        if self.state.is_deleted() {
            debug!(connection = %self.id, "recovered as deleted, terminating");
            while let Ok(cmd) = self.commands.try_recv() {
                reply_not_accessible(&self.id, cmd);
            }
            return;
        }
        if self.state.desired_open() {
            match self.start_client() {
                Ok(client) => client.open_detached(),
                Err(error) => {
                    warn!(connection = %self.id, %error, "client start after recovery failed");
                }
            }
        }
        while let Some(cmd) = self.commands.recv().await {
            match self.handle(cmd).await {
                Flow::Continue => {}
                Flow::Passivate => break,
            }
        }
        self.stop_client().await;
    }

    async fn handle(&mut self, cmd: ConnectionCommand) -> Flow {
        match cmd {
            ConnectionCommand::Create { connection, reply } => {
                if self.state.connection.is_some() {
                    let _ = reply.send(Err(GatewayError::connection_conflict(&self.id)));
                    return Flow::Continue;
                }
                if let Err(error) = self.validate(&connection) {
                    let _ = reply.send(Err(error));
                    return Flow::Passivate;
                }
                if let Err(error) = self
                    .persist(EventPayload::Created { connection: connection.clone() })
                    .await
                {
                    let _ = reply.send(Err(error));
                    return Flow::Continue;
                }
                info!(connection = %self.id, "connection created");
                let _ = reply.send(Ok(connection.clone()));
                // Connecting is fire-and-forget; failures never fail the
                // create response.
                if connection.status == ConnectivityStatus::Open {
                    match self.start_client() {
                        Ok(client) => client.open_detached(),
                        Err(error) => {
                            warn!(connection = %self.id, %error, "client start after create failed");
                        }
                    }
                }
                Flow::Continue
            }
            ConnectionCommand::Modify { connection, reply } => {
                if self.state.connection.is_none() {
                    let _ = reply.send(Err(GatewayError::connection_not_accessible(&self.id)));
                    return Flow::Continue;
                }
                if let Err(error) = self.validate(&connection) {
                    let _ = reply.send(Err(error));
                    return Flow::Passivate;
                }
                // Never reconfigure a running session in place; close the
                // current instance, persist, reopen under the new config.
                self.stop_client().await;
                if let Err(error) = self
                    .persist(EventPayload::Modified { connection: connection.clone() })
                    .await
                {
                    let _ = reply.send(Err(error));
                    return Flow::Continue;
                }
                if self.state.desired_open() {
                    match self.open_client().await {
                        Ok(()) => {
                            let _ = reply.send(Ok(connection));
                        }
                        Err(error) => {
                            let _ = reply.send(Err(error));
                        }
                    }
                } else {
                    let _ = reply.send(Ok(connection));
                }
                Flow::Continue
            }
            ConnectionCommand::Open { reply } => {
                if self.state.connection.is_none() {
                    let _ = reply.send(Err(GatewayError::connection_not_accessible(&self.id)));
                    return Flow::Continue;
                }
                match self.open_client().await {
                    Ok(()) => {
                        // Desired status moves only on success, so a
                        // transient failure cannot drift persisted state.
                        if let Err(error) = self.persist(EventPayload::Opened).await {
                            let _ = reply.send(Err(error));
                            return Flow::Continue;
                        }
                        let _ = reply.send(Ok(()));
                        Flow::Continue
                    }
                    Err(error) if error.kind == ErrorKind::Validation => {
                        let _ = reply.send(Err(error));
                        Flow::Passivate
                    }
                    Err(error) => {
                        let _ = reply.send(Err(error));
                        Flow::Continue
                    }
                }
            }
            ConnectionCommand::Close { reply } => {
                if self.state.connection.is_none() {
                    let _ = reply.send(Err(GatewayError::connection_not_accessible(&self.id)));
                    return Flow::Continue;
                }
                if let Some(client) = &self.client {
                    if let Err(error) = client.close().await {
                        let _ = reply.send(Err(error));
                        return Flow::Continue;
                    }
                }
                self.stop_client().await;
                if let Err(error) = self.persist(EventPayload::Closed).await {
                    let _ = reply.send(Err(error));
                    return Flow::Continue;
                }
                let _ = reply.send(Ok(()));
                Flow::Continue
            }
            ConnectionCommand::Delete { reply } => {
                if self.state.connection.is_none() {
                    let _ = reply.send(Err(GatewayError::connection_not_accessible(&self.id)));
                    return Flow::Continue;
                }
                if let Err(error) = self.persist(EventPayload::Deleted).await {
                    let _ = reply.send(Err(error));
                    return Flow::Continue;
                }
                self.stop_client().await;
                info!(connection = %self.id, "connection deleted");
                let _ = reply.send(Ok(()));
                Flow::Passivate
            }
            ConnectionCommand::Retrieve { reply } => {
                let _ = reply.send(
                    self.state
                        .connection
                        .clone()
                        .ok_or_else(|| GatewayError::connection_not_accessible(&self.id)),
                );
                Flow::Continue
            }
            ConnectionCommand::RetrieveStatus { reply } => {
                let live = match &self.client {
                    Some(client) => client.state().await,
                    None => ClientState::Disconnected,
                };
                let report = ConnectionStatusReport {
                    id: self.id.clone(),
                    status: self.state.connection.as_ref().map(|c| c.status),
                    lifecycle: self.state.connection.as_ref().map(|c| c.lifecycle),
                    live,
                };
                let _ = reply.send(Ok(report));
                Flow::Continue
            }
            ConnectionCommand::RetrieveMetrics { reply } => {
                let _ = reply.send(Ok(self.metrics.snapshot()));
                Flow::Continue
            }
            ConnectionCommand::ResetMetrics { reply } => {
                self.metrics.reset();
                let _ = reply.send(Ok(()));
                Flow::Continue
            }
            ConnectionCommand::RetrieveLogs { reply } => {
                let _ = reply.send(Ok(self.logger.entries()));
                Flow::Continue
            }
            ConnectionCommand::EnableLogs { reply } => {
                self.logger.enable();
                let _ = reply.send(Ok(()));
                Flow::Continue
            }
            ConnectionCommand::ResetLogs { reply } => {
                self.logger.reset();
                let _ = reply.send(Ok(()));
                Flow::Continue
            }
            ConnectionCommand::CleanupPersistence { reply } => {
                let result = async {
                    self.ctx
                        .journal
                        .snapshot(&self.id, &self.state)
                        .await
                        .map_err(|e| GatewayError::internal(format!("snapshot: {e:#}")))?;
                    self.ctx
                        .journal
                        .cleanup(&self.id)
                        .await
                        .map_err(|e| GatewayError::internal(format!("cleanup: {e:#}")))
                }
                .await;
                if result.is_ok() {
                    self.events_since_snapshot = 0;
                }
                let _ = reply.send(result);
                Flow::Continue
            }
        }
    }

    /// Structural and mapper validation; failures are fatal to this
    /// instance and never persisted.
    fn validate(&self, connection: &Connection) -> Result<(), GatewayError> {
        if connection.id != self.id {
            return Err(GatewayError::configuration_invalid(format!(
                "connection id '{}' does not match the addressed id '{}'",
                connection.id, self.id
            )));
        }
        connection.validate(&self.ctx.blocked_hosts)?;
        MappingPipeline::for_connection(connection, &self.ctx.mappers).map(|_| ())
    }

    fn client_context(&self) -> ClientContext {
        ClientContext {
            settings: self.ctx.settings.clone(),
            broker: self.ctx.broker.clone(),
            forwarder: self.ctx.forwarder.clone(),
            metrics: Arc::clone(&self.metrics),
            logger: Arc::clone(&self.logger),
            extra: self.ctx.extra.clone(),
        }
    }

    /// Ensure a client worker exists for the current configuration.
    fn start_client(&mut self) -> Result<&ClientHandle, GatewayError> {
        if self.client.is_none() {
            let connection = self
                .state
                .connection
                .clone()
                .ok_or_else(|| GatewayError::connection_not_accessible(&self.id))?;
            let handle = ClientHandle::spawn(
                connection,
                &self.ctx.transports,
                &self.ctx.mappers,
                self.client_context(),
            )?;
            self.client = Some(handle);
        }
        self.client
            .as_ref()
            .ok_or_else(|| GatewayError::internal("client handle missing after start"))
    }

    async fn open_client(&mut self) -> Result<(), GatewayError> {
        self.start_client()?;
        match &self.client {
            Some(client) => client.open().await,
            None => Err(GatewayError::internal("client handle missing after start")),
        }
    }

    async fn stop_client(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.close().await;
            client.stop();
        }
    }

    async fn persist(&mut self, payload: EventPayload) -> Result<(), GatewayError> {
        let event = ConnectivityEvent::new(self.state.last_seq + 1, payload);
        self.ctx
            .journal
            .append(&self.id, &event)
            .await
            .map_err(|e| GatewayError::internal(format!("journal append: {e:#}")))?;
        self.state.apply(&event);
        self.events_since_snapshot += 1;
        if self.events_since_snapshot >= self.ctx.snapshot_every {
            match self.ctx.journal.snapshot(&self.id, &self.state).await {
                Ok(()) => self.events_since_snapshot = 0,
                Err(err) => warn!(connection = %self.id, "snapshot failed: {err:#}"),
            }
        }
        Ok(())
    }
}

fn reply_not_accessible(id: &str, cmd: ConnectionCommand) {
    let error = GatewayError::connection_not_accessible(id);
    match cmd {
        ConnectionCommand::Create { reply, .. } => drop(reply.send(Err(error))),
        ConnectionCommand::Modify { reply, .. } => drop(reply.send(Err(error))),
        ConnectionCommand::Open { reply } => drop(reply.send(Err(error))),
        ConnectionCommand::Close { reply } => drop(reply.send(Err(error))),
        ConnectionCommand::Delete { reply } => drop(reply.send(Err(error))),
        ConnectionCommand::Retrieve { reply } => drop(reply.send(Err(error))),
        ConnectionCommand::RetrieveStatus { reply } => drop(reply.send(Err(error))),
        ConnectionCommand::RetrieveMetrics { reply } => drop(reply.send(Err(error))),
        ConnectionCommand::ResetMetrics { reply } => drop(reply.send(Err(error))),
        ConnectionCommand::RetrieveLogs { reply } => drop(reply.send(Err(error))),
        ConnectionCommand::EnableLogs { reply } => drop(reply.send(Err(error))),
        ConnectionCommand::ResetLogs { reply } => drop(reply.send(Err(error))),
        ConnectionCommand::CleanupPersistence { reply } => drop(reply.send(Err(error))),
    }
}

/// Canonical connection registry: resolves each connection id to its one
/// live actor, spawning (and recovering) it on first contact.
#[derive(Clone)]
pub struct ConnectionService {
    ctx: GatewayContext,
    actors: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<ConnectionCommand>>>>,
}

impl ConnectionService {
    pub fn new(ctx: GatewayContext) -> Self {
        Self {
            ctx,
            actors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Ensure an actor exists for the id, spawning and recovering one if
    /// needed. Used directly for post-restart recovery.
    pub fn activate(&self, id: &str) {
        self.mailbox(id);
    }

    fn mailbox(&self, id: &str) -> mpsc::UnboundedSender<ConnectionCommand> {
        let mut actors = self.actors.lock();
        if let Some(tx) = actors.get(id) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = ConnectionActor::new(id.to_string(), self.ctx.clone(), rx);
        tokio::spawn(actor.run());
        actors.insert(id.to_string(), tx.clone());
        tx
    }

    async fn send<T>(
        &self,
        id: &str,
        make: impl Fn(Reply<T>) -> ConnectionCommand,
    ) -> Result<T, GatewayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if let Err(unsent) = self.mailbox(id).send(make(reply_tx)) {
            // The actor raced to passivation; retry once on a fresh one.
            self.actors.lock().remove(id);
            if self.mailbox(id).send(unsent.0).is_err() {
                return Err(GatewayError::connection_not_accessible(id));
            }
        }
        // A dropped reply means the instance passivated (or recovered as a
        // tombstone) before answering.
        reply_rx
            .await
            .map_err(|_| GatewayError::connection_not_accessible(id))?
    }

    pub async fn create_connection(&self, connection: Connection) -> Result<Connection, GatewayError> {
        let id = connection.id.clone();
        self.send(&id, move |reply| ConnectionCommand::Create {
            connection: connection.clone(),
            reply,
        })
        .await
    }

    pub async fn modify_connection(&self, connection: Connection) -> Result<Connection, GatewayError> {
        let id = connection.id.clone();
        self.send(&id, move |reply| ConnectionCommand::Modify {
            connection: connection.clone(),
            reply,
        })
        .await
    }

    pub async fn open_connection(&self, id: &str) -> Result<(), GatewayError> {
        self.send(id, |reply| ConnectionCommand::Open { reply }).await
    }

    pub async fn close_connection(&self, id: &str) -> Result<(), GatewayError> {
        self.send(id, |reply| ConnectionCommand::Close { reply }).await
    }

    pub async fn delete_connection(&self, id: &str) -> Result<(), GatewayError> {
        self.send(id, |reply| ConnectionCommand::Delete { reply }).await
    }

    /// Validate and probe a connection in a transient session. Nothing is
    /// persisted and no actor state is touched.
    pub async fn test_connection(&self, connection: &Connection) -> Result<(), GatewayError> {
        connection.validate(&self.ctx.blocked_hosts)?;
        MappingPipeline::for_connection(connection, &self.ctx.mappers)?;
        run_test_connection(connection, &self.ctx.transports, self.ctx.settings.connect_timeout)
            .await
    }

    pub async fn retrieve_connection(&self, id: &str) -> Result<Connection, GatewayError> {
        self.send(id, |reply| ConnectionCommand::Retrieve { reply }).await
    }

    pub async fn retrieve_status(&self, id: &str) -> Result<ConnectionStatusReport, GatewayError> {
        self.send(id, |reply| ConnectionCommand::RetrieveStatus { reply })
            .await
    }

    pub async fn retrieve_metrics(
        &self,
        id: &str,
    ) -> Result<ConnectionMetricsSnapshot, GatewayError> {
        self.send(id, |reply| ConnectionCommand::RetrieveMetrics { reply })
            .await
    }

    pub async fn reset_metrics(&self, id: &str) -> Result<(), GatewayError> {
        self.send(id, |reply| ConnectionCommand::ResetMetrics { reply })
            .await
    }

    pub async fn retrieve_logs(&self, id: &str) -> Result<Vec<LogEntry>, GatewayError> {
        self.send(id, |reply| ConnectionCommand::RetrieveLogs { reply })
            .await
    }

    pub async fn enable_logs(&self, id: &str) -> Result<(), GatewayError> {
        self.send(id, |reply| ConnectionCommand::EnableLogs { reply })
            .await
    }

    pub async fn reset_logs(&self, id: &str) -> Result<(), GatewayError> {
        self.send(id, |reply| ConnectionCommand::ResetLogs { reply })
            .await
    }

    pub async fn cleanup_persistence(&self, id: &str) -> Result<u64, GatewayError> {
        self.send(id, |reply| ConnectionCommand::CleanupPersistence { reply })
            .await
    }
}
