//! Client connection state machine.
//!
//! One worker task per live connection owns the wire session. It moves
//! through DISCONNECTED, CONNECTING, CONNECTED, and DISCONNECTING,
//! retries timed-out connects with bounded exponential backoff, and
//! treats an abnormal socket close like a failed open. The worker holds
//! a read-only copy of the connection and never mutates shared state;
//! status changes reach the supervisor as command replies.

use crate::connections::logs::{ConnectionLogger, LogCategory};
use crate::connections::metrics::ConnectionMetrics;
use crate::connections::model::{Connection, Source, Target};
use crate::delivery::collector::ResponseCollector;
use crate::delivery::sending::{DeliveryMonitor, Dropped, Sending};
use crate::mapping::pipeline::{MappedOutboundMessage, MappingPipeline};
use crate::mapping::registry::MapperRegistry;
use crate::mapping::{MappingOutcome, OutboundSignal};
use crate::protocol::error::GatewayError;
use crate::protocol::message::{ExternalMessage, HeaderFilter};
use crate::protocol::signal::{
    AckLabel, Acknowledgement, EntityId, Signal, TopicCriterion, TopicPath,
    CORRELATION_ID_HEADER, REPLY_TO_HEADER, REQUESTED_ACKS_HEADER,
};
use crate::routing::enforcement;
use crate::routing::filter;
use crate::routing::placeholder::{HeaderSource, PlaceholderResolver, ThingSource, TopicSource};
use crate::routing::pubsub::SignalBroker;
use crate::transports::{AckRequest, Transport, TransportContext, TransportEvent, TransportRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Classified failure reported by a transport's connect attempt.
///
/// Validation failures (blocked host, bad credentials format, rejected TLS
/// material) are fatal and reported immediately; connectivity failures are
/// transient and retried with backoff.
#[derive(Debug, Clone)]
pub struct ConnectionFailure {
    fatal: bool,
    pub description: String,
    pub cause: Option<GatewayError>,
}

impl ConnectionFailure {
    pub fn validation(description: impl Into<String>, cause: Option<GatewayError>) -> Self {
        Self {
            fatal: true,
            description: description.into(),
            cause,
        }
    }

    pub fn connectivity(description: impl Into<String>, cause: Option<GatewayError>) -> Self {
        Self {
            fatal: false,
            description: description.into(),
            cause,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn into_error(self) -> GatewayError {
        match self.cause {
            Some(cause) => cause,
            None if self.fatal => GatewayError::configuration_invalid(self.description),
            None => GatewayError::connection_failed(self.description),
        }
    }
}

/// Live session state of a client worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ClientState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        }
    }
}

/// Timing knobs for the client state machine.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    /// Automatic retries after a connect timeout or abnormal close.
    pub connect_retries: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub ack_timeout: Duration,
    pub max_payload_bytes: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            connect_retries: 5,
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(10),
            max_payload_bytes: 256 * 1024,
        }
    }
}

fn backoff_delay(settings: &ClientSettings, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.min(16);
    settings
        .backoff_min
        .saturating_mul(factor)
        .min(settings.backoff_max)
}

/// Side lookup for enrichment fields, keyed by entity id.
pub type ExtraProvider = Arc<dyn Fn(&EntityId) -> Option<Value> + Send + Sync>;

/// Everything a client worker shares with its supervisor.
#[derive(Clone)]
pub struct ClientContext {
    pub settings: ClientSettings,
    pub broker: SignalBroker,
    pub forwarder: mpsc::UnboundedSender<Signal>,
    pub metrics: Arc<ConnectionMetrics>,
    pub logger: Arc<ConnectionLogger>,
    pub extra: Option<ExtraProvider>,
}

enum ClientCommand {
    Open {
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
    Close {
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
    State {
        reply: oneshot::Sender<ClientState>,
    },
    Stop,
}

/// Handle to a spawned client worker.
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<ClientCommand>,
}

impl ClientHandle {
    /// Instantiate the mapping pipeline and transport and start the worker.
    /// Construction failures are configuration errors surfaced to the
    /// caller before any task is spawned.
    pub fn spawn(
        connection: Connection,
        transports: &TransportRegistry,
        mappers: &MapperRegistry,
        ctx: ClientContext,
    ) -> Result<Self, GatewayError> {
        let pipeline = MappingPipeline::for_connection(&connection, mappers)?;
        let transport = transports.create(&connection)?;
        let (tx, commands) = mpsc::unbounded_channel();
        let worker = ClientWorker {
            connection,
            transport,
            pipeline,
            ctx,
            state: ClientState::Disconnected,
            stopping: false,
            commands,
            events: None,
            signals: None,
        };
        tokio::spawn(worker.run());
        Ok(Self { tx })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, GatewayError>>) -> ClientCommand,
    ) -> Result<T, GatewayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .map_err(|_| GatewayError::internal("client worker is stopped"))?;
        reply_rx
            .await
            .map_err(|_| GatewayError::internal("client worker dropped the reply"))?
    }

    pub async fn open(&self) -> Result<(), GatewayError> {
        self.request(|reply| ClientCommand::Open { reply }).await
    }

    /// Fire-and-forget open; the outcome is observable only through the
    /// session state and logs.
    pub fn open_detached(&self) {
        let (reply_tx, _reply_rx) = oneshot::channel();
        let _ = self.tx.send(ClientCommand::Open { reply: reply_tx });
    }

    pub async fn close(&self) -> Result<(), GatewayError> {
        self.request(|reply| ClientCommand::Close { reply }).await
    }

    pub async fn state(&self) -> ClientState {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(ClientCommand::State { reply: reply_tx }).is_err() {
            return ClientState::Disconnected;
        }
        reply_rx.await.unwrap_or(ClientState::Disconnected)
    }

    /// Ask the worker to terminate; pending work is abandoned.
    pub fn stop(&self) {
        let _ = self.tx.send(ClientCommand::Stop);
    }
}

/// Transient session for `TestConnection`: connect, then immediately tear
/// down. Nothing is persisted and no resources outlive the call.
pub async fn run_test_connection(
    connection: &Connection,
    transports: &TransportRegistry,
    timeout: Duration,
) -> Result<(), GatewayError> {
    let mut transport = transports.create(connection)?;
    let (events, _rx) = mpsc::unbounded_channel();
    let ctx = TransportContext {
        connection: connection.clone(),
        events,
    };
    let outcome = match tokio::time::timeout(timeout, transport.connect(ctx)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(failure)) => Err(failure.into_error()),
        Err(_) => Err(GatewayError::timeout("connection test timed out")),
    };
    transport.disconnect().await;
    outcome
}

/// Delivery observer feeding the connection's metrics and log buffer.
struct ClientMonitor {
    metrics: Arc<ConnectionMetrics>,
    logger: Arc<ConnectionLogger>,
}

impl DeliveryMonitor for ClientMonitor {
    fn published(&self, target_address: &str) {
        self.metrics.record_published();
        self.logger
            .success(LogCategory::Target, Some(target_address), "published");
    }

    fn dropped(&self, target_address: &str) {
        self.metrics.record_dropped_outbound();
        self.logger
            .success(LogCategory::Target, Some(target_address), "dropped by filter");
    }

    fn failed(&self, target_address: &str, error: &GatewayError) {
        self.metrics.record_failed_publish();
        self.logger
            .failure(LogCategory::Target, Some(target_address), error.to_string());
    }
}

/// Match a consumed wire address against a configured source address,
/// honoring MQTT-style `+` and `#` wildcards.
fn address_matches(configured: &str, consumed: &str) -> bool {
    if configured == consumed {
        return true;
    }
    let mut pattern = configured.split('/');
    let mut actual = consumed.split('/');
    loop {
        match (pattern.next(), actual.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(a)) if p == a => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn find_source<'a>(connection: &'a Connection, address: Option<&str>) -> Option<&'a Source> {
    match address {
        Some(address) => connection.sources.iter().find(|source| {
            source
                .addresses
                .iter()
                .any(|configured| address_matches(configured, address))
        }),
        // Transports that carry no per-message address fall back to the
        // single configured source.
        None if connection.sources.len() == 1 => connection.sources.first(),
        None => None,
    }
}

struct ClientWorker {
    connection: Connection,
    transport: Box<dyn Transport>,
    pipeline: MappingPipeline,
    ctx: ClientContext,
    state: ClientState,
    stopping: bool,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    signals: Option<mpsc::UnboundedReceiver<Signal>>,
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

enum Activity {
    Command(Option<ClientCommand>),
    Event(Option<TransportEvent>),
    Signal(Option<Signal>),
}

impl ClientWorker {
    async fn run(mut self) {
        while !self.stopping {
            match self.state {
                ClientState::Disconnected => match self.commands.recv().await {
                    Some(ClientCommand::Open { reply }) => {
                        self.connect_cycle(Some(reply)).await;
                    }
                    Some(ClientCommand::Close { reply }) => {
                        let _ = reply.send(Ok(()));
                    }
                    Some(ClientCommand::State { reply }) => {
                        let _ = reply.send(self.state);
                    }
                    Some(ClientCommand::Stop) | None => break,
                },
                ClientState::Connected => {
                    let activity = tokio::select! {
                        cmd = self.commands.recv() => Activity::Command(cmd),
                        event = recv_or_pending(&mut self.events) => Activity::Event(event),
                        signal = recv_or_pending(&mut self.signals) => Activity::Signal(signal),
                    };
                    match activity {
                        Activity::Command(Some(ClientCommand::Open { reply })) => {
                            let _ = reply.send(Ok(()));
                        }
                        Activity::Command(Some(ClientCommand::Close { reply })) => {
                            self.disconnect().await;
                            let _ = reply.send(Ok(()));
                        }
                        Activity::Command(Some(ClientCommand::State { reply })) => {
                            let _ = reply.send(self.state);
                        }
                        Activity::Command(Some(ClientCommand::Stop))
                        | Activity::Command(None) => {
                            self.disconnect().await;
                            break;
                        }
                        Activity::Event(Some(TransportEvent::Inbound(message))) => {
                            self.handle_inbound(message).await;
                        }
                        Activity::Event(Some(TransportEvent::Closed { reason })) => {
                            self.reconnect(&reason).await;
                        }
                        Activity::Event(None) => {
                            self.reconnect("transport event channel closed").await;
                        }
                        Activity::Signal(Some(signal)) => {
                            self.handle_outbound(signal).await;
                        }
                        Activity::Signal(None) => {
                            self.signals = None;
                        }
                    }
                }
                // Connecting/Disconnecting are handled inside connect_cycle
                // and disconnect; reaching here means a logic error, settle
                // back to disconnected.
                ClientState::Connecting | ClientState::Disconnecting => {
                    self.state = ClientState::Disconnected;
                }
            }
        }
        if self.state == ClientState::Connected {
            self.disconnect().await;
        }
    }

    /// Drive CONNECTING until the session is up or definitively down.
    /// `reply` is the original requester for an attended open; the
    /// unattended reconnect path passes `None`.
    async fn connect_cycle(
        &mut self,
        mut reply: Option<oneshot::Sender<Result<(), GatewayError>>>,
    ) {
        self.state = ClientState::Connecting;
        let mut attempt: u32 = 0;
        loop {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let ctx = TransportContext {
                connection: self.connection.clone(),
                events: events_tx,
            };
            match tokio::time::timeout(self.ctx.settings.connect_timeout, self.transport.connect(ctx))
                .await
            {
                Ok(Ok(())) => {
                    self.events = Some(events_rx);
                    self.allocate_resources();
                    self.state = ClientState::Connected;
                    info!(connection = %self.connection.id, "client connected");
                    if let Some(reply) = reply.take() {
                        let _ = reply.send(Ok(()));
                    }
                    return;
                }
                Ok(Err(failure)) if failure.is_fatal() => {
                    warn!(
                        connection = %self.connection.id,
                        description = %failure.description,
                        "client connect rejected"
                    );
                    if let Some(reply) = reply.take() {
                        let _ = reply.send(Err(failure.into_error()));
                    }
                    self.state = ClientState::Disconnected;
                    return;
                }
                Ok(Err(failure)) => {
                    // A definite failure on an attended open is reported to
                    // the requester; the reconnect path keeps retrying.
                    if let Some(reply) = reply.take() {
                        let _ = reply.send(Err(failure.into_error()));
                        self.state = ClientState::Disconnected;
                        return;
                    }
                    warn!(
                        connection = %self.connection.id,
                        description = %failure.description,
                        "client reconnect failed"
                    );
                }
                Err(_elapsed) => {
                    debug!(connection = %self.connection.id, attempt, "connect attempt timed out");
                }
            }
            attempt += 1;
            if attempt > self.ctx.settings.connect_retries {
                if let Some(reply) = reply.take() {
                    let _ = reply.send(Err(GatewayError::timeout(
                        "connect retries exhausted without a confirmation",
                    )));
                } else {
                    warn!(connection = %self.connection.id, "reconnect retries exhausted");
                }
                self.state = ClientState::Disconnected;
                return;
            }
            let delay = backoff_delay(&self.ctx.settings, attempt - 1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                cmd = self.commands.recv() => match cmd {
                    // Close while connecting cancels the in-flight attempt.
                    Some(ClientCommand::Close { reply: close_reply }) => {
                        if let Some(reply) = reply.take() {
                            let _ = reply.send(Err(GatewayError::connection_failed(
                                "connect cancelled by close",
                            )));
                        }
                        let _ = close_reply.send(Ok(()));
                        self.state = ClientState::Disconnected;
                        return;
                    }
                    Some(ClientCommand::Open { reply: open_reply }) => {
                        if reply.is_none() {
                            reply = Some(open_reply);
                        } else {
                            let _ = open_reply.send(Err(GatewayError::connection_failed(
                                "a connect attempt is already in progress",
                            )));
                        }
                    }
                    Some(ClientCommand::State { reply }) => {
                        let _ = reply.send(self.state);
                    }
                    Some(ClientCommand::Stop) | None => {
                        if let Some(reply) = reply.take() {
                            let _ = reply.send(Err(GatewayError::connection_failed(
                                "client worker stopping",
                            )));
                        }
                        self.state = ClientState::Disconnected;
                        self.stopping = true;
                        return;
                    }
                },
            }
        }
    }

    /// Register for the live signals this connection's targets subscribe to.
    fn allocate_resources(&mut self) {
        let subjects: BTreeSet<String> = self
            .connection
            .targets
            .iter()
            .flat_map(|t| t.authorization.subjects().iter().cloned())
            .collect();
        let (tx, rx) = mpsc::unbounded_channel();
        self.ctx.broker.subscribe(
            self.connection.id.clone(),
            self.connection.subscribed_topics(),
            subjects.into_iter().collect(),
            tx,
        );
        self.signals = Some(rx);
    }

    fn cleanup_resources(&mut self) {
        self.ctx.broker.remove_subscriber(&self.connection.id);
        self.signals = None;
        self.events = None;
    }

    async fn disconnect(&mut self) {
        self.state = ClientState::Disconnecting;
        self.transport.disconnect().await;
        self.cleanup_resources();
        self.state = ClientState::Disconnected;
        info!(connection = %self.connection.id, "client disconnected");
    }

    /// Abnormal socket close: tear down resources and re-enter the connect
    /// path, same as a failed open.
    async fn reconnect(&mut self, reason: &str) {
        warn!(connection = %self.connection.id, reason, "session closed, reconnecting");
        self.transport.disconnect().await;
        self.cleanup_resources();
        self.connect_cycle(None).await;
    }

    // -------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------

    async fn handle_inbound(&mut self, message: ExternalMessage) {
        self.ctx.metrics.record_consumed();
        let Some(source) = find_source(&self.connection, message.source_address()).cloned() else {
            self.ctx.logger.failure(
                LogCategory::Source,
                message.source_address(),
                "no source configured for consumed address",
            );
            return;
        };
        let address = message.source_address().map(str::to_string);
        let address = address.as_deref();

        if let Some(payload) = message.payload() {
            if payload.len() > self.ctx.settings.max_payload_bytes {
                self.ctx.metrics.record_mapping_failure();
                let error = GatewayError::mapping_failed(
                    "size-limit",
                    format!(
                        "payload of {} bytes exceeds the configured maximum of {}",
                        payload.len(),
                        self.ctx.settings.max_payload_bytes
                    ),
                );
                self.ctx
                    .logger
                    .failure(LogCategory::Source, address, error.to_string());
                self.publish_error_response(&source, &message, None, error).await;
                return;
            }
        }

        let message = if message.payload_mapping().is_empty() && !source.payload_mapping.is_empty()
        {
            message.with_payload_mapping(source.payload_mapping.clone())
        } else {
            message
        };

        for outcome in self.pipeline.process_inbound(&message) {
            match outcome {
                MappingOutcome::Mapped { value: mut signal, .. } => {
                    if let Some(rule) = &source.enforcement {
                        let header_src = HeaderSource::new(message.headers());
                        let claim = PlaceholderResolver::new().with_source(&header_src);
                        let thing_src = ThingSource::new(&signal.entity_id);
                        let topic_src = TopicSource::new(&signal.topic);
                        let identity = PlaceholderResolver::new()
                            .with_source(&thing_src)
                            .with_source(&topic_src);
                        if let Err(error) = enforcement::enforce(rule, &claim, &identity) {
                            self.ctx.metrics.record_enforcement_failure();
                            self.ctx
                                .logger
                                .failure(LogCategory::Source, address, error.to_string());
                            self.publish_error_response(&source, &message, Some(&signal), error)
                                .await;
                            continue;
                        }
                    }
                    if !source.header_mapping.is_empty() {
                        let entity = signal.entity_id.clone();
                        let topic = signal.topic.clone();
                        let header_src = HeaderSource::new(message.headers());
                        let thing_src = ThingSource::new(&entity);
                        let topic_src = TopicSource::new(&topic);
                        let resolver = PlaceholderResolver::new()
                            .with_source(&header_src)
                            .with_source(&thing_src)
                            .with_source(&topic_src);
                        for (name, template) in &source.header_mapping {
                            match resolver.resolve(template) {
                                Ok(value) => signal.headers.put(name.clone(), value),
                                Err(error) => {
                                    self.ctx.logger.failure(
                                        LogCategory::Source,
                                        address,
                                        error.to_string(),
                                    );
                                }
                            }
                        }
                    }
                    if !source.authorization.is_empty() && signal.read_subjects.is_empty() {
                        signal.read_subjects = source.authorization.subjects().to_vec();
                    }
                    if signal.headers.correlation_id().is_none() {
                        signal
                            .headers
                            .put(CORRELATION_ID_HEADER, uuid::Uuid::new_v4().to_string());
                    }
                    self.ctx.metrics.record_mapped_inbound();
                    self.ctx
                        .logger
                        .success(LogCategory::Source, address, "mapped inbound message");
                    let _ = self.ctx.forwarder.send(signal);
                }
                MappingOutcome::Dropped { .. } => {
                    self.ctx.metrics.record_dropped_inbound();
                }
                MappingOutcome::Error { mapper, error, topic_path } => {
                    self.ctx.metrics.record_mapping_failure();
                    self.ctx.logger.failure(
                        LogCategory::Source,
                        address,
                        format!("mapper '{mapper}' failed: {error}"),
                    );
                    let origin = topic_path
                        .as_deref()
                        .and_then(|path| TopicPath::parse(path).ok())
                        .map(|topic| {
                            let mut origin = Signal::new(topic, Value::Null);
                            if let Some(corr) = message.find_header(CORRELATION_ID_HEADER) {
                                origin.headers.put(CORRELATION_ID_HEADER, corr);
                            }
                            origin
                        });
                    self.publish_error_response(&source, &message, origin.as_ref(), error)
                        .await;
                }
            }
        }
    }

    /// Render an error response through the outbound mapper chain and
    /// deliver it to the source's reply target, when one is configured.
    async fn publish_error_response(
        &mut self,
        source: &Source,
        message: &ExternalMessage,
        origin: Option<&Signal>,
        error: GatewayError,
    ) {
        let Some(reply_target) = &source.reply_target else {
            return;
        };
        let Some(origin) = origin else {
            // Without a derivable topic there is nothing to address the
            // response to.
            self.ctx.logger.failure(
                LogCategory::Response,
                Some(reply_target),
                "error response skipped: no topic derivable from the message",
            );
            return;
        };
        let header_src = HeaderSource::new(message.headers());
        let resolver = PlaceholderResolver::new().with_source(&header_src);
        let address = match resolver.resolve(reply_target) {
            Ok(address) => address,
            Err(resolve_error) => {
                self.ctx.logger.failure(
                    LogCategory::Response,
                    Some(reply_target),
                    resolve_error.to_string(),
                );
                return;
            }
        };
        let response = origin.error_response(&error);
        let target =
            Target::new(address.clone()).with_payload_mapping(source.payload_mapping.clone());
        let outbound = OutboundSignal::new(response, vec![target]);
        for outcome in self.pipeline.process_outbound(&outbound) {
            if let MappingOutcome::Mapped { value, .. } = outcome {
                match self.transport.publish(&address, value.message, None).await {
                    Ok(_) => self.ctx.logger.success(
                        LogCategory::Response,
                        Some(&address),
                        "delivered error response",
                    ),
                    Err(publish_error) => self.ctx.logger.failure(
                        LogCategory::Response,
                        Some(&address),
                        publish_error.to_string(),
                    ),
                }
            }
        }
    }

    // -------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------

    async fn handle_outbound(&mut self, signal: Signal) {
        let extra = self
            .ctx
            .extra
            .as_ref()
            .and_then(|provider| provider(&signal.entity_id));
        let matched: Vec<Target> = filter::filter_targets(&self.connection, &signal, extra.as_ref())
            .into_iter()
            .cloned()
            .collect();
        // Targets subscribed to the topic but excluded by authorization,
        // namespace, or filter never reach a publish attempt.
        let dropped: Vec<Target> = self
            .connection
            .targets
            .iter()
            .filter(|target| {
                target
                    .topics
                    .iter()
                    .any(|filtered| filtered.topic.covers(&signal.topic))
            })
            .filter(|target| !matched.contains(target))
            .cloned()
            .collect();
        if matched.is_empty() && dropped.is_empty() {
            return;
        }

        let requested = signal.headers.requested_acks();
        let requester_waits = |target: &Target| -> bool {
            target
                .issued_ack
                .as_ref()
                .map(|label| requested.contains(label) && !label.is_live_response())
                .unwrap_or(false)
        };
        let expected = matched
            .iter()
            .chain(dropped.iter())
            .filter(|target| requester_waits(target))
            .count();
        let (ack_tx, collector) = ResponseCollector::with_count(expected);
        let monitor = ClientMonitor {
            metrics: Arc::clone(&self.ctx.metrics),
            logger: Arc::clone(&self.ctx.logger),
        };

        for target in dropped {
            let target = gate_issued_ack(target, &requested);
            if let Some(ack) =
                Dropped::new(target, signal.entity_id.clone()).monitor_and_acknowledge(&monitor)
            {
                ack_tx.send(ack);
            }
        }

        let outbound = OutboundSignal {
            signal: signal.clone(),
            targets: matched,
            extra,
        };
        for outcome in self.pipeline.process_outbound(&outbound) {
            match outcome {
                MappingOutcome::Mapped {
                    value: MappedOutboundMessage { message, targets },
                    ..
                } => {
                    for target in targets {
                        self.publish_to_target(&signal, &message, target, &requested, &ack_tx, &monitor)
                            .await;
                    }
                }
                MappingOutcome::Dropped { .. } => {
                    self.ctx.metrics.record_dropped_outbound();
                }
                MappingOutcome::Error { mapper, error, .. } => {
                    self.ctx.metrics.record_mapping_failure();
                    self.ctx.logger.failure(
                        LogCategory::Target,
                        None,
                        format!("outbound mapper '{mapper}' failed: {error}"),
                    );
                }
            }
        }
        drop(ack_tx);

        if expected > 0 {
            let result = collector.collect(self.ctx.settings.ack_timeout).await;
            if !result.all_expected_responses_arrived() {
                self.ctx.logger.failure(
                    LogCategory::Response,
                    None,
                    "acknowledgement collection timed out with partial results",
                );
            }
            for ack in result.responses {
                self.ctx.metrics.record_acknowledgement();
                let _ = self.ctx.forwarder.send(ack_signal(&signal, &ack));
            }
        }
    }

    async fn publish_to_target(
        &mut self,
        signal: &Signal,
        message: &ExternalMessage,
        target: Target,
        requested: &[AckLabel],
        ack_tx: &crate::delivery::collector::ResponseSender<Acknowledgement>,
        monitor: &ClientMonitor,
    ) {
        let thing_src = ThingSource::new(&signal.entity_id);
        let topic_src = TopicSource::new(&signal.topic);
        let resolver = PlaceholderResolver::new()
            .with_source(&thing_src)
            .with_source(&topic_src);
        let address = match resolver.resolve(&target.address) {
            Ok(address) => address,
            Err(error) => {
                self.ctx.metrics.record_failed_publish();
                self.ctx
                    .logger
                    .failure(LogCategory::Target, Some(&target.address), error.to_string());
                return;
            }
        };
        let mut wire = message.clone();
        for (name, template) in &target.header_mapping {
            match resolver.resolve(template) {
                Ok(value) => wire = wire.with_header(name.clone(), value),
                Err(error) => {
                    self.ctx
                        .logger
                        .failure(LogCategory::Target, Some(&address), error.to_string());
                }
            }
        }
        // Internal routing headers never leave the gateway.
        let wire = HeaderFilter::Exclude(
            [REQUESTED_ACKS_HEADER.to_string(), REPLY_TO_HEADER.to_string()]
                .into_iter()
                .collect(),
        )
        .apply(&wire);

        let target = gate_issued_ack(target, requested);
        let ack_request = target.issued_ack.as_ref().map(|label| AckRequest {
            label: label.clone(),
            entity_id: signal.entity_id.clone(),
        });
        let (outcome_tx, sending) = Sending::new(target, signal.entity_id.clone());
        let result = self.transport.publish(&address, wire, ack_request).await;
        let _ = outcome_tx.send(result);
        if let Some(ack) = sending.monitor_and_acknowledge(monitor).await {
            ack_tx.send(ack);
        }
    }
}

/// Strip the issued-ack label from a target when the requester is not
/// waiting on it, so no acknowledgement is synthesized for it.
fn gate_issued_ack(mut target: Target, requested: &[AckLabel]) -> Target {
    let wanted = target
        .issued_ack
        .as_ref()
        .map(|label| requested.contains(label))
        .unwrap_or(false);
    if !wanted {
        target.issued_ack = None;
    }
    target
}

/// Wrap a collected acknowledgement as a response signal answering the
/// original request.
fn ack_signal(origin: &Signal, ack: &Acknowledgement) -> Signal {
    let topic = TopicPath::new(
        &origin.entity_id,
        origin.topic.channel,
        TopicCriterion::Acks,
        ack.label.as_str(),
    );
    let mut response = Signal::new(topic, serde_json::to_value(ack).unwrap_or_default());
    if let Some(corr) = origin.correlation_id() {
        response.headers.put(CORRELATION_ID_HEADER, corr);
    }
    response
}
