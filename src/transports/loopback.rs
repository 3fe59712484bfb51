//! In-memory transport.
//!
//! Records everything and lets callers script failures and inbound
//! traffic; the tests' stand-in for a real broker session.

use crate::connections::client::ConnectionFailure;
use crate::connections::model::Connection;
use crate::delivery::sending::PublishResult;
use crate::protocol::error::GatewayError;
use crate::protocol::message::ExternalMessage;
use crate::protocol::signal::Acknowledgement;
use crate::transports::{AckRequest, Transport, TransportContext, TransportEvent, TransportRegistry};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared, inspectable state behind every `LoopbackTransport` a factory
/// hands out.
#[derive(Default)]
pub struct LoopbackState {
    /// `(address, message)` pairs in publish order.
    pub published: Mutex<Vec<(String, ExternalMessage)>>,
    /// connect/disconnect calls in order.
    pub lifecycle: Mutex<Vec<String>>,
    pub connect_attempts: AtomicU64,
    /// Failures consumed one per connect attempt.
    pub connect_failures: Mutex<VecDeque<ConnectionFailure>>,
    /// Error every publish fails with while set.
    pub publish_failure: Mutex<Option<GatewayError>>,
    /// When false, publishes succeed without producing a requested ack.
    pub acknowledge_publishes: Mutex<bool>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl LoopbackState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            acknowledge_publishes: Mutex::new(true),
            ..Self::default()
        })
    }

    pub fn fail_next_connects(&self, failures: Vec<ConnectionFailure>) {
        self.connect_failures.lock().extend(failures);
    }

    /// Deliver a message as if consumed from a source; false when no
    /// session is live.
    pub fn inject_inbound(&self, message: ExternalMessage) -> bool {
        self.events
            .lock()
            .as_ref()
            .map(|tx| tx.send(TransportEvent::Inbound(message)).is_ok())
            .unwrap_or(false)
    }

    /// Simulate an abnormal socket close.
    pub fn emit_closed(&self, reason: &str) -> bool {
        self.events
            .lock()
            .as_ref()
            .map(|tx| {
                tx.send(TransportEvent::Closed {
                    reason: reason.to_string(),
                })
                .is_ok()
            })
            .unwrap_or(false)
    }

    pub fn published_addresses(&self) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .map(|(address, _)| address.clone())
            .collect()
    }

    /// Register this state as the transport for every connection type the
    /// registry serves.
    pub fn register_everywhere(self: &Arc<Self>, registry: &mut TransportRegistry) {
        use crate::connections::model::ConnectionType::*;
        for connection_type in [Amqp091, Amqp10, Mqtt3, Mqtt5, HttpPush, Kafka] {
            let state = Arc::clone(self);
            registry.register(
                connection_type,
                Arc::new(move |_connection: &Connection| {
                    let transport: Box<dyn Transport> =
                        Box::new(LoopbackTransport::new(Arc::clone(&state)));
                    Ok(transport)
                }),
            );
        }
    }
}

pub struct LoopbackTransport {
    state: Arc<LoopbackState>,
    connected: bool,
}

impl LoopbackTransport {
    pub fn new(state: Arc<LoopbackState>) -> Self {
        Self {
            state,
            connected: false,
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&mut self, ctx: TransportContext) -> Result<(), ConnectionFailure> {
        self.state.connect_attempts.fetch_add(1, Ordering::Relaxed);
        if let Some(failure) = self.state.connect_failures.lock().pop_front() {
            return Err(failure);
        }
        *self.state.events.lock() = Some(ctx.events);
        self.state.lifecycle.lock().push("connect".to_string());
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.connected {
            self.state.lifecycle.lock().push("disconnect".to_string());
            self.connected = false;
        }
        *self.state.events.lock() = None;
    }

    async fn publish(
        &mut self,
        address: &str,
        message: ExternalMessage,
        ack: Option<AckRequest>,
    ) -> PublishResult {
        if let Some(error) = self.state.publish_failure.lock().clone() {
            return Err(error);
        }
        self.state
            .published
            .lock()
            .push((address.to_string(), message));
        let acknowledge = *self.state.acknowledge_publishes.lock();
        Ok(ack.filter(|_| acknowledge).map(|request| {
            Acknowledgement::success(request.label, request.entity_id)
        }))
    }
}
