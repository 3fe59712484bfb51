//! Per-(signal x target) publish decisions.
//!
//! Each outbound message either reaches an actual publish attempt
//! (`Sending`) or is filtered out before publish (`Dropped`). Both resolve
//! to the same acknowledgement contract so the original requester never
//! waits on a signal that silently went nowhere: a dropped signal whose
//! target issues an acknowledgement label yields a synthetic weak success.

use crate::connections::model::Target;
use crate::protocol::error::GatewayError;
use crate::protocol::signal::{AckLabel, Acknowledgement, EntityId};
use tokio::sync::oneshot;

/// Outcome of a transport publish: the real acknowledgement if the broker
/// produced one, `None` when the publish succeeded without one.
pub type PublishResult = Result<Option<Acknowledgement>, GatewayError>;

/// Observer for per-target delivery outcomes; implemented by the
/// connection's log/metrics recorder.
pub trait DeliveryMonitor: Send + Sync {
    fn published(&self, target_address: &str);
    fn dropped(&self, target_address: &str);
    fn failed(&self, target_address: &str, error: &GatewayError);
}

/// Monitor discarding every event.
pub struct NoopMonitor;

impl DeliveryMonitor for NoopMonitor {
    fn published(&self, _target_address: &str) {}
    fn dropped(&self, _target_address: &str) {}
    fn failed(&self, _target_address: &str, _error: &GatewayError) {}
}

/// Label a delivery acknowledgement would carry, excluding the in-band
/// live-response channel.
fn delivery_ack_label(target: &Target) -> Option<AckLabel> {
    target
        .issued_ack
        .as_ref()
        .filter(|label| !label.is_live_response())
        .cloned()
}

/// A message filtered out before its publish step.
#[derive(Debug)]
pub struct Dropped {
    pub target: Target,
    pub entity_id: EntityId,
}

impl Dropped {
    pub fn new(target: Target, entity_id: EntityId) -> Self {
        Self { target, entity_id }
    }

    /// Record the drop; synthesize a weak success acknowledgement when the
    /// target issues a label, so requesters waiting on it resolve.
    pub fn monitor_and_acknowledge(self, monitor: &dyn DeliveryMonitor) -> Option<Acknowledgement> {
        monitor.dropped(&self.target.address);
        delivery_ack_label(&self.target)
            .map(|label| Acknowledgement::weak_success(label, self.entity_id))
    }
}

/// A message handed to the transport; the publish outcome arrives on the
/// channel once the attempt concludes.
#[derive(Debug)]
pub struct Sending {
    pub target: Target,
    pub entity_id: EntityId,
    outcome: oneshot::Receiver<PublishResult>,
}

impl Sending {
    pub fn new(target: Target, entity_id: EntityId) -> (oneshot::Sender<PublishResult>, Self) {
        let (tx, outcome) = oneshot::channel();
        (
            tx,
            Self {
                target,
                entity_id,
                outcome,
            },
        )
    }

    /// Await the publish outcome and convert it to the acknowledgement the
    /// target requested, if any.
    pub async fn monitor_and_acknowledge(
        self,
        monitor: &dyn DeliveryMonitor,
    ) -> Option<Acknowledgement> {
        let label = delivery_ack_label(&self.target);
        let result = self.outcome.await.unwrap_or_else(|_| {
            Err(GatewayError::connection_failed(
                "publisher dropped the outcome before resolving it",
            ))
        });
        match result {
            Ok(ack) => {
                monitor.published(&self.target.address);
                match label {
                    None => None,
                    Some(label) => match ack {
                        Some(ack) => Some(ack),
                        // The target expected an acknowledgement the publish
                        // did not yield.
                        None => Some(Acknowledgement::failed(
                            label,
                            self.entity_id,
                            &GatewayError::null_acknowledgement(),
                        )),
                    },
                }
            }
            Err(error) => {
                monitor.failed(&self.target.address, &error);
                label.map(|label| Acknowledgement::failed(label, self.entity_id, &error))
            }
        }
    }
}

/// The two publish decisions, consumed via exhaustive match.
#[derive(Debug)]
pub enum PublishDecision {
    Sending(Sending),
    Dropped(Dropped),
}

impl PublishDecision {
    pub async fn monitor_and_acknowledge(
        self,
        monitor: &dyn DeliveryMonitor,
    ) -> Option<Acknowledgement> {
        match self {
            Self::Sending(sending) => sending.monitor_and_acknowledge(monitor).await,
            Self::Dropped(dropped) => dropped.monitor_and_acknowledge(monitor),
        }
    }
}
