//! Per-request response collection.
//!
//! A short-lived collector for the command-responses/acknowledgements one
//! request expects. It resolves once the expected count arrived, or with
//! partial results when the deadline fires; it never blocks indefinitely.

use std::time::Duration;
use tokio::sync::mpsc;

/// Handle given to the parties producing responses.
#[derive(Debug, Clone)]
pub struct ResponseSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> ResponseSender<T> {
    pub fn send(&self, response: T) {
        // The collector may already have resolved; late responses are fine
        // to discard.
        let _ = self.tx.send(response);
    }
}

/// Accumulated result; the caller distinguishes "all arrived" from
/// "timed out with partial results".
#[derive(Debug)]
pub struct CollectorResult<T> {
    pub responses: Vec<T>,
    expected: usize,
}

impl<T> CollectorResult<T> {
    pub fn all_expected_responses_arrived(&self) -> bool {
        self.responses.len() >= self.expected
    }
}

/// Collector for a fixed expected count.
#[derive(Debug)]
pub struct ResponseCollector<T> {
    expected: usize,
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> ResponseCollector<T> {
    /// Create a collector expecting `expected` responses.
    pub fn with_count(expected: usize) -> (ResponseSender<T>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ResponseSender { tx }, Self { expected, rx })
    }

    /// Await responses until the count is reached or the timeout elapses.
    pub async fn collect(mut self, timeout: Duration) -> CollectorResult<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut responses = Vec::with_capacity(self.expected);
        while responses.len() < self.expected {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(response)) => responses.push(response),
                // All senders gone or deadline hit: resolve with what we have.
                Ok(None) | Err(_) => break,
            }
        }
        CollectorResult {
            responses,
            expected: self.expected,
        }
    }
}
