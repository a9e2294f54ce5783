// courier-test-utils: Shared helpers for the integration suites.
//
// Provides ready-made server/client fixtures that funnel received messages
// into channels, plus event-wait helpers with timeouts.  Every fixture binds
// to port 0 so suites can run in parallel.

pub mod client_harness;
pub mod server_harness;

pub use client_harness::TestClient;
pub use server_harness::TestServer;

use std::time::Duration;
use tokio::sync::broadcast;

/// A message captured by a fixture's handler.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub guid: Option<uuid::Uuid>,
    pub metadata: Option<courier_protocol::Metadata>,
    pub data: Vec<u8>,
}

/// Receive the next event within `timeout`, or `None`.
pub async fn next_event<T: Clone + Send + 'static>(
    rx: &mut broadcast::Receiver<T>,
    timeout: Duration,
) -> Option<T> {
    match tokio::time::timeout(timeout, rx.recv()).await {
        Ok(Ok(event)) => Some(event),
        _ => None,
    }
}

/// Receive events until one satisfies `pred`, within `timeout` overall.
pub async fn wait_for_event<T: Clone + Send + 'static>(
    rx: &mut broadcast::Receiver<T>,
    timeout: Duration,
    pred: impl Fn(&T) -> bool,
) -> Option<T> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) if pred(&event) => return Some(event),
            Ok(Ok(_)) => {}
            _ => return None,
        }
    }
}
