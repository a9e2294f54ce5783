//! Sync request/response correlation.
//!
//! Each in-flight `send_and_wait` registers a one-shot waiter keyed by the
//! request's conversation GUID; the receiver loop completes the waiter when a
//! matching (unexpired) response arrives.  Responses are matched by GUID, not
//! order, so independent requests may complete out of order.

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::settings::MIN_SYNC_TIMEOUT;
use crate::stats::Statistics;
use chrono::Utc;
use courier_protocol::{FrameHeader, Metadata};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tracing::debug;
use uuid::Uuid;

/// A correlated response delivered to a `send_and_wait` caller.
#[derive(Debug)]
pub struct SyncResponse {
    pub data: Vec<u8>,
    pub metadata: Option<Metadata>,
}

pub(crate) struct SyncCorrelator {
    pending: Mutex<HashMap<Uuid, oneshot::Sender<SyncResponse>>>,
}

impl SyncCorrelator {
    pub(crate) fn new() -> Self {
        SyncCorrelator {
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn register(&self, conv: Uuid) -> oneshot::Receiver<SyncResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(conv, tx);
        rx
    }

    /// Deliver a response to its waiter.  Returns false when nobody is
    /// waiting (already timed out, or an unsolicited response).
    pub(crate) async fn complete(&self, conv: Uuid, response: SyncResponse) -> bool {
        match self.pending.lock().await.remove(&conv) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    pub(crate) async fn forget(&self, conv: Uuid) {
        self.pending.lock().await.remove(&conv);
    }

    /// Drop every waiter (connection gone); their `send_and_wait` callers
    /// observe the closed channel.
    pub(crate) async fn clear(&self) {
        self.pending.lock().await.clear();
    }
}

/// The full `send_and_wait` exchange over `conn`.
pub(crate) async fn send_and_wait_on(
    conn: &Connection,
    correlator: &SyncCorrelator,
    stats: &Statistics,
    timeout: Duration,
    data: &[u8],
    metadata: Option<Metadata>,
) -> Result<SyncResponse> {
    if timeout < MIN_SYNC_TIMEOUT {
        return Err(Error::Config(format!(
            "send_and_wait timeout must be at least {}ms",
            MIN_SYNC_TIMEOUT.as_millis()
        )));
    }
    let expiration = Utc::now()
        + chrono::TimeDelta::from_std(timeout)
            .map_err(|_| Error::Config("send_and_wait timeout out of range".to_owned()))?;

    let header = FrameHeader::sync_request(data.len() as u64, metadata, expiration);
    let conv = header.convguid;
    let waiter = correlator.register(conv).await;

    if let Err(e) = conn.send_bytes(&header, data).await {
        correlator.forget(conv).await;
        return Err(e);
    }
    stats.record_sent(header.len);

    match tokio::time::timeout(timeout, waiter).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(_closed)) => {
            debug!(%conv, "connection dropped while awaiting sync response");
            correlator.forget(conv).await;
            Err(Error::NotConnected)
        }
        Err(_elapsed) => {
            correlator.forget(conv).await;
            Err(Error::Timeout)
        }
    }
}
