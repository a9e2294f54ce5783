//! Frame delivery shared by the server and client receiver loops.
//!
//! Handlers are user code: a panic inside one is caught and reported, never
//! allowed to take the receiver loop down with it.

use crate::connection::{Connection, PeerStream};
use crate::correlator::{SyncCorrelator, SyncResponse};
use crate::error::{Error, Result};
use crate::events::{
    AuthMaterialProvider, MessageEvent, MessageHandler, StreamEvent, StreamHandler,
    SyncRequestHandler,
};
use crate::framing::FrameReader;
use crate::stats::Statistics;
use chrono::Utc;
use courier_protocol::FrameHeader;
use futures_util::FutureExt;
use std::io::Cursor;
use std::panic::AssertUnwindSafe;
use tokio::io::ReadHalf;
use tracing::{debug, warn};
use uuid::Uuid;

/// User callbacks active for one endpoint, snapshotted at startup.
#[derive(Clone, Default)]
pub(crate) struct SessionHooks {
    pub(crate) on_message: Option<MessageHandler>,
    pub(crate) on_stream: Option<StreamHandler>,
    pub(crate) on_sync_request: Option<SyncRequestHandler>,
    pub(crate) on_auth_material: Option<AuthMaterialProvider>,
}

impl SessionHooks {
    /// Delivery mode is chosen by which handler is registered; exactly one
    /// of message/stream must be present.
    pub(crate) fn validate_delivery_mode(&self) -> Result<()> {
        match (&self.on_message, &self.on_stream) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            (Some(_), Some(_)) => Err(Error::Config(
                "register either a message handler or a stream handler, not both".to_owned(),
            )),
            (None, None) => Err(Error::Config(
                "a message handler or a stream handler must be registered".to_owned(),
            )),
        }
    }
}

/// `Some(context)` when the handler panicked; the caller reports it as an
/// `ExceptionEncountered` event.
pub(crate) type HandlerPanic = Option<String>;

fn panic_context(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    }
}

type Reader = FrameReader<ReadHalf<PeerStream>>;

/// Deliver a `Normal` frame to the registered message or stream handler.
pub(crate) async fn deliver_frame(
    reader: &mut Reader,
    header: &FrameHeader,
    hooks: &SessionHooks,
    guid: Option<Uuid>,
    buffer_size: usize,
    max_proxied: u64,
) -> Result<HandlerPanic> {
    if let Some(on_message) = &hooks.on_message {
        let data = reader.read_payload(header.len).await?;
        let event = MessageEvent {
            guid,
            metadata: header.md.clone(),
            data,
        };
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| on_message(event)));
        return Ok(outcome.err().map(panic_context));
    }

    let Some(on_stream) = &hooks.on_stream else {
        // validate_delivery_mode makes this unreachable in practice.
        reader.drain_payload(header.len).await?;
        return Ok(None);
    };

    if header.len >= max_proxied {
        // Pass-through: the handler reads straight off the wire through a
        // bounded pipe.  The pump copies exactly `len` bytes and keeps the
        // wire aligned even if the handler abandons its reader.
        let (user_side, mut pump_side) = tokio::io::duplex(buffer_size.max(1));
        let event = StreamEvent {
            guid,
            metadata: header.md.clone(),
            len: header.len,
            payload: Box::new(user_side),
        };
        let handler = AssertUnwindSafe(on_stream(event)).catch_unwind();
        let (pumped, outcome) = tokio::join!(
            reader.pump_payload(header.len, &mut pump_side, buffer_size),
            handler
        );
        pumped?;
        Ok(outcome.err().map(panic_context))
    } else {
        let data = reader.read_payload(header.len).await?;
        let event = StreamEvent {
            guid,
            metadata: header.md.clone(),
            len: header.len,
            payload: Box::new(Cursor::new(data)),
        };
        let outcome = AssertUnwindSafe(on_stream(event)).catch_unwind().await;
        Ok(outcome.err().map(panic_context))
    }
}

/// Handle an inbound sync request: consume the payload, run the handler, and
/// write the correlated response.  Expired requests are drained and dropped.
pub(crate) async fn handle_sync_request(
    reader: &mut Reader,
    header: &FrameHeader,
    hooks: &SessionHooks,
    conn: &Connection,
    stats: &Statistics,
    guid: Option<Uuid>,
) -> Result<HandlerPanic> {
    if header.is_expired(Utc::now()) {
        debug!(conv = %header.convguid, "dropping expired sync request");
        reader.drain_payload(header.len).await?;
        return Ok(None);
    }
    let data = reader.read_payload(header.len).await?;
    let Some(on_sync_request) = &hooks.on_sync_request else {
        warn!(conv = %header.convguid, "sync request received but no sync handler is registered");
        return Ok(None);
    };

    let event = MessageEvent {
        guid,
        metadata: header.md.clone(),
        data,
    };
    match std::panic::catch_unwind(AssertUnwindSafe(|| on_sync_request(event))) {
        Ok(reply) => {
            let response = FrameHeader::sync_response(header, reply.data.len() as u64, reply.metadata);
            conn.send_bytes(&response, &reply.data).await?;
            stats.record_sent(response.len);
            Ok(None)
        }
        Err(payload) => Ok(Some(panic_context(payload))),
    }
}

/// Handle an inbound sync response: wake the waiter, or drop it when expired
/// or unclaimed.
pub(crate) async fn handle_sync_response(
    reader: &mut Reader,
    header: &FrameHeader,
    correlator: &SyncCorrelator,
) -> Result<()> {
    if header.is_expired(Utc::now()) {
        debug!(conv = %header.convguid, "dropping expired sync response");
        reader.drain_payload(header.len).await?;
        return Ok(());
    }
    let data = reader.read_payload(header.len).await?;
    let delivered = correlator
        .complete(
            header.convguid,
            SyncResponse {
                data,
                metadata: header.md.clone(),
            },
        )
        .await;
    if !delivered {
        debug!(conv = %header.convguid, "sync response had no waiter");
    }
    Ok(())
}
