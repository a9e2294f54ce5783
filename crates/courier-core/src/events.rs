//! Observable events and user handler types.
//!
//! Lifecycle events fan out over a `tokio::sync::broadcast` channel per
//! endpoint; message, stream, and sync-request delivery go through handler
//! slots registered before startup.  A panic inside a handler is caught and
//! reported as `ExceptionEncountered`; it never tears down a receiver loop.

use courier_protocol::{Metadata, Status};
use futures_util::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncRead;
use uuid::Uuid;

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Normal,
    /// Server-initiated disconnect of a single client.
    Removed,
    /// Idle timeout.
    Timeout,
    /// Peer announced shutdown.
    Shutdown,
    /// Authentication failed or was never completed.
    AuthFailure,
}

impl DisconnectReason {
    /// The status carried in a graceful-close notice for this reason.
    pub(crate) fn notice_status(self) -> Status {
        match self {
            DisconnectReason::Normal => Status::Normal,
            DisconnectReason::Removed => Status::Removed,
            DisconnectReason::Timeout => Status::Timeout,
            DisconnectReason::Shutdown => Status::Shutdown,
            DisconnectReason::AuthFailure => Status::AuthFailure,
        }
    }

    /// Reason communicated by a peer's close notice, if the status is one.
    pub(crate) fn from_notice(status: Status) -> Option<Self> {
        match status {
            Status::Removed => Some(DisconnectReason::Removed),
            Status::Shutdown => Some(DisconnectReason::Shutdown),
            Status::Timeout => Some(DisconnectReason::Timeout),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    Started { addr: SocketAddr },
    Stopped,
    ClientConnected { guid: Uuid, addr: SocketAddr },
    ClientDisconnected { guid: Uuid, reason: DisconnectReason },
    AuthenticationSucceeded { guid: Uuid },
    ExceptionEncountered { context: String },
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected { reason: DisconnectReason },
    AuthenticationSucceeded,
    AuthenticationFailure,
    ExceptionEncountered { context: String },
}

// ---------------------------------------------------------------------------
// Delivery payloads
// ---------------------------------------------------------------------------

/// A fully buffered inbound message.
///
/// `guid` is the sending client on a server, `None` on a client (the peer is
/// always the server).
pub struct MessageEvent {
    pub guid: Option<Uuid>,
    pub metadata: Option<Metadata>,
    pub data: Vec<u8>,
}

/// Payload source handed to a stream handler.  Below the proxied-size
/// threshold this wraps an in-memory buffer; at or above it, bytes come
/// straight off the connection and the handler must drain all `len` of them
/// before the next frame can be read.
pub type PayloadReader = Box<dyn AsyncRead + Send + Unpin>;

pub struct StreamEvent {
    pub guid: Option<Uuid>,
    pub metadata: Option<Metadata>,
    /// Exact payload byte count.
    pub len: u64,
    pub payload: PayloadReader,
}

/// A handler's answer to a sync request.
pub struct SyncReply {
    pub data: Vec<u8>,
    pub metadata: Option<Metadata>,
}

pub type MessageHandler = Arc<dyn Fn(MessageEvent) + Send + Sync>;
pub type StreamHandler = Arc<dyn Fn(StreamEvent) -> BoxFuture<'static, ()> + Send + Sync>;
pub type SyncRequestHandler = Arc<dyn Fn(MessageEvent) -> SyncReply + Send + Sync>;
/// Supplies up to 16 bytes of key material when the server demands
/// authentication and no preshared key is configured.
pub type AuthMaterialProvider = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notice_status_round_trips_for_peer_visible_reasons() {
        for reason in [
            DisconnectReason::Removed,
            DisconnectReason::Shutdown,
            DisconnectReason::Timeout,
        ] {
            assert_eq!(
                DisconnectReason::from_notice(reason.notice_status()),
                Some(reason)
            );
        }
    }

    #[test]
    fn non_close_statuses_are_not_notices() {
        assert_eq!(DisconnectReason::from_notice(Status::Normal), None);
        assert_eq!(DisconnectReason::from_notice(Status::AuthRequested), None);
    }
}
