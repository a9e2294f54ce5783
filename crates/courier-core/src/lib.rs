//! courier-core: reliable, bidirectional, multi-client messaging over raw
//! TCP or TLS.
//!
//! A [`MessageServer`] listens for connections; [`MessageClient`]s connect
//! and exchange discrete messages — an application-defined byte payload plus
//! an optional JSON metadata map — framed as a JSON header, a `\r\n\r\n`
//! terminator, and the payload bytes.  On top of the frame exchange the
//! library provides a synchronous request/response correlator, a
//! preshared-key authentication handshake, idle-timeout and keepalive
//! discipline, and admission control.

mod auth;
mod client;
mod connection;
mod correlator;
mod dispatch;
mod error;
mod events;
mod framing;
mod keepalive;
mod registry;
mod server;
mod settings;
mod stats;
mod tls;

pub use auth::PskKey;
pub use client::MessageClient;
pub use correlator::SyncResponse;
pub use error::{Error, Result};
pub use events::{
    ClientEvent, DisconnectReason, MessageEvent, PayloadReader, ServerEvent, StreamEvent,
    SyncReply,
};
pub use registry::ClientInfo;
pub use server::MessageServer;
pub use settings::{
    AutoReconnect, ClientSettings, DEFAULT_MAX_PROXIED_STREAM_SIZE, DEFAULT_STREAM_BUFFER_SIZE,
    IDLE_REAPER_TICK, KeepaliveSettings, MIN_SYNC_TIMEOUT, ServerSettings, TlsClientSettings,
    TlsServerSettings, TlsVersion,
};
pub use stats::{Statistics, StatisticsSnapshot};

pub use courier_protocol as protocol;
pub use courier_protocol::{Metadata, Status};
