//! Server-side client registry.
//!
//! One record per GUID under a single coarse lock, plus small reason maps for
//! server-initiated disconnects.  `replace_guid` (the RegisterClient rekey)
//! swaps the key while the write lock is held, so no reader can observe the
//! old GUID gone and the new one absent.

use crate::connection::Connection;
use crate::events::DisconnectReason;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Live state of one connected client.
pub(crate) struct ClientHandle {
    guid: RwLock<Uuid>,
    addr: SocketAddr,
    conn: Arc<Connection>,
    authenticated: AtomicBool,
    admitted_at: DateTime<Utc>,
    last_seen: RwLock<DateTime<Utc>>,
    name: RwLock<Option<String>>,
    metadata: RwLock<Option<Value>>,
}

impl ClientHandle {
    pub(crate) fn new(guid: Uuid, conn: Arc<Connection>) -> Self {
        let now = Utc::now();
        ClientHandle {
            guid: RwLock::new(guid),
            addr: conn.peer_addr(),
            conn,
            authenticated: AtomicBool::new(false),
            admitted_at: now,
            last_seen: RwLock::new(now),
            name: RwLock::new(None),
            metadata: RwLock::new(None),
        }
    }

    pub(crate) async fn guid(&self) -> Uuid {
        *self.guid.read().await
    }

    pub(crate) fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub(crate) fn set_authenticated(&self) {
        self.authenticated.store(true, Ordering::Release);
    }

    pub(crate) async fn touch(&self) {
        *self.last_seen.write().await = Utc::now();
    }

    pub(crate) async fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.read().await
    }

    pub(crate) async fn snapshot(&self) -> ClientInfo {
        ClientInfo {
            guid: *self.guid.read().await,
            addr: self.addr,
            name: self.name.read().await.clone(),
            metadata: self.metadata.read().await.clone(),
            connected_at: self.admitted_at,
            last_seen: *self.last_seen.read().await,
            authenticated: self.is_authenticated(),
        }
    }

    pub(crate) async fn set_name(&self, name: Option<String>) {
        *self.name.write().await = name;
    }

    pub(crate) async fn set_metadata(&self, metadata: Option<Value>) {
        *self.metadata.write().await = metadata;
    }
}

/// Point-in-time view of a connected client, as returned by `list_clients`.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub guid: Uuid,
    pub addr: SocketAddr,
    /// User-assigned label.
    pub name: Option<String>,
    /// User-assigned opaque metadata.
    pub metadata: Option<Value>,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub authenticated: bool,
}

// ---------------------------------------------------------------------------
// ClientRegistry
// ---------------------------------------------------------------------------

pub(crate) struct ClientRegistry {
    clients: RwLock<HashMap<Uuid, Arc<ClientHandle>>>,
    /// Clients the server kicked, with the reason their session should report.
    kicked: RwLock<HashMap<Uuid, (DisconnectReason, DateTime<Utc>)>>,
    /// Clients the idle reaper disconnected.
    timed_out: RwLock<HashMap<Uuid, DateTime<Utc>>>,
}

impl ClientRegistry {
    pub(crate) fn new() -> Self {
        ClientRegistry {
            clients: RwLock::new(HashMap::new()),
            kicked: RwLock::new(HashMap::new()),
            timed_out: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) async fn add(&self, handle: Arc<ClientHandle>) {
        let guid = handle.guid().await;
        self.clients.write().await.insert(guid, handle);
    }

    pub(crate) async fn get(&self, guid: Uuid) -> Option<Arc<ClientHandle>> {
        self.clients.read().await.get(&guid).cloned()
    }

    pub(crate) async fn exists(&self, guid: Uuid) -> bool {
        self.clients.read().await.contains_key(&guid)
    }

    pub(crate) async fn remove(&self, guid: Uuid) -> Option<Arc<ClientHandle>> {
        let removed = self.clients.write().await.remove(&guid);
        self.kicked.write().await.remove(&guid);
        self.timed_out.write().await.remove(&guid);
        removed
    }

    /// Rebind a client to its declared GUID.  Atomic with respect to every
    /// other registry operation: the map entry moves and the handle's own
    /// GUID updates while the write lock is held.
    pub(crate) async fn replace_guid(&self, old: Uuid, new: Uuid) -> crate::error::Result<()> {
        let mut clients = self.clients.write().await;
        if clients.contains_key(&new) {
            return Err(crate::error::Error::Config(format!(
                "guid {new} is already registered"
            )));
        }
        let handle = clients.remove(&old).ok_or_else(|| {
            crate::error::Error::UnknownClient(old)
        })?;
        *handle.guid.write().await = new;
        clients.insert(new, handle);
        Ok(())
    }

    pub(crate) async fn count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub(crate) async fn handles(&self) -> Vec<Arc<ClientHandle>> {
        self.clients.read().await.values().cloned().collect()
    }

    pub(crate) async fn list(&self) -> Vec<ClientInfo> {
        let handles = self.handles().await;
        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            infos.push(handle.snapshot().await);
        }
        infos
    }

    pub(crate) async fn mark_kicked(&self, guid: Uuid, reason: DisconnectReason) {
        self.kicked.write().await.insert(guid, (reason, Utc::now()));
    }

    pub(crate) async fn mark_timed_out(&self, guid: Uuid) {
        self.timed_out.write().await.insert(guid, Utc::now());
    }

    /// The reason a closing session should report, if the server initiated
    /// the close.  Consumes the marker.
    pub(crate) async fn take_close_reason(&self, guid: Uuid) -> Option<DisconnectReason> {
        if self.timed_out.write().await.remove(&guid).is_some() {
            return Some(DisconnectReason::Timeout);
        }
        self.kicked
            .write()
            .await
            .remove(&guid)
            .map(|(reason, _)| reason)
    }
}
