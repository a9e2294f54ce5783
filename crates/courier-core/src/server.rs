//! The listening endpoint: accept loop, admission control, per-client
//! sessions, idle reaper, and the outbound send API.

use crate::connection::{Connection, PeerStream};
use crate::correlator::{self, SyncCorrelator, SyncResponse};
use crate::dispatch::{self, SessionHooks};
use crate::error::{Error, Result};
use crate::events::{
    DisconnectReason, MessageEvent, ServerEvent, StreamEvent, SyncReply,
};
use crate::framing::FrameReader;
use crate::keepalive;
use crate::registry::{ClientHandle, ClientInfo, ClientRegistry};
use crate::settings::{IDLE_REAPER_TICK, ServerSettings};
use crate::stats::Statistics;
use crate::tls;
use chrono::Utc;
use courier_protocol::{FrameHeader, Metadata, Status};
use futures_util::FutureExt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long `stop()` waits for client sessions to drain.
const STOP_QUIESCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Re-check cadence of the admission gate while at the connection cap.
const ADMISSION_RECHECK: Duration = Duration::from_millis(250);

struct ServerShared {
    settings: Arc<ServerSettings>,
    registry: ClientRegistry,
    correlator: SyncCorrelator,
    stats: Arc<Statistics>,
    events: broadcast::Sender<ServerEvent>,
    shutdown: watch::Sender<bool>,
    /// Connections admitted and not yet torn down; gates the accept loop.
    active: AtomicUsize,
    slot_freed: Notify,
    local_addr: std::sync::RwLock<Option<SocketAddr>>,
}

/// A multi-client TCP/TLS message server.
///
/// Register handlers, then `start()`.  Lifecycle events fan out on the
/// broadcast channel returned by [`MessageServer::events`].
pub struct MessageServer {
    bind_addr: SocketAddr,
    shared: Arc<ServerShared>,
    hooks: SessionHooks,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
}

impl MessageServer {
    pub fn new(bind_addr: SocketAddr, settings: ServerSettings) -> Self {
        let (events, _) = broadcast::channel(4096);
        let (shutdown, _) = watch::channel(false);
        MessageServer {
            bind_addr,
            shared: Arc::new(ServerShared {
                settings: Arc::new(settings),
                registry: ClientRegistry::new(),
                correlator: SyncCorrelator::new(),
                stats: Arc::new(Statistics::new()),
                events,
                shutdown,
                active: AtomicUsize::new(0),
                slot_freed: Notify::new(),
                local_addr: std::sync::RwLock::new(None),
            }),
            hooks: SessionHooks::default(),
            tasks: Vec::new(),
            started: false,
        }
    }

    /// Subscribe to lifecycle events.  Each receiver sees every event from
    /// the moment it subscribes.
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    /// Deliver inbound messages fully buffered.  Mutually exclusive with the
    /// stream handler.
    pub fn set_message_handler(&mut self, handler: impl Fn(MessageEvent) + Send + Sync + 'static) {
        self.hooks.on_message = Some(Arc::new(handler));
    }

    /// Deliver inbound payloads as readers; large payloads stream straight
    /// off the wire.  Mutually exclusive with the message handler.
    pub fn set_stream_handler<F, Fut>(&mut self, handler: F)
    where
        F: Fn(StreamEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks.on_stream = Some(Arc::new(move |event| handler(event).boxed()));
    }

    /// Answer clients' `send_and_wait` requests.
    pub fn set_sync_request_handler(
        &mut self,
        handler: impl Fn(MessageEvent) -> SyncReply + Send + Sync + 'static,
    ) {
        self.hooks.on_sync_request = Some(Arc::new(handler));
    }

    /// Bind the listener and start accepting clients.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::Config("server is already started".to_owned()));
        }
        self.shared.settings.validate()?;
        self.hooks.validate_delivery_mode()?;
        let acceptor = self
            .shared
            .settings
            .tls
            .as_ref()
            .map(tls::build_acceptor)
            .transpose()?;

        let listener = TcpListener::bind(self.bind_addr).await?;
        let addr = listener.local_addr()?;
        *self
            .shared
            .local_addr
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(addr);

        let _ = self.shared.shutdown.send(false);
        let hooks = Arc::new(self.hooks.clone());
        self.tasks.push(tokio::spawn(accept_loop(
            self.shared.clone(),
            listener,
            hooks,
            acceptor,
        )));
        if self.shared.settings.idle_client_timeout.is_some() {
            self.tasks.push(tokio::spawn(idle_reaper(self.shared.clone())));
        }

        self.started = true;
        let _ = self.shared.events.send(ServerEvent::Started { addr });
        info!(%addr, "server started");
        Ok(())
    }

    /// Gracefully stop: notify clients with `Shutdown`, close every
    /// connection, and wait for background tasks to quiesce.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        self.disconnect_all().await;
        let _ = self.shared.shutdown.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                debug!(error = %e, "background task ended abnormally");
            }
        }

        // Client sessions are free-running tasks; wait for them to drain.
        let deadline = tokio::time::Instant::now() + STOP_QUIESCE_TIMEOUT;
        while self.shared.active.load(Ordering::Acquire) > 0
            && tokio::time::Instant::now() < deadline
        {
            let _ = tokio::time::timeout(
                Duration::from_millis(50),
                self.shared.slot_freed.notified(),
            )
            .await;
        }

        *self
            .shared
            .local_addr
            .write()
            .unwrap_or_else(|e| e.into_inner()) = None;
        self.started = false;
        let _ = self.shared.events.send(ServerEvent::Stopped);
        info!("server stopped");
        Ok(())
    }

    /// The bound listener address while running (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .shared
            .local_addr
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn statistics(&self) -> Arc<Statistics> {
        self.shared.stats.clone()
    }

    // -----------------------------------------------------------------------
    // Outbound API
    // -----------------------------------------------------------------------

    /// Send a message to one client.
    pub async fn send(
        &self,
        guid: Uuid,
        data: impl AsRef<[u8]>,
        metadata: Option<Metadata>,
    ) -> Result<()> {
        let data = data.as_ref();
        let handle = self.require_client(guid).await?;
        let header = FrameHeader::normal(data.len() as u64, metadata);
        handle.conn().send_bytes(&header, data).await?;
        self.shared.stats.record_sent(header.len);
        Ok(())
    }

    /// Send the tail of `data` starting at `start`.
    pub async fn send_from(
        &self,
        guid: Uuid,
        data: &[u8],
        start: usize,
        metadata: Option<Metadata>,
    ) -> Result<()> {
        let tail = data
            .get(start..)
            .ok_or_else(|| Error::Config(format!("start {start} exceeds payload length {}", data.len())))?;
        self.send(guid, tail, metadata).await
    }

    /// Send `len` bytes streamed from `source`.
    pub async fn send_stream(
        &self,
        guid: Uuid,
        len: u64,
        source: &mut (dyn AsyncRead + Send + Unpin),
        metadata: Option<Metadata>,
    ) -> Result<()> {
        let handle = self.require_client(guid).await?;
        let header = FrameHeader::normal(len, metadata);
        handle.conn().send_stream(&header, source).await?;
        self.shared.stats.record_sent(len);
        Ok(())
    }

    /// Send a request and wait for the client's correlated response.
    pub async fn send_and_wait(
        &self,
        timeout: Duration,
        guid: Uuid,
        data: impl AsRef<[u8]>,
        metadata: Option<Metadata>,
    ) -> Result<SyncResponse> {
        let handle = self.require_client(guid).await?;
        correlator::send_and_wait_on(
            handle.conn(),
            &self.shared.correlator,
            &self.shared.stats,
            timeout,
            data.as_ref(),
            metadata,
        )
        .await
    }

    /// Disconnect one client with the default `Removed` notice.
    pub async fn disconnect_client(&self, guid: Uuid) -> Result<()> {
        self.disconnect_client_with(guid, DisconnectReason::Removed, true)
            .await
    }

    pub async fn disconnect_client_with(
        &self,
        guid: Uuid,
        reason: DisconnectReason,
        send_notice: bool,
    ) -> Result<()> {
        let handle = self.require_client(guid).await?;
        self.shared.registry.mark_kicked(guid, reason).await;
        if send_notice {
            handle.conn().send_notice(reason.notice_status()).await;
        }
        handle.conn().close().await;
        Ok(())
    }

    /// Disconnect every client with a `Shutdown` notice.
    pub async fn disconnect_all(&self) {
        self.disconnect_all_with(DisconnectReason::Shutdown).await;
    }

    pub async fn disconnect_all_with(&self, reason: DisconnectReason) {
        for handle in self.shared.registry.handles().await {
            let guid = handle.guid().await;
            if let Err(e) = self.disconnect_client_with(guid, reason, true).await {
                debug!(%guid, error = %e, "client vanished during mass disconnect");
            }
        }
    }

    pub async fn is_client_connected(&self, guid: Uuid) -> bool {
        self.shared.registry.exists(guid).await
    }

    pub async fn list_clients(&self) -> Vec<ClientInfo> {
        self.shared.registry.list().await
    }

    pub async fn connection_count(&self) -> usize {
        self.shared.registry.count().await
    }

    /// Attach a user-visible label to a client.
    pub async fn set_client_name(&self, guid: Uuid, name: Option<String>) -> Result<()> {
        self.require_client(guid).await?.set_name(name).await;
        Ok(())
    }

    /// Attach opaque user metadata to a client.
    pub async fn set_client_metadata(
        &self,
        guid: Uuid,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        self.require_client(guid).await?.set_metadata(metadata).await;
        Ok(())
    }

    async fn require_client(&self, guid: Uuid) -> Result<Arc<ClientHandle>> {
        self.shared
            .registry
            .get(guid)
            .await
            .ok_or(Error::UnknownClient(guid))
    }
}

impl Drop for MessageServer {
    fn drop(&mut self) {
        let _ = self.shared.shutdown.send(true);
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Accept loop & admission
// ---------------------------------------------------------------------------

fn admit_ip(settings: &ServerSettings, ip: IpAddr) -> bool {
    if !settings.permitted_ips.is_empty() && !settings.permitted_ips.contains(&ip) {
        return false;
    }
    !settings.blocked_ips.contains(&ip)
}

async fn accept_loop(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    hooks: Arc<SessionHooks>,
    acceptor: Option<TlsAcceptor>,
) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        // Admission gate: park while at the connection cap.  Accepting stops
        // entirely; pending connections sit in the OS backlog.
        while shared.active.load(Ordering::Acquire) >= shared.settings.max_connections {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::timeout(ADMISSION_RECHECK, shared.slot_freed.notified()) => {}
            }
        }

        let (stream, peer) = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            }
        };

        if !admit_ip(&shared.settings, peer.ip()) {
            debug!(%peer, "connection rejected by ip policy");
            continue;
        }

        shared.active.fetch_add(1, Ordering::AcqRel);
        let shared = shared.clone();
        let hooks = hooks.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            run_client(&shared, hooks, acceptor, stream, peer).await;
            shared.active.fetch_sub(1, Ordering::AcqRel);
            shared.slot_freed.notify_waiters();
        });
    }
}

/// Finalize one accepted connection and run its session to completion.
async fn run_client(
    shared: &Arc<ServerShared>,
    hooks: Arc<SessionHooks>,
    acceptor: Option<TlsAcceptor>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    if let Err(e) = stream.set_nodelay(shared.settings.no_delay) {
        debug!(%peer, error = %e, "set_nodelay failed");
    }
    keepalive::apply(&stream, &shared.settings.keepalive);

    let peer_stream = match &acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls) => PeerStream::ServerTls(Box::new(tls)),
            Err(e) => {
                warn!(%peer, error = %e, "tls handshake failed");
                return;
            }
        },
        None => PeerStream::Plain(stream),
    };

    let conn = Arc::new(Connection::new(
        peer_stream,
        peer,
        shared.settings.stream_buffer_size,
    ));
    let guid = Uuid::new_v4();
    let handle = Arc::new(ClientHandle::new(guid, conn.clone()));
    if shared.settings.preshared_key.is_none() {
        handle.set_authenticated();
    }
    shared.registry.add(handle.clone()).await;
    let _ = shared
        .events
        .send(ServerEvent::ClientConnected { guid, addr: peer });
    info!(%guid, %peer, "client connected");

    if shared.settings.preshared_key.is_some() {
        let challenge = FrameHeader::control(Status::AuthRequired);
        if let Err(e) = conn.send_bytes(&challenge, &[]).await {
            debug!(%guid, error = %e, "auth challenge not delivered");
        } else {
            shared.stats.record_sent(0);
        }
    }

    let reason = session_loop(shared, &hooks, &handle).await;

    let guid = handle.guid().await;
    shared.registry.remove(guid).await;
    conn.close().await;
    let _ = shared
        .events
        .send(ServerEvent::ClientDisconnected { guid, reason });
    info!(%guid, ?reason, "client disconnected");
}

// ---------------------------------------------------------------------------
// Per-client session
// ---------------------------------------------------------------------------

async fn session_loop(
    shared: &Arc<ServerShared>,
    hooks: &SessionHooks,
    handle: &Arc<ClientHandle>,
) -> DisconnectReason {
    let conn = handle.conn().clone();
    let mut shutdown = conn.shutdown_signal();
    let settings = &shared.settings;

    loop {
        let mut reader = conn.reader.lock().await;
        let header = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                let guid = handle.guid().await;
                return shared
                    .registry
                    .take_close_reason(guid)
                    .await
                    .unwrap_or(DisconnectReason::Normal);
            }
            read = reader.read_header() => match read {
                Ok(header) => header,
                Err(e) => return end_of_session(shared, handle, e).await,
            },
        };

        shared.stats.record_received(header.len);
        handle.touch().await;

        // PSK gate: an unauthenticated peer gets exactly one chance, and it
        // must be an AuthRequested frame with matching material.
        if let Some(key) = &settings.preshared_key
            && !handle.is_authenticated()
        {
            let presented_ok = header.status == Status::AuthRequested
                && header.psk.as_deref().is_some_and(|psk| key.matches(psk));
            if let Err(e) = reader.drain_payload(header.len).await {
                return end_of_session(shared, handle, e).await;
            }
            drop(reader);
            let guid = handle.guid().await;
            if presented_ok {
                handle.set_authenticated();
                let _ = shared
                    .events
                    .send(ServerEvent::AuthenticationSucceeded { guid });
                info!(%guid, "client authenticated");
                if let Err(e) = conn
                    .send_bytes(&FrameHeader::control(Status::AuthSuccess), &[])
                    .await
                {
                    return end_of_session(shared, handle, e).await;
                }
                shared.stats.record_sent(0);
            } else {
                warn!(%guid, status = ?header.status, "unauthenticated frame rejected");
                let _ = conn
                    .send_bytes(&FrameHeader::control(Status::AuthFailure), &[])
                    .await;
                return DisconnectReason::AuthFailure;
            }
            continue;
        }

        let outcome = match header.status {
            Status::Shutdown | Status::Removed | Status::Timeout => {
                let _ = reader.drain_payload(header.len).await;
                return DisconnectReason::from_notice(header.status)
                    .unwrap_or(DisconnectReason::Normal);
            }
            Status::RegisterClient => {
                rekey_client(shared, handle, &mut reader, &header).await
            }
            Status::AuthRequested => {
                // No PSK configured; acknowledge so the client proceeds.
                match reader.drain_payload(header.len).await {
                    Ok(()) => conn
                        .send_bytes(&FrameHeader::control(Status::AuthSuccess), &[])
                        .await
                        .map(|()| {
                            shared.stats.record_sent(0);
                            None
                        }),
                    Err(e) => Err(e),
                }
            }
            Status::AuthRequired | Status::AuthSuccess | Status::AuthFailure => {
                debug!(status = ?header.status, "ignoring client-only status frame");
                reader.drain_payload(header.len).await.map(|()| None)
            }
            Status::Normal if header.syncreq => {
                let guid = handle.guid().await;
                dispatch::handle_sync_request(
                    &mut reader,
                    &header,
                    hooks,
                    &conn,
                    &shared.stats,
                    Some(guid),
                )
                .await
            }
            Status::Normal if header.syncresp => {
                dispatch::handle_sync_response(&mut reader, &header, &shared.correlator)
                    .await
                    .map(|()| None)
            }
            Status::Normal => {
                let guid = handle.guid().await;
                dispatch::deliver_frame(
                    &mut reader,
                    &header,
                    hooks,
                    Some(guid),
                    settings.stream_buffer_size,
                    settings.max_proxied_stream_size,
                )
                .await
            }
        };

        match outcome {
            Ok(None) => {}
            Ok(Some(context)) => {
                error!(context = %context, "handler panicked");
                let _ = shared
                    .events
                    .send(ServerEvent::ExceptionEncountered { context });
            }
            Err(e) => return end_of_session(shared, handle, e).await,
        }
    }
}

async fn rekey_client(
    shared: &Arc<ServerShared>,
    handle: &Arc<ClientHandle>,
    reader: &mut FrameReader<ReadHalf<PeerStream>>,
    header: &FrameHeader,
) -> Result<Option<String>> {
    reader.drain_payload(header.len).await?;
    let Some(declared) = header.senderguid else {
        debug!("register frame without a sender guid");
        return Ok(None);
    };
    let current = handle.guid().await;
    if current == declared {
        return Ok(None);
    }
    match shared.registry.replace_guid(current, declared).await {
        Ok(()) => info!(old = %current, new = %declared, "client rekeyed"),
        Err(e) => warn!(old = %current, new = %declared, error = %e, "rekey rejected"),
    }
    Ok(None)
}

/// Classify a receive failure per the propagation policy: cancellation and
/// peer loss exit quietly at debug, everything else is surfaced.
async fn end_of_session(
    shared: &Arc<ServerShared>,
    handle: &Arc<ClientHandle>,
    e: Error,
) -> DisconnectReason {
    if e.is_quiet_disconnect() {
        debug!(error = %e, "receive loop ended");
        let guid = handle.guid().await;
        return shared
            .registry
            .take_close_reason(guid)
            .await
            .unwrap_or(DisconnectReason::Normal);
    }
    error!(error = %e, "receive loop failed");
    let _ = shared.events.send(ServerEvent::ExceptionEncountered {
        context: e.to_string(),
    });
    DisconnectReason::Normal
}

// ---------------------------------------------------------------------------
// Idle reaper
// ---------------------------------------------------------------------------

async fn idle_reaper(shared: Arc<ServerShared>) {
    let Some(timeout) = shared.settings.idle_client_timeout else {
        return;
    };
    let Ok(timeout_delta) = chrono::TimeDelta::from_std(timeout) else {
        warn!("idle_client_timeout out of range; reaper disabled");
        return;
    };
    let mut shutdown = shared.shutdown.subscribe();
    let mut ticker = tokio::time::interval(IDLE_REAPER_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }
        let cutoff = Utc::now() - timeout_delta;
        for handle in shared.registry.handles().await {
            if handle.last_seen().await >= cutoff {
                continue;
            }
            let guid = handle.guid().await;
            info!(%guid, "idle client timed out");
            shared.registry.mark_timed_out(guid).await;
            handle.conn().send_notice(Status::Timeout).await;
            handle.conn().close().await;
        }
    }
}
