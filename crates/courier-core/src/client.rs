//! The dialing endpoint: connect/disconnect lifecycle, the receiver loop,
//! the idle-server watchdog, and optional auto-reconnect.

use crate::connection::{Connection, PeerStream};
use crate::correlator::{self, SyncCorrelator, SyncResponse};
use crate::dispatch::{self, SessionHooks};
use crate::error::{Error, Result};
use crate::events::{ClientEvent, DisconnectReason, MessageEvent, StreamEvent, SyncReply};
use crate::keepalive;
use crate::settings::ClientSettings;
use crate::stats::Statistics;
use crate::tls;
use chrono::{DateTime, Utc};
use courier_protocol::{FrameHeader, Metadata, PSK_LEN, Status};
use futures_util::FutureExt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct ActiveConnection {
    conn: Arc<Connection>,
    receiver: JoinHandle<()>,
    watchdog: Option<JoinHandle<()>>,
}

struct ClientCore {
    settings: Arc<ClientSettings>,
    hooks: std::sync::RwLock<SessionHooks>,
    events: broadcast::Sender<ClientEvent>,
    stats: Arc<Statistics>,
    correlator: SyncCorrelator,
    active: Mutex<Option<ActiveConnection>>,
    last_activity: RwLock<DateTime<Utc>>,
    /// Set while the user wants the client down; suppresses auto-reconnect.
    user_disconnected: AtomicBool,
}

/// A connection to one [`crate::MessageServer`].
///
/// Register handlers, then `connect()`.  The client is reconnectable: after
/// a disconnect (voluntary or not) `connect()` may be called again, and an
/// `auto_reconnect` policy retries on its own.
pub struct MessageClient {
    core: Arc<ClientCore>,
}

impl MessageClient {
    pub fn new(settings: ClientSettings) -> Self {
        let (events, _) = broadcast::channel(1024);
        MessageClient {
            core: Arc::new(ClientCore {
                settings: Arc::new(settings),
                hooks: std::sync::RwLock::new(SessionHooks::default()),
                events,
                stats: Arc::new(Statistics::new()),
                correlator: SyncCorrelator::new(),
                active: Mutex::new(None),
                last_activity: RwLock::new(Utc::now()),
                user_disconnected: AtomicBool::new(false),
            }),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.core.events.subscribe()
    }

    pub fn statistics(&self) -> Arc<Statistics> {
        self.core.stats.clone()
    }

    /// Deliver inbound messages fully buffered.  Mutually exclusive with the
    /// stream handler.
    pub fn set_message_handler(&mut self, handler: impl Fn(MessageEvent) + Send + Sync + 'static) {
        self.edit_hooks(|hooks| hooks.on_message = Some(Arc::new(handler)));
    }

    /// Deliver inbound payloads as readers.  Mutually exclusive with the
    /// message handler.
    pub fn set_stream_handler<F, Fut>(&mut self, handler: F)
    where
        F: Fn(StreamEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.edit_hooks(|hooks| hooks.on_stream = Some(Arc::new(move |event| handler(event).boxed())));
    }

    /// Answer the server's `send_and_wait` requests.
    pub fn set_sync_request_handler(
        &mut self,
        handler: impl Fn(MessageEvent) -> SyncReply + Send + Sync + 'static,
    ) {
        self.edit_hooks(|hooks| hooks.on_sync_request = Some(Arc::new(handler)));
    }

    /// Supply key material when the server demands authentication and no
    /// preshared key is configured.
    pub fn set_auth_material_provider(
        &mut self,
        provider: impl Fn() -> Vec<u8> + Send + Sync + 'static,
    ) {
        self.edit_hooks(|hooks| hooks.on_auth_material = Some(Arc::new(provider)));
    }

    fn edit_hooks(&mut self, edit: impl FnOnce(&mut SessionHooks)) {
        let mut hooks = self.core.hooks.write().unwrap_or_else(|e| e.into_inner());
        edit(&mut hooks);
    }

    /// Connect to the server, honoring the configured timeout.
    pub async fn connect(&self) -> Result<()> {
        self.core.user_disconnected.store(false, Ordering::Release);
        ClientCore::connect_once(&self.core).await
    }

    /// Disconnect, sending a `Shutdown` notice to the server.
    pub async fn disconnect(&self) -> Result<()> {
        self.disconnect_with(true).await
    }

    pub async fn disconnect_with(&self, send_notice: bool) -> Result<()> {
        self.core.user_disconnected.store(true, Ordering::Release);
        let active = self.core.active.lock().await.take();
        let Some(active) = active else {
            return Err(Error::NotConnected);
        };
        if send_notice {
            active.conn.send_notice(Status::Shutdown).await;
        }
        active.conn.close().await;
        self.core.correlator.clear().await;
        if let Err(e) = active.receiver.await {
            debug!(error = %e, "receiver ended abnormally");
        }
        if let Some(watchdog) = active.watchdog {
            let _ = watchdog.await;
        }
        let _ = self.core.events.send(ClientEvent::Disconnected {
            reason: DisconnectReason::Normal,
        });
        info!("disconnected");
        Ok(())
    }

    /// Present preshared-key material to the server out of band of the
    /// normal challenge flow.
    pub async fn authenticate(&self, material: impl AsRef<[u8]>) -> Result<()> {
        let psk = pad_psk(material.as_ref())?;
        let conn = self.require_conn().await?;
        conn.send_bytes(&FrameHeader::auth_requested(psk), &[])
            .await?;
        self.core.stats.record_sent(0);
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.core.active.lock().await.is_some()
    }

    // -----------------------------------------------------------------------
    // Outbound API
    // -----------------------------------------------------------------------

    pub async fn send(&self, data: impl AsRef<[u8]>, metadata: Option<Metadata>) -> Result<()> {
        let data = data.as_ref();
        let conn = self.require_conn().await?;
        let header = FrameHeader::normal(data.len() as u64, metadata);
        conn.send_bytes(&header, data).await?;
        self.core.stats.record_sent(header.len);
        Ok(())
    }

    /// Send the tail of `data` starting at `start`.
    pub async fn send_from(
        &self,
        data: &[u8],
        start: usize,
        metadata: Option<Metadata>,
    ) -> Result<()> {
        let tail = data.get(start..).ok_or_else(|| {
            Error::Config(format!("start {start} exceeds payload length {}", data.len()))
        })?;
        self.send(tail, metadata).await
    }

    /// Send `len` bytes streamed from `source`.
    pub async fn send_stream(
        &self,
        len: u64,
        source: &mut (dyn AsyncRead + Send + Unpin),
        metadata: Option<Metadata>,
    ) -> Result<()> {
        let conn = self.require_conn().await?;
        let header = FrameHeader::normal(len, metadata);
        conn.send_stream(&header, source).await?;
        self.core.stats.record_sent(len);
        Ok(())
    }

    /// Send a request and wait for the server's correlated response.
    pub async fn send_and_wait(
        &self,
        timeout: Duration,
        data: impl AsRef<[u8]>,
        metadata: Option<Metadata>,
    ) -> Result<SyncResponse> {
        let conn = self.require_conn().await?;
        correlator::send_and_wait_on(
            &conn,
            &self.core.correlator,
            &self.core.stats,
            timeout,
            data.as_ref(),
            metadata,
        )
        .await
    }

    async fn require_conn(&self) -> Result<Arc<Connection>> {
        self.core
            .active
            .lock()
            .await
            .as_ref()
            .map(|active| active.conn.clone())
            .ok_or(Error::NotConnected)
    }
}

impl Drop for MessageClient {
    fn drop(&mut self) {
        // Only this facade holds `active`; tear the tasks down with it.
        if let Ok(mut active) = self.core.active.try_lock()
            && let Some(active) = active.take()
        {
            active.receiver.abort();
            if let Some(watchdog) = active.watchdog {
                watchdog.abort();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connect path
// ---------------------------------------------------------------------------

impl ClientCore {
    fn has_credentials(&self) -> bool {
        let hooks = self.hooks.read().unwrap_or_else(|e| e.into_inner());
        self.settings.preshared_key.is_some() || hooks.on_auth_material.is_some()
    }

    async fn connect_once(core: &Arc<ClientCore>) -> Result<()> {
        let settings = &core.settings;
        settings.validate()?;
        let hooks = {
            let hooks = core.hooks.read().unwrap_or_else(|e| e.into_inner());
            Arc::new(hooks.clone())
        };
        hooks.validate_delivery_mode()?;
        let connector = settings.tls.as_ref().map(tls::build_connector).transpose()?;

        let mut guard = core.active.lock().await;
        if guard.is_some() {
            return Err(Error::Config("client is already connected".to_owned()));
        }

        let stream = dial(settings).await?;
        if let Err(e) = stream.set_nodelay(settings.no_delay) {
            debug!(error = %e, "set_nodelay failed");
        }
        keepalive::apply(&stream, &settings.keepalive);
        let peer_addr = stream.peer_addr()?;

        let peer_stream = match (&connector, &settings.tls) {
            (Some(connector), Some(tls_settings)) => {
                let name = tls::server_name(tls_settings, &settings.host)?;
                let tls_stream = connector.connect(name, stream).await?;
                PeerStream::ClientTls(Box::new(tls_stream))
            }
            _ => PeerStream::Plain(stream),
        };

        let conn = Arc::new(Connection::new(
            peer_stream,
            peer_addr,
            settings.stream_buffer_size,
        ));

        // Without credentials the GUID declaration goes out immediately;
        // with credentials it waits for AuthSuccess so the registration
        // never trips the server's PSK enforcement.
        if !core.has_credentials() {
            conn.send_bytes(&FrameHeader::register_client(settings.guid), &[])
                .await?;
            core.stats.record_sent(0);
        }

        *core.last_activity.write().await = Utc::now();
        let receiver = tokio::spawn(receiver_loop(core.clone(), conn.clone(), hooks));
        let watchdog = settings
            .idle_server_timeout
            .map(|_| tokio::spawn(idle_watchdog(core.clone(), conn.clone())));

        *guard = Some(ActiveConnection {
            conn,
            receiver,
            watchdog,
        });
        drop(guard);

        let _ = core.events.send(ClientEvent::Connected);
        info!(server = %peer_addr, "connected");
        Ok(())
    }

    /// Tear down `conn` if it is still the active one.  Called from the
    /// receiver loop (remote close) and the watchdog (idle timeout); the
    /// first caller wins, later ones are no-ops.
    async fn teardown(self: &Arc<Self>, conn: &Arc<Connection>, reason: DisconnectReason) {
        let mut guard = self.active.lock().await;
        let is_current = guard
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(&active.conn, conn));
        if !is_current {
            return;
        }
        let _active = guard.take();
        drop(guard);

        conn.close().await;
        self.correlator.clear().await;
        let _ = self.events.send(ClientEvent::Disconnected { reason });
        info!(?reason, "server connection lost");

        if self.settings.auto_reconnect.is_some()
            && !self.user_disconnected.load(Ordering::Acquire)
        {
            tokio::spawn(reconnect_loop(self.clone()));
        }
    }
}

async fn dial(settings: &ClientSettings) -> Result<TcpStream> {
    let connect = async {
        if settings.local_port == 0 {
            TcpStream::connect((settings.host.as_str(), settings.port)).await
        } else {
            let mut addrs = lookup_host((settings.host.as_str(), settings.port)).await?;
            let addr = addrs.next().ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("host {} did not resolve", settings.host),
                )
            })?;
            let socket = match addr {
                SocketAddr::V4(_) => TcpSocket::new_v4()?,
                SocketAddr::V6(_) => TcpSocket::new_v6()?,
            };
            socket.set_reuseaddr(true)?;
            let bind_addr: SocketAddr = match addr {
                SocketAddr::V4(_) => ([0, 0, 0, 0], settings.local_port).into(),
                SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, settings.local_port).into(),
            };
            socket.bind(bind_addr)?;
            socket.connect(addr).await
        }
    };
    match tokio::time::timeout(settings.connect_timeout, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(Error::Transport(e)),
        Err(_elapsed) => Err(Error::Timeout),
    }
}

/// Right-pad key material with spaces to the wire's 16 bytes.  The trimmed
/// comparison on the server side makes the padding transparent.
fn pad_psk(material: &[u8]) -> Result<[u8; PSK_LEN]> {
    if material.len() > PSK_LEN {
        return Err(Error::Config(format!(
            "preshared key material must be at most {PSK_LEN} bytes, got {}",
            material.len()
        )));
    }
    let mut psk = [b' '; PSK_LEN];
    psk[..material.len()].copy_from_slice(material);
    Ok(psk)
}

// ---------------------------------------------------------------------------
// Receiver loop
// ---------------------------------------------------------------------------

async fn receiver_loop(core: Arc<ClientCore>, conn: Arc<Connection>, hooks: Arc<SessionHooks>) {
    let reason = run_session(&core, &conn, &hooks).await;
    if let Some(reason) = reason {
        core.teardown(&conn, reason).await;
    }
    // A `None` reason means a local actor (disconnect() or the watchdog)
    // closed the connection and already owns the teardown.
}

async fn run_session(
    core: &Arc<ClientCore>,
    conn: &Arc<Connection>,
    hooks: &SessionHooks,
) -> Option<DisconnectReason> {
    let settings = &core.settings;
    let mut shutdown = conn.shutdown_signal();

    loop {
        let mut reader = conn.reader.lock().await;
        let header = tokio::select! {
            biased;
            _ = shutdown.changed() => return None,
            read = reader.read_header() => match read {
                Ok(header) => header,
                Err(e) if e.is_quiet_disconnect() => {
                    debug!(error = %e, "receive loop ended");
                    return Some(DisconnectReason::Normal);
                }
                Err(e) => {
                    error!(error = %e, "receive loop failed");
                    let _ = core.events.send(ClientEvent::ExceptionEncountered {
                        context: e.to_string(),
                    });
                    return Some(DisconnectReason::Normal);
                }
            },
        };

        core.stats.record_received(header.len);
        *core.last_activity.write().await = Utc::now();

        let outcome = match header.status {
            Status::Removed | Status::Shutdown | Status::Timeout => {
                let _ = reader.drain_payload(header.len).await;
                return DisconnectReason::from_notice(header.status)
                    .or(Some(DisconnectReason::Normal));
            }
            Status::AuthRequired => match reader.drain_payload(header.len).await {
                Ok(()) => {
                    drop(reader);
                    answer_auth_challenge(core, conn, hooks).await
                }
                Err(e) => Err(e),
            },
            Status::AuthSuccess => match reader.drain_payload(header.len).await {
                Ok(()) => {
                    drop(reader);
                    let _ = core.events.send(ClientEvent::AuthenticationSucceeded);
                    info!("authenticated");
                    // Credentials were configured, so the GUID declaration
                    // was deferred until now.
                    conn.send_bytes(&FrameHeader::register_client(settings.guid), &[])
                        .await
                        .map(|()| {
                            core.stats.record_sent(0);
                            None
                        })
                }
                Err(e) => Err(e),
            },
            Status::AuthFailure => {
                let _ = core.events.send(ClientEvent::AuthenticationFailure);
                warn!("authentication rejected by server");
                return Some(DisconnectReason::AuthFailure);
            }
            Status::AuthRequested | Status::RegisterClient => {
                debug!(status = ?header.status, "ignoring server-bound status frame");
                reader.drain_payload(header.len).await.map(|()| None)
            }
            Status::Normal if header.syncreq => {
                dispatch::handle_sync_request(
                    &mut reader,
                    &header,
                    hooks,
                    conn,
                    &core.stats,
                    None,
                )
                .await
            }
            Status::Normal if header.syncresp => {
                dispatch::handle_sync_response(&mut reader, &header, &core.correlator)
                    .await
                    .map(|()| None)
            }
            Status::Normal => {
                dispatch::deliver_frame(
                    &mut reader,
                    &header,
                    hooks,
                    None,
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
                let _ = core
                    .events
                    .send(ClientEvent::ExceptionEncountered { context });
            }
            Err(e) if e.is_quiet_disconnect() => {
                debug!(error = %e, "receive loop ended");
                return Some(DisconnectReason::Normal);
            }
            Err(e) => {
                error!(error = %e, "receive loop failed");
                let _ = core.events.send(ClientEvent::ExceptionEncountered {
                    context: e.to_string(),
                });
                return Some(DisconnectReason::Normal);
            }
        }
    }
}

/// Respond to `AuthRequired` with configured or callback-supplied material.
async fn answer_auth_challenge(
    core: &Arc<ClientCore>,
    conn: &Arc<Connection>,
    hooks: &SessionHooks,
) -> Result<Option<String>> {
    let material = match (&core.settings.preshared_key, &hooks.on_auth_material) {
        (Some(key), _) => Some(key.as_bytes().to_vec()),
        (None, Some(provider)) => Some(provider()),
        (None, None) => None,
    };
    let Some(material) = material else {
        warn!("server demands authentication but no key material is configured");
        return Ok(None);
    };
    let psk = pad_psk(&material)?;
    conn.send_bytes(&FrameHeader::auth_requested(psk), &[])
        .await?;
    core.stats.record_sent(0);
    Ok(None)
}

// ---------------------------------------------------------------------------
// Idle-server watchdog & auto-reconnect
// ---------------------------------------------------------------------------

async fn idle_watchdog(core: Arc<ClientCore>, conn: Arc<Connection>) {
    let Some(timeout) = core.settings.idle_server_timeout else {
        return;
    };
    let Ok(timeout_delta) = chrono::TimeDelta::from_std(timeout) else {
        warn!("idle_server_timeout out of range; watchdog disabled");
        return;
    };
    let interval = core.settings.idle_server_evaluation_interval;
    let mut shutdown = conn.shutdown_signal();

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        let last_activity = *core.last_activity.read().await;
        if Utc::now() - last_activity > timeout_delta {
            info!("server idle past the configured timeout; disconnecting");
            conn.send_notice(Status::Timeout).await;
            core.teardown(&conn, DisconnectReason::Timeout).await;
            return;
        }
    }
}

fn reconnect_loop(core: Arc<ClientCore>) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(reconnect_loop_inner(core))
}

async fn reconnect_loop_inner(core: Arc<ClientCore>) {
    let Some(policy) = core.settings.auto_reconnect.clone() else {
        return;
    };
    let mut attempt: i64 = 0;
    loop {
        if core.user_disconnected.load(Ordering::Acquire) {
            return;
        }
        attempt += 1;
        if policy.max_attempts >= 0 && attempt > i64::from(policy.max_attempts) {
            warn!(attempts = attempt - 1, "auto-reconnect giving up");
            return;
        }
        tokio::time::sleep(policy.interval).await;
        match ClientCore::connect_once(&core).await {
            Ok(()) => {
                info!(attempt, "reconnected");
                return;
            }
            Err(e) => debug!(attempt, error = %e, "reconnect attempt failed"),
        }
    }
}
