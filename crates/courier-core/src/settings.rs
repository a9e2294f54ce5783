//! Endpoint configuration.
//!
//! Plain structs with `Default` impls; `validate()` runs at `start()` /
//! `connect()` time and surfaces `Error::Config` synchronously.

use crate::auth::PskKey;
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Default I/O chunk size for payload copies (64 KiB).
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Default threshold at which stream-mode delivery switches from buffered to
/// pass-through (64 MiB).
pub const DEFAULT_MAX_PROXIED_STREAM_SIZE: u64 = 64 * 1024 * 1024;

/// Minimum accepted `send_and_wait` timeout.
pub const MIN_SYNC_TIMEOUT: Duration = Duration::from_millis(1000);

/// Cadence of the server's idle-client reaper.
pub const IDLE_REAPER_TICK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    V1_2,
    V1_3,
}

/// OS-level TCP keepalive knobs.  Unsupported platforms degrade with a
/// warning rather than failing the connection.
#[derive(Debug, Clone)]
pub struct KeepaliveSettings {
    pub enabled: bool,
    /// Idle time before the first probe.
    pub time: Duration,
    /// Interval between probes.
    pub interval: Duration,
    /// Probe count before the connection is declared dead (Unix only).
    pub retry_count: u32,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        KeepaliveSettings {
            enabled: false,
            time: Duration::from_secs(30),
            interval: Duration::from_secs(5),
            retry_count: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TlsServerSettings {
    /// PEM certificate chain presented to clients.
    pub certificate_path: PathBuf,
    /// PEM private key for the certificate.
    pub private_key_path: PathBuf,
    /// Trust anchors for client certificates; required when mutual
    /// authentication is on.
    pub ca_certificate_path: Option<PathBuf>,
    /// Require and validate a client certificate.
    pub mutually_authenticate: bool,
    pub minimum_version: TlsVersion,
}

impl TlsServerSettings {
    pub fn new(certificate_path: impl Into<PathBuf>, private_key_path: impl Into<PathBuf>) -> Self {
        TlsServerSettings {
            certificate_path: certificate_path.into(),
            private_key_path: private_key_path.into(),
            ca_certificate_path: None,
            mutually_authenticate: false,
            minimum_version: TlsVersion::V1_2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TlsClientSettings {
    /// SNI / certificate name; defaults to the host the client dials.
    pub server_name: Option<String>,
    /// Trust anchors for the server certificate.  Required unless
    /// `accept_invalid_certificates` is set.
    pub ca_certificate_path: Option<PathBuf>,
    /// PEM client certificate chain for mutual authentication.
    pub client_certificate_path: Option<PathBuf>,
    /// PEM private key for the client certificate.
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate validation entirely.
    pub accept_invalid_certificates: bool,
    pub minimum_version: TlsVersion,
}

impl Default for TlsClientSettings {
    fn default() -> Self {
        TlsClientSettings {
            server_name: None,
            ca_certificate_path: None,
            client_certificate_path: None,
            client_key_path: None,
            accept_invalid_certificates: false,
            minimum_version: TlsVersion::V1_2,
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// I/O chunk size for payload copies.
    pub stream_buffer_size: usize,
    /// Stream-mode payloads at or above this size are handed to the handler
    /// as a pass-through reader instead of being buffered.
    pub max_proxied_stream_size: u64,
    /// Disconnect clients idle longer than this.  `None` disables the reaper.
    pub idle_client_timeout: Option<Duration>,
    /// Accepting pauses while this many clients are connected.
    pub max_connections: usize,
    /// When non-empty, only these source addresses are admitted.
    pub permitted_ips: HashSet<IpAddr>,
    /// Source addresses rejected at accept; applied after the allow-list.
    pub blocked_ips: HashSet<IpAddr>,
    /// When set, every client must authenticate before exchanging messages.
    pub preshared_key: Option<PskKey>,
    /// Disable Nagle's algorithm on accepted sockets.
    pub no_delay: bool,
    pub keepalive: KeepaliveSettings,
    pub tls: Option<TlsServerSettings>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            max_proxied_stream_size: DEFAULT_MAX_PROXIED_STREAM_SIZE,
            idle_client_timeout: None,
            max_connections: 4096,
            permitted_ips: HashSet::new(),
            blocked_ips: HashSet::new(),
            preshared_key: None,
            no_delay: false,
            keepalive: KeepaliveSettings::default(),
            tls: None,
        }
    }
}

impl ServerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.stream_buffer_size == 0 {
            return Err(Error::Config("stream_buffer_size must be > 0".to_owned()));
        }
        if self.max_proxied_stream_size == 0 {
            return Err(Error::Config(
                "max_proxied_stream_size must be > 0".to_owned(),
            ));
        }
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be > 0".to_owned()));
        }
        if let Some(timeout) = self.idle_client_timeout
            && timeout.is_zero()
        {
            return Err(Error::Config(
                "idle_client_timeout must be positive when set".to_owned(),
            ));
        }
        if let Some(tls) = &self.tls
            && tls.mutually_authenticate
            && tls.ca_certificate_path.is_none()
        {
            return Err(Error::Config(
                "mutual authentication requires ca_certificate_path".to_owned(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Reconnect policy after an unexpected disconnect.
#[derive(Debug, Clone)]
pub struct AutoReconnect {
    pub interval: Duration,
    /// `-1` retries forever.
    pub max_attempts: i32,
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Server host name or IP.  Also the default TLS server name.
    pub host: String,
    pub port: u16,
    /// GUID this client declares to the server.
    pub guid: Uuid,
    pub connect_timeout: Duration,
    /// Source port to bind; 0 lets the OS pick, otherwise must be >= 1024.
    pub local_port: u16,
    pub preshared_key: Option<PskKey>,
    /// Self-disconnect when the server has been silent this long.
    /// `None` disables the watchdog.
    pub idle_server_timeout: Option<Duration>,
    /// Watchdog poll cadence.
    pub idle_server_evaluation_interval: Duration,
    pub auto_reconnect: Option<AutoReconnect>,
    pub stream_buffer_size: usize,
    pub max_proxied_stream_size: u64,
    pub no_delay: bool,
    pub keepalive: KeepaliveSettings,
    pub tls: Option<TlsClientSettings>,
}

impl ClientSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ClientSettings {
            host: host.into(),
            port,
            guid: Uuid::new_v4(),
            connect_timeout: Duration::from_secs(5),
            local_port: 0,
            preshared_key: None,
            idle_server_timeout: None,
            idle_server_evaluation_interval: Duration::from_secs(1),
            auto_reconnect: None,
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            max_proxied_stream_size: DEFAULT_MAX_PROXIED_STREAM_SIZE,
            no_delay: false,
            keepalive: KeepaliveSettings::default(),
            tls: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".to_owned()));
        }
        if self.stream_buffer_size == 0 {
            return Err(Error::Config("stream_buffer_size must be > 0".to_owned()));
        }
        if self.max_proxied_stream_size == 0 {
            return Err(Error::Config(
                "max_proxied_stream_size must be > 0".to_owned(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::Config("connect_timeout must be > 0".to_owned()));
        }
        if self.local_port != 0 && self.local_port < 1024 {
            return Err(Error::Config(
                "local_port must be 0 or >= 1024".to_owned(),
            ));
        }
        if let Some(timeout) = self.idle_server_timeout {
            if timeout.is_zero() {
                return Err(Error::Config(
                    "idle_server_timeout must be positive when set".to_owned(),
                ));
            }
            if self.idle_server_evaluation_interval.is_zero() {
                return Err(Error::Config(
                    "idle_server_evaluation_interval must be > 0".to_owned(),
                ));
            }
        }
        if let Some(reconnect) = &self.auto_reconnect {
            if reconnect.interval.is_zero() {
                return Err(Error::Config(
                    "auto_reconnect interval must be > 0".to_owned(),
                ));
            }
            if reconnect.max_attempts < -1 {
                return Err(Error::Config(
                    "auto_reconnect max_attempts must be -1 or >= 0".to_owned(),
                ));
            }
        }
        if let Some(tls) = &self.tls {
            if !tls.accept_invalid_certificates && tls.ca_certificate_path.is_none() {
                return Err(Error::Config(
                    "tls requires ca_certificate_path unless accept_invalid_certificates is set"
                        .to_owned(),
                ));
            }
            if tls.client_certificate_path.is_some() != tls.client_key_path.is_some() {
                return Err(Error::Config(
                    "client certificate and key must be configured together".to_owned(),
                ));
            }
        }
        Ok(())
    }
}
