//! OS-level TCP keepalive configuration.

use crate::settings::KeepaliveSettings;
use tokio::net::TcpStream;
use tracing::warn;

/// Apply keepalive parameters to an established socket.  Platforms that
/// reject the options degrade silently apart from a warning.
pub(crate) fn apply(stream: &TcpStream, settings: &KeepaliveSettings) {
    if !settings.enabled {
        return;
    }
    let sock = socket2::SockRef::from(stream);
    #[allow(unused_mut)]
    let mut keepalive = socket2::TcpKeepalive::new()
        .with_time(settings.time)
        .with_interval(settings.interval);
    #[cfg(unix)]
    {
        keepalive = keepalive.with_retries(settings.retry_count);
    }
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "tcp keepalive not supported on this platform; continuing without");
    }
}
