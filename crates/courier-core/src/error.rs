use uuid::Uuid;

/// Library error taxonomy.
///
/// Cancellation and peer-closed conditions get their own variants so the
/// receiver loops can exit quietly on them while surfacing everything else.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket or TLS failure, including writes after disconnect.
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
    /// The peer closed the connection.
    #[error("peer closed the connection")]
    PeerClosed,
    /// Malformed header, unknown status, or an unexpected frame.
    #[error("protocol: {0}")]
    Protocol(String),
    /// Preshared key mismatch or missing credentials.
    #[error("authentication: {0}")]
    Auth(String),
    /// A sync wait expired or an idle timeout fired.
    #[error("timed out")]
    Timeout,
    /// User- or lifecycle-initiated cancellation.
    #[error("cancelled")]
    Cancelled,
    /// Invalid argument or settings value.
    #[error("config: {0}")]
    Config(String),
    /// Operation requires an established connection.
    #[error("not connected")]
    NotConnected,
    /// No active client with the given GUID.
    #[error("unknown client {0}")]
    UnknownClient(Uuid),
}

impl Error {
    /// Errors that end a receiver loop without being noteworthy: the peer
    /// went away or we were asked to stop.  Logged at debug, not surfaced.
    pub(crate) fn is_quiet_disconnect(&self) -> bool {
        match self {
            Error::PeerClosed | Error::Cancelled => true,
            Error::Transport(io) => matches!(
                io.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
