use std::io;
use std::net::SocketAddr;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Payload does not fit the 2-byte SOCKS5/TCP length prefix.
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("hostname too long: {0} bytes")]
    HostnameTooLong(usize),

    /// Peer violated the SOCKS5 framing (version, auth, reply status, address type).
    #[error("socks5 protocol error: {0}")]
    Protocol(String),

    #[error("peer closed the stream before a complete frame arrived")]
    EndOfStream,

    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Reactor shut down, or the task lost a race and was told to stop.
    #[error("operation cancelled")]
    Cancelled,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("dns codec error: {0}")]
    Dns(#[from] hickory_proto::error::ProtoError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Startup conditions the owning service should restart from instead of crashing.
    pub fn is_expected(&self) -> bool {
        matches!(self, Error::Bind { .. })
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}
