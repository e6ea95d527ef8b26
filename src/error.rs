use std::io;
use thiserror::Error;

/// The caller-visible outcome of a failed RPC.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// The caller's cancellation predicate fired, or the mount is being torn down
    #[error("request was cancelled")]
    Cancelled,
    /// The retry ceiling of a soft mount was exhausted
    #[error("request timed out: server did not respond within the retry limit")]
    Timeout,
    #[error("transport error: {0:?}")]
    Transport(TransportErrorKind),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Mount-level condition that no amount of retrying will fix
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<io::Error> for RpcError {
    fn from(value: io::Error) -> Self {
        RpcError::Transport(TransportErrorKind::from(&value))
    }
}

/// Classification of pipe-level failures, as far as the transport engine cares about them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Includes 'restart' - both mean the caller was interrupted
    Interrupted,
    WouldBlock,
    BrokenPipe,
    ConnectionRefused,
    ConnectionReset,
    NotConnected,
    Unreachable,
    NoBufferSpace,
    TimedOut,
    Other,
}

impl TransportErrorKind {
    /// Send errors of these kinds are handed back to the caller rather than being converted
    ///  into a 'must resend' mark on the request.
    pub fn propagates_from_send(self) -> bool {
        matches!(self, TransportErrorKind::Interrupted | TransportErrorKind::WouldBlock | TransportErrorKind::BrokenPipe)
    }

    /// For connectionless transports, receive errors of these kinds are dropped and the receive
    ///  loop simply continues.
    pub fn is_benign_for_datagram(self) -> bool {
        !matches!(self, TransportErrorKind::Interrupted | TransportErrorKind::NotConnected)
    }

    /// NB: A datagram socket that cannot take a packet right now is not broken - the packet is
    ///      simply re-sent later
    pub fn is_transient_for_datagram(self) -> bool {
        matches!(self, TransportErrorKind::NoBufferSpace | TransportErrorKind::WouldBlock)
    }
}

impl From<&io::Error> for TransportErrorKind {
    fn from(value: &io::Error) -> Self {
        use io::ErrorKind::*;

        if value.raw_os_error() == Some(libc::ENOBUFS) {
            return TransportErrorKind::NoBufferSpace;
        }

        match value.kind() {
            Interrupted => TransportErrorKind::Interrupted,
            WouldBlock => TransportErrorKind::WouldBlock,
            BrokenPipe | UnexpectedEof => TransportErrorKind::BrokenPipe,
            ConnectionRefused => TransportErrorKind::ConnectionRefused,
            ConnectionReset | ConnectionAborted => TransportErrorKind::ConnectionReset,
            NotConnected => TransportErrorKind::NotConnected,
            HostUnreachable | NetworkUnreachable => TransportErrorKind::Unreachable,
            TimedOut => TransportErrorKind::TimedOut,
            _ => TransportErrorKind::Other,
        }
    }
}

/// Problems with the RPC layer of a message, as opposed to the pipe carrying it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed RPC message")]
    Malformed,
    #[error("RPC message is not a reply")]
    NotAReply,
    #[error("impossible record length {0}")]
    RecordTooLong(u32),
    #[error("server does not support RPC version 2 (supports {low}..={high})")]
    RpcMismatch { low: u32, high: u32 },
    #[error("server rejected credentials (auth_stat {0})")]
    AuthError(u32),
    #[error("program unavailable")]
    ProgUnavailable,
    #[error("program version mismatch (server supports {low}..={high})")]
    ProgMismatch { low: u32, high: u32 },
    #[error("procedure unavailable")]
    ProcUnavailable,
    #[error("server could not decode arguments")]
    GarbageArgs,
    #[error("server system error")]
    SystemError,
}
