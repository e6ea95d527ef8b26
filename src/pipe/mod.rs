//! The byte pipe underneath an endpoint, i.e. a UDP or TCP socket to the server. The transport
//!  engine only talks to the pipe through the [Pipe] trait so that tests can replace it.

use std::io;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, trace};
use crate::config::MountConfig;

pub mod tcp;
pub mod udp;

/// The 'should abort' predicate of a calling context, e.g. 'a signal is pending'
pub type CancelPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

pub fn never_cancel() -> CancelPredicate {
    Arc::new(|| false)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    /// UDP - every message is a single datagram, nothing is guaranteed
    Datagram,
    /// TCP - messages are delimited by record marks, the pipe must be reconnected on failure
    Stream,
}

impl TransportKind {
    pub fn is_connection_oriented(self) -> bool {
        self == TransportKind::Stream
    }
}

/// This is an abstraction for an established socket to the server, introduced to facilitate
///  mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Pipe: Send + Sync + 'static {
    /// Returns the number of bytes accepted by the pipe. `dest` is only used for unconnected
    ///  datagram sockets.
    async fn send(&self, dest: Option<SocketAddr>, buf: &[u8]) -> io::Result<usize>;

    /// With `want_exact`, this returns exactly `max_len` bytes or fails. Otherwise it returns
    ///  whatever a single read yields, up to `max_len` bytes (i.e. one datagram).
    ///
    /// NB: This must be cancel safe - bytes read by a read that is dropped before completing
    ///      remain in the pipe for the next call.
    async fn recv(&self, want_exact: bool, max_len: usize) -> io::Result<(Bytes, Option<SocketAddr>)>;

    /// Is there room in the socket's send buffer for a message of this size?
    fn has_send_space(&self, len: usize) -> bool;

    async fn shutdown(&self);
}

/// Creates pipes for a mount, introduced to facilitate replacing real sockets in tests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PipeConnector: Send + Sync + 'static {
    async fn connect(&self, config: &MountConfig) -> io::Result<Arc<dyn Pipe>>;
}

/// Connects real sockets, configured the way the mount wants them
pub struct SocketConnector;

/// the range of privileged ports that is tried, walking downwards, for `reserved_port` mounts
const RESERVED_PORT_MAX: u16 = 1023;
const RESERVED_PORT_MIN: u16 = 600;

impl SocketConnector {
    fn create_socket(config: &MountConfig) -> io::Result<Socket> {
        let (ty, protocol) = match config.transport {
            TransportKind::Datagram => (Type::DGRAM, Protocol::UDP),
            TransportKind::Stream => (Type::STREAM, Protocol::TCP),
        };
        let socket = Socket::new(Domain::for_address(config.server_addr), ty, Some(protocol))?;

        let (send_buf_size, recv_buf_size) = config.socket_buffer_sizes();
        socket.set_send_buffer_size(send_buf_size)?;
        socket.set_recv_buffer_size(recv_buf_size)?;
        trace!("reserved socket buffers: send {}, receive {}", send_buf_size, recv_buf_size);

        if config.transport.is_connection_oriented() {
            socket.set_keepalive(true)?;
        }
        socket.set_nonblocking(true)?;

        if config.reserved_port {
            Self::bind_reserved_port(&socket, config.server_addr)?;
        }
        else if !config.transport.is_connection_oriented() {
            // an unconnected datagram socket must have a local address before it can receive
            socket.bind(&SockAddr::from(SocketAddr::new(Self::unspecified_ip(config.server_addr), 0)))?;
        }
        Ok(socket)
    }

    fn unspecified_ip(server_addr: SocketAddr) -> IpAddr {
        match server_addr {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    fn bind_reserved_port(socket: &Socket, server_addr: SocketAddr) -> io::Result<()> {
        let ip = Self::unspecified_ip(server_addr);
        for port in (RESERVED_PORT_MIN..=RESERVED_PORT_MAX).rev() {
            match socket.bind(&SockAddr::from(SocketAddr::new(ip, port))) {
                Ok(()) => {
                    debug!("bound to reserved port {}", port);
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::AddrInUse => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(ErrorKind::AddrInUse, "no free reserved port"))
    }
}

#[async_trait]
impl PipeConnector for SocketConnector {
    async fn connect(&self, config: &MountConfig) -> io::Result<Arc<dyn Pipe>> {
        let socket = Self::create_socket(config)?;

        let connect = async {
            let pipe: Arc<dyn Pipe> = match config.transport {
                TransportKind::Datagram => Arc::new(udp::UdpPipe::connect(socket, config).await?),
                TransportKind::Stream => Arc::new(tcp::TcpPipe::connect(socket, config).await?),
            };
            Ok::<_, io::Error>(pipe)
        };

        match tokio::time::timeout(config.connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(ErrorKind::TimedOut, "connecting to the server timed out")),
        }
    }
}
