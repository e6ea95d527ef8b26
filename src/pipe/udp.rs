use std::io;
use std::net::SocketAddr;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use socket2::Socket;
use tokio::net::UdpSocket;
use tracing::trace;
use crate::config::MountConfig;
use crate::pipe::Pipe;

pub struct UdpPipe {
    socket: UdpSocket,
    server_addr: SocketAddr,
    connected: bool,
    send_buf_size: usize,
}

impl UdpPipe {
    pub async fn connect(socket: Socket, config: &MountConfig) -> io::Result<UdpPipe> {
        let socket = UdpSocket::from_std(socket.into())?;
        if config.connected_datagram {
            socket.connect(config.server_addr).await?;
        }

        Ok(UdpPipe {
            socket,
            server_addr: config.server_addr,
            connected: config.connected_datagram,
            send_buf_size: config.socket_buffer_sizes().0,
        })
    }
}

/// Number of bytes in the socket's send queue that the kernel has not handed to the device yet
#[cfg(target_os = "linux")]
fn queued_bytes(socket: &UdpSocket) -> Option<usize> {
    use std::os::fd::AsRawFd;

    let mut queued: libc::c_int = 0;
    // SAFETY: the fd is owned by `socket` and open for the duration of the call, and TIOCOUTQ
    //  (a.k.a. SIOCOUTQ) writes a single c_int through the pointer
    let rc = unsafe { libc::ioctl(socket.as_raw_fd(), libc::TIOCOUTQ, &mut queued as *mut libc::c_int) };
    if rc < 0 {
        return None;
    }
    usize::try_from(queued).ok()
}

#[cfg(not(target_os = "linux"))]
fn queued_bytes(_socket: &UdpSocket) -> Option<usize> {
    None
}

#[async_trait]
impl Pipe for UdpPipe {
    async fn send(&self, dest: Option<SocketAddr>, buf: &[u8]) -> io::Result<usize> {
        if self.connected {
            self.socket.send(buf).await
        }
        else {
            let to = dest.unwrap_or(self.server_addr);
            trace!("UDP pipe: sending {} bytes to {:?}", buf.len(), to);
            self.socket.send_to(buf, to).await
        }
    }

    async fn recv(&self, _want_exact: bool, max_len: usize) -> io::Result<(Bytes, Option<SocketAddr>)> {
        let mut buf = BytesMut::zeroed(max_len);
        let (n, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok((buf.freeze(), Some(from)))
    }

    /// Compares against the reserved send buffer minus what is still queued in it. Where the
    ///  queue length is not available, only the datagram's own size is checked.
    fn has_send_space(&self, len: usize) -> bool {
        let queued = queued_bytes(&self.socket).unwrap_or(0);
        queued.saturating_add(len) <= self.send_buf_size
    }

    async fn shutdown(&self) {
        // nothing to tear down for a datagram socket, it is closed when dropped
    }
}
