use std::cmp::min;
use std::io;
use std::net::SocketAddr;
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use socket2::Socket;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpSocket;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, trace};
use crate::config::MountConfig;
use crate::pipe::Pipe;

/// upper bound for a single buffer reservation while waiting for an exact read
const READ_CHUNK: usize = 64 * 1024;

struct ReadSide {
    half: OwnedReadHalf,
    /// bytes that were read but not yet returned, e.g. because the read that asked for them was
    ///  dropped, or because a single read returned more than was asked for
    pending: BytesMut,
}

struct WriteSide {
    half: OwnedWriteHalf,
    /// bytes that were accepted by `send`, but not written yet. A send that is dropped halfway
    ///  leaves the rest of its record here, and the next send writes it first.
    unsent: BytesMut,
}

pub struct TcpPipe {
    reader: Mutex<ReadSide>,
    writer: Mutex<WriteSide>,
    peer_addr: SocketAddr,
}

impl TcpPipe {
    pub async fn connect(socket: Socket, config: &MountConfig) -> io::Result<TcpPipe> {
        let socket = TcpSocket::from_std_stream(socket.into());
        let stream = socket.connect(config.server_addr).await?;
        stream.set_nodelay(true)?;
        debug!("TCP pipe connected to {:?} from {:?}", config.server_addr, stream.local_addr()?);

        let (half, writer) = stream.into_split();
        Ok(TcpPipe {
            reader: Mutex::new(ReadSide { half, pending: BytesMut::new() }),
            writer: Mutex::new(WriteSide { half: writer, unsent: BytesMut::new() }),
            peer_addr: config.server_addr,
        })
    }
}

#[async_trait]
impl Pipe for TcpPipe {
    async fn send(&self, _dest: Option<SocketAddr>, buf: &[u8]) -> io::Result<usize> {
        let mut writer = self.writer.lock().await;
        let WriteSide { half, unsent } = &mut *writer;

        // a record is never interleaved with the remainder of a previous one
        unsent.extend_from_slice(buf);
        while !unsent.is_empty() {
            // `write` is cancel safe, `unsent` only shrinks by what was actually written
            match half.write(&unsent[..]).await {
                Ok(0) => {
                    unsent.clear();
                    return Err(io::ErrorKind::WriteZero.into());
                }
                Ok(n) => unsent.advance(n),
                Err(e) => {
                    unsent.clear();
                    return Err(e);
                }
            }
        }
        Ok(buf.len())
    }

    async fn recv(&self, want_exact: bool, max_len: usize) -> io::Result<(Bytes, Option<SocketAddr>)> {
        let mut reader = self.reader.lock().await;
        let ReadSide { half, pending } = &mut *reader;

        if want_exact {
            while pending.len() < max_len {
                pending.reserve(min(max_len - pending.len(), READ_CHUNK));
                // read_buf is cancel safe, and so is the progress stored in `pending`
                if half.read_buf(pending).await? == 0 {
                    trace!("TCP pipe: EOF after {} of {} bytes", pending.len(), max_len);
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
            }
        }
        else if pending.is_empty() {
            pending.reserve(min(max_len, READ_CHUNK));
            if half.read_buf(pending).await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }

        let n = min(max_len, pending.len());
        Ok((pending.split_to(n).freeze(), Some(self.peer_addr)))
    }

    fn has_send_space(&self, _len: usize) -> bool {
        true
    }

    async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if !writer.unsent.is_empty() {
            trace!("TCP pipe: discarding {} unsent bytes on shutdown", writer.unsent.len());
        }
        if let Err(e) = writer.half.shutdown().await {
            debug!("error shutting down TCP pipe: {}", e);
        }
    }
}
