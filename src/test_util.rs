//! This module contains utilities for testing code that sits on top of an [RpcEndpoint]: an
//!  in-memory pipe that replays scripted server behavior, and a connector handing out such
//!  pipes. They are used for testing the transport engine itself, but they are part of the
//!  crate's regular code so that they are available for application testing as well.
//!
//! [RpcEndpoint]: crate::endpoint::RpcEndpoint

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{mpsc, Notify};
use tracing::trace;
use crate::config::MountConfig;
use crate::pipe::{Pipe, PipeConnector, TransportKind};
use crate::rpc_header::{peek_xid, Xid};
use crate::transmitter::with_record_mark;

/// A successful RPC reply message for `xid` with AUTH_NULL verifier, followed by `results`
pub fn rpc_reply(xid: Xid, results: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(24 + results.len());
    buf.put_u32(xid);
    buf.put_u32(1); // REPLY
    buf.put_u32(0); // MSG_ACCEPTED
    buf.put_u32(0); // verifier: AUTH_NULL
    buf.put_u32(0);
    buf.put_u32(0); // SUCCESS
    buf.put_slice(results);
    buf.freeze()
}

/// A message with its record mark, as it travels on a stream pipe
pub fn record(message: &[u8]) -> Bytes {
    with_record_mark(message)
}

struct Incoming {
    rx: mpsc::UnboundedReceiver<io::Result<Bytes>>,
    /// stream only: bytes that arrived, but were not asked for yet
    buffered: BytesMut,
}

/// An in-memory [Pipe]. Test code feeds it whatever the server is supposed to send, and
///  inspects what was sent to the server.
///
/// On a datagram pipe, every pushed chunk is one datagram. On a stream pipe, pushed chunks are
///  concatenated into a byte stream, and closing the incoming side means EOF.
pub struct ScriptedPipe {
    kind: TransportKind,
    incoming: tokio::sync::Mutex<Incoming>,
    incoming_tx: Mutex<Option<mpsc::UnboundedSender<io::Result<Bytes>>>>,
    sent: Mutex<Vec<Vec<u8>>>,
    sent_notify: Notify,
    send_error: Mutex<Option<io::ErrorKind>>,
    send_space: AtomicBool,
    is_shut_down: AtomicBool,
}

impl ScriptedPipe {
    pub fn new(kind: TransportKind) -> Arc<ScriptedPipe> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(ScriptedPipe {
            kind,
            incoming: tokio::sync::Mutex::new(Incoming { rx, buffered: BytesMut::new() }),
            incoming_tx: Mutex::new(Some(tx)),
            sent: Default::default(),
            sent_notify: Notify::new(),
            send_error: Mutex::new(None),
            send_space: AtomicBool::new(true),
            is_shut_down: AtomicBool::new(false),
        })
    }

    pub fn datagram() -> Arc<ScriptedPipe> {
        Self::new(TransportKind::Datagram)
    }

    pub fn stream() -> Arc<ScriptedPipe> {
        Self::new(TransportKind::Stream)
    }

    /// Raw bytes from the server, i.e. a datagram or a part of the byte stream
    pub fn push(&self, data: impl Into<Bytes>) {
        if let Some(tx) = self.incoming_tx.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(data.into()));
        }
    }

    /// A reply message from the server, with a record mark on stream pipes
    pub fn push_reply(&self, message: &[u8]) {
        match self.kind {
            TransportKind::Datagram => self.push(Bytes::copy_from_slice(message)),
            TransportKind::Stream => self.push(record(message)),
        }
    }

    pub fn push_error(&self, kind: io::ErrorKind) {
        if let Some(tx) = self.incoming_tx.lock().unwrap().as_ref() {
            let _ = tx.send(Err(kind.into()));
        }
    }

    /// No more data from the server - EOF for a stream pipe, silence for a datagram pipe
    pub fn close_incoming(&self) {
        self.incoming_tx.lock().unwrap().take();
    }

    /// Subsequent sends fail with this kind of error, or succeed for `None`
    pub fn fail_sends_with(&self, kind: Option<io::ErrorKind>) {
        *self.send_error.lock().unwrap() = kind;
    }

    pub fn set_send_space(&self, has_space: bool) {
        self.send_space.store(has_space, Ordering::Relaxed);
    }

    pub fn is_shut_down(&self) -> bool {
        self.is_shut_down.load(Ordering::Relaxed)
    }

    /// Everything that was sent successfully, including record marks on stream pipes
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// The xids of all requests that were sent successfully, in order
    pub fn sent_xids(&self) -> Vec<Xid> {
        let skip = match self.kind {
            TransportKind::Datagram => 0,
            TransportKind::Stream => size_of::<u32>(),
        };
        self.sent().iter()
            .filter_map(|msg| msg.get(skip..).and_then(peek_xid))
            .collect()
    }

    /// Waits until at least `n` messages were sent in total
    pub async fn wait_for_sent(&self, n: usize) {
        loop {
            let notified = self.sent_notify.notified();
            if self.sent.lock().unwrap().len() >= n {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Pipe for ScriptedPipe {
    async fn send(&self, _dest: Option<SocketAddr>, buf: &[u8]) -> io::Result<usize> {
        if let Some(kind) = *self.send_error.lock().unwrap() {
            trace!("scripted pipe: failing send with {:?}", kind);
            return Err(kind.into());
        }
        self.sent.lock().unwrap().push(buf.to_vec());
        self.sent_notify.notify_waiters();
        Ok(buf.len())
    }

    async fn recv(&self, want_exact: bool, max_len: usize) -> io::Result<(Bytes, Option<SocketAddr>)> {
        let mut incoming = self.incoming.lock().await;

        if self.kind == TransportKind::Datagram {
            return match incoming.rx.recv().await {
                Some(Ok(mut datagram)) => {
                    datagram.truncate(max_len);
                    Ok((datagram, None))
                }
                Some(Err(e)) => Err(e),
                None => std::future::pending().await,
            };
        }

        let wanted = if want_exact { max_len } else { 1 };
        while incoming.buffered.len() < wanted {
            match incoming.rx.recv().await {
                Some(Ok(data)) => incoming.buffered.extend_from_slice(&data),
                Some(Err(e)) => return Err(e),
                None if incoming.buffered.is_empty() => return Err(io::ErrorKind::UnexpectedEof.into()),
                // a short read
                None => break,
            }
        }

        let n = incoming.buffered.len().min(max_len);
        Ok((incoming.buffered.split_to(n).freeze(), None))
    }

    fn has_send_space(&self, _len: usize) -> bool {
        self.send_space.load(Ordering::Relaxed)
    }

    async fn shutdown(&self) {
        self.is_shut_down.store(true, Ordering::Relaxed);
    }
}

/// Hands out scripted pipes in the order they were added, and refuses connections when there
///  are none left
#[derive(Default)]
pub struct ScriptedConnector {
    pipes: Mutex<VecDeque<Arc<ScriptedPipe>>>,
    num_connects: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(pipes: impl IntoIterator<Item = Arc<ScriptedPipe>>) -> Arc<ScriptedConnector> {
        Arc::new(ScriptedConnector {
            pipes: Mutex::new(pipes.into_iter().collect()),
            num_connects: AtomicUsize::new(0),
        })
    }

    pub fn add(&self, pipe: Arc<ScriptedPipe>) {
        self.pipes.lock().unwrap().push_back(pipe);
    }

    /// number of connection attempts, successful or not
    pub fn num_connects(&self) -> usize {
        self.num_connects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PipeConnector for ScriptedConnector {
    async fn connect(&self, _config: &MountConfig) -> io::Result<Arc<dyn Pipe>> {
        self.num_connects.fetch_add(1, Ordering::Relaxed);
        match self.pipes.lock().unwrap().pop_front() {
            Some(pipe) => Ok(pipe as Arc<dyn Pipe>),
            None => Err(io::ErrorKind::ConnectionRefused.into()),
        }
    }
}
