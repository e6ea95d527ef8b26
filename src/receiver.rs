//! Reading replies from the pipe and matching them to the requests waiting for them.
//!
//! There is no dedicated reader task. Whichever caller holds the receive lock reads from the
//!  pipe on behalf of everybody, delivering replies through the registry: all other callers
//!  wait for either their own reply or their turn at the lock, whichever comes first.

use std::net::SocketAddr;
use std::sync::Arc;
use bytes::{Buf, Bytes};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;
use crate::endpoint::RpcEndpoint;
use crate::error::{ProtocolError, RpcError, TransportErrorKind};
use crate::pipe::{CancelPredicate, Pipe};
use crate::registry::Completion;
use crate::rpc_header::Xid;
use crate::transmitter::{SendOutcome, LAST_FRAGMENT};

const RECORD_MARK_LEN: usize = size_of::<u32>();

fn completion_result(result: Result<Completion, oneshot::error::RecvError>) -> Result<Bytes, RpcError> {
    match result {
        Ok(completion) => completion,
        Err(_) => Err(RpcError::Fatal("request was dropped without completion".to_string())),
    }
}

impl RpcEndpoint {
    /// Reads the next complete RPC message from the pipe, with the address it came from.
    ///
    /// On a stream pipe, this reads a record mark and then the record it announces. This is
    ///  cancel safe: if the body read is dropped, the announced length is kept for the next call.
    pub(crate) async fn receive_one(&self, pipe: &Arc<dyn Pipe>) -> Result<(Bytes, Option<SocketAddr>), RpcError> {
        if !self.config.transport.is_connection_oriented() {
            let (datagram, from) = pipe.recv(false, self.config.max_datagram_len()).await?;
            return Ok((datagram, from));
        }

        let pending = *self.pending_record.lock().unwrap();
        let len = match pending {
            Some(len) => len,
            None => {
                let (mut mark, _) = pipe.recv(true, RECORD_MARK_LEN).await?;
                if mark.len() < RECORD_MARK_LEN {
                    info!("short receive ({} of {} bytes) from {:?}", mark.len(), RECORD_MARK_LEN, self.config.server_addr);
                    return Err(RpcError::Transport(TransportErrorKind::BrokenPipe));
                }
                let len = mark.get_u32() & !LAST_FRAGMENT;
                if len > self.config.max_record_len {
                    error!("{:?}: impossible packet length ({}) - reconnecting", self.config.server_addr, len);
                    return Err(ProtocolError::RecordTooLong(len).into());
                }
                *self.pending_record.lock().unwrap() = Some(len);
                len
            }
        };

        if len == 0 {
            *self.pending_record.lock().unwrap() = None;
            return Ok((Bytes::new(), Some(self.config.server_addr)));
        }

        let (body, from) = pipe.recv(true, len as usize).await?;
        *self.pending_record.lock().unwrap() = None;
        if body.len() < len as usize {
            info!("short receive ({} of {} bytes) from {:?}", body.len(), len, self.config.server_addr);
            return Err(RpcError::Transport(TransportErrorKind::BrokenPipe));
        }
        Ok((body, from))
    }

    /// Resends every request that is flagged for retransmission, oldest first, reconnecting
    ///  when there is no pipe or when sending fails. Returns the pipe to read from.
    async fn resend_before_read(&self, cancel: &CancelPredicate) -> Result<Arc<dyn Pipe>, RpcError> {
        let send_guard = self.lock_interruptible(&self.send_lock, cancel).await?;

        loop {
            let pipe = match self.current_pipe() {
                Some(pipe) => pipe,
                None => {
                    self.reconnect(&send_guard, cancel).await?;
                    continue;
                }
            };

            let Some((xid, _)) = self.registry.next_must_resend() else {
                return Ok(pipe);
            };

            trace!("resending request {:x} before reading", xid);
            match self.send(xid).await {
                Ok(SendOutcome::Sent { .. }) => self.stats.inc_retries(),
                // abandoned in the meantime, its waiter was woken already
                Ok(SendOutcome::Skipped) | Err(RpcError::Cancelled) => {}
                Err(e @ RpcError::Transport(TransportErrorKind::Interrupted)) => return Err(e),
                Ok(SendOutcome::Deferred) | Err(RpcError::Transport(_)) => {
                    self.reconnect(&send_guard, cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads one message from the pipe, reconnecting and retrying on stream pipes if necessary.
    ///  The caller must hold the receive lock.
    async fn receive(&self, cancel: &CancelPredicate, single_shot: bool) -> Result<(Bytes, Option<SocketAddr>), RpcError> {
        loop {
            let pipe = if self.config.transport.is_connection_oriented() {
                self.resend_before_read(cancel).await?
            }
            else {
                match self.current_pipe() {
                    Some(pipe) => pipe,
                    None => return Err(RpcError::Transport(TransportErrorKind::NotConnected)),
                }
            };

            let e = match self.receive_one(&pipe).await {
                Ok(received) => return Ok(received),
                Err(e) => e,
            };

            if self.config.transport.is_connection_oriented() {
                if e == RpcError::Transport(TransportErrorKind::Interrupted) {
                    return Err(e);
                }
                if e != RpcError::Transport(TransportErrorKind::BrokenPipe) {
                    info!("receive error from {:?}: {} - reconnecting", self.config.server_addr, e);
                }
                let send_guard = self.lock_interruptible(&self.send_lock, cancel).await?;
                self.reconnect(&send_guard, cancel).await?;
            }
            else {
                match e {
                    RpcError::Transport(kind) if kind.is_benign_for_datagram() && !single_shot => {
                        debug!("ignoring receive error from {:?}: {:?}", self.config.server_addr, kind);
                    }
                    e => return Err(e),
                }
            }
        }
    }

    /// Matches a received message to its request and delivers it
    pub(crate) fn dispatch(&self, message: Bytes, from: Option<SocketAddr>) {
        let correlation_id = Uuid::new_v4();
        let _span = span!(Level::TRACE, "dispatch", ?correlation_id).entered();

        let header = match self.framing.parse_reply_header(&message) {
            Ok(header) => header,
            Err(e) => {
                debug!("discarding message from {:?}: {}", from, e);
                self.stats.inc_invalid();
                return;
            }
        };

        let xid = header.xid;
        let result = header.into_result(message).map_err(RpcError::from);
        match self.registry.complete(xid, result) {
            None => {
                debug!("discarding reply {:x} from {:?}: no such request", xid, from);
                self.stats.inc_unexpected();
            }
            Some(completed) => {
                trace!("matched reply {:x}", xid);
                self.congestion.lock().unwrap().on_ack(completed.op_class, completed.rtt, completed.was_counted);
                if completed.warned {
                    info!("server {:?} is alive again", self.config.server_addr);
                }
            }
        }
    }

    /// Waits for the reply to a request, reading from the pipe on behalf of all waiting callers
    ///  whenever the receive lock is available.
    pub(crate) async fn await_reply(&self, xid: Xid, completion: &mut oneshot::Receiver<Completion>, cancel: &CancelPredicate) -> Result<Bytes, RpcError> {
        loop {
            let recv_guard = tokio::select! {
                biased;
                result = &mut *completion => return completion_result(result),
                guard = self.recv_lock.lock() => guard,
            };

            // the previous holder of the lock may have delivered our reply
            match completion.try_recv() {
                Ok(result) => return result,
                Err(TryRecvError::Closed) => return Err(RpcError::Fatal("request was dropped without completion".to_string())),
                Err(TryRecvError::Empty) => {}
            }

            let received = tokio::select! {
                biased;
                result = &mut *completion => return completion_result(result),
                received = self.receive(cancel, false) => received?,
            };
            drop(recv_guard);

            let (message, from) = received;
            self.dispatch(message, from);
            trace!("waiting for reply {:x}", xid);
        }
    }

    /// Handles at most one message from the pipe and returns the reply to the request if that
    ///  was it. Receive errors are returned to the caller directly, without retrying.
    pub async fn await_reply_once(&self, xid: Xid, completion: &mut oneshot::Receiver<Completion>, cancel: &CancelPredicate) -> Result<Option<Bytes>, RpcError> {
        let _recv_guard = self.lock_interruptible(&self.recv_lock, cancel).await?;

        if let Ok(result) = completion.try_recv() {
            return result.map(Some);
        }

        let (message, from) = self.receive(cancel, true)
            .instrument(span!(Level::TRACE, "single shot", xid))
            .await?;
        self.dispatch(message, from);

        match completion.try_recv() {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }
}
