//! Handing requests to the pipe.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, trace};
use crate::endpoint::RpcEndpoint;
use crate::error::{RpcError, TransportErrorKind};
use crate::pipe::CancelPredicate;
use crate::registry::RequestState;
use crate::rpc_header::Xid;

/// high bit of a record mark, flagging the last fragment of a record
pub const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Prepends a record mark for the message to the message
pub fn with_record_mark(message: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(size_of::<u32>() + message.len());
    buf.put_u32(LAST_FRAGMENT | message.len() as u32);
    buf.put_slice(message);
    buf.freeze()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// The pipe accepted the request. `was_counted` is set if the request already held a slot
    ///  in the congestion window before this transmission.
    Sent { was_counted: bool },
    /// The request was flagged for retransmission instead
    Deferred,
    /// The request was answered in the meantime, there was nothing to send
    Skipped,
}

impl RpcEndpoint {
    /// The initial transmission of a request. On a datagram pipe with a full congestion window,
    ///  the request is left for the timer to send once the window opens.
    pub(crate) async fn submit(&self, xid: Xid, cancel: &CancelPredicate) -> Result<SendOutcome, RpcError> {
        if self.config.transport.is_connection_oriented() {
            let _send_guard = self.lock_interruptible(&self.send_lock, cancel).await?;
            return self.send(xid).await;
        }

        let window_open = self.config.dumb_timer || self.congestion.lock().unwrap().window_open();
        if !window_open {
            trace!("congestion window is full - deferring request {:x}", xid);
            self.registry.with_request(xid, |req| req.elapsed = None);
            return Ok(SendOutcome::Deferred);
        }
        self.send(xid).await
    }

    /// Frames a request and hands it to the pipe. For stream pipes, the caller must hold the
    ///  send lock.
    ///
    /// Send failures turn into a 'must resend' flag on the request rather than an error, except
    ///  for the kinds of error that the caller needs to see.
    pub(crate) async fn send(&self, xid: Xid) -> Result<SendOutcome, RpcError> {
        let payload = match self.registry.with_request(xid, |req| (req.state, req.payload.clone())) {
            None => return Err(RpcError::Fatal(format!("request {:x} is not registered", xid))),
            Some((RequestState::Abandoned, _)) => return Err(RpcError::Cancelled),
            Some((RequestState::Acked, _)) => return Ok(SendOutcome::Skipped),
            Some((_, payload)) => payload,
        };

        let pipe = match self.current_pipe() {
            Some(pipe) => pipe,
            None => {
                debug!("no pipe - deferring request {:x}", xid);
                self.registry.with_request(xid, |req| req.mark_must_resend());
                return Ok(SendOutcome::Deferred);
            }
        };

        let stream = self.config.transport.is_connection_oriented();
        let framed = if stream {
            with_record_mark(&payload)
        }
        else {
            payload
        };

        match pipe.send(self.send_dest(), &framed).await {
            Ok(n) if n == framed.len() => {
                let was_counted = self.registry.with_request(xid, |req| {
                    if req.state.is_terminal() {
                        return None;
                    }
                    let was_counted = req.state.is_counted();
                    req.state = RequestState::Sent;
                    if req.elapsed.is_none() {
                        req.elapsed = Some(0);
                    }
                    Some(was_counted)
                }).flatten();

                match was_counted {
                    None => Ok(SendOutcome::Skipped),
                    Some(was_counted) => {
                        if !was_counted {
                            self.congestion.lock().unwrap().on_transmit();
                        }
                        trace!("sent request {:x} ({} bytes)", xid, framed.len());
                        Ok(SendOutcome::Sent { was_counted })
                    }
                }
            }
            Ok(n) => {
                debug!("partial send of request {:x}: {} of {} bytes - flagging for retransmission", xid, n, framed.len());
                self.registry.with_request(xid, |req| req.mark_must_resend());
                Ok(SendOutcome::Deferred)
            }
            Err(e) => {
                let kind = TransportErrorKind::from(&e);
                let abandoned = self.registry.with_request(xid, |req| {
                    req.mark_must_resend();
                    req.state == RequestState::Abandoned
                });

                if !stream && kind.is_transient_for_datagram() {
                    debug!("no room to send request {:x} ({}) - flagging for retransmission", xid, e);
                    return Ok(SendOutcome::Deferred);
                }
                info!("send error for request {:x}: {}", xid, e);

                if abandoned == Some(true) {
                    Err(RpcError::Cancelled)
                }
                else if kind.propagates_from_send() {
                    Err(RpcError::Transport(kind))
                }
                else {
                    Ok(SendOutcome::Deferred)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use bytes::Bytes;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use crate::config::MountConfig;
    use crate::op_class::OpClass;
    use crate::pipe::{never_cancel, MockPipe, MockPipeConnector, TransportKind};
    use crate::rpc_header::SunRpcFraming;
    use crate::rtt::CWND_SCALE;
    use super::*;

    fn endpoint(transport: TransportKind, pipe: Option<MockPipe>) -> Arc<RpcEndpoint> {
        let config = MountConfig::default_for(SocketAddr::from(([127, 0, 0, 1], 2049)), transport);
        let endpoint = RpcEndpoint::new(config, Arc::new(MockPipeConnector::new()), Arc::new(SunRpcFraming)).unwrap();
        if let Some(pipe) = pipe {
            *endpoint.pipe.write().unwrap() = Some(Arc::new(pipe));
        }
        endpoint
    }

    fn register(endpoint: &RpcEndpoint) -> Xid {
        endpoint.registry.register(OpClass::Getattr, 5, never_cancel(), |_| Bytes::from_static(&[1, 2, 3])).0
    }

    #[rstest]
    #[case::empty(vec![], vec![0x80,0,0,0])]
    #[case::short(vec![9, 8, 7], vec![0x80,0,0,3, 9,8,7])]
    fn test_with_record_mark(#[case] message: Vec<u8>, #[case] expected: Vec<u8>) {
        assert_eq!(with_record_mark(&message).as_ref(), expected.as_slice());
    }

    #[rstest]
    #[case::datagram(TransportKind::Datagram, vec![1, 2, 3])]
    #[case::stream(TransportKind::Stream, vec![0x80,0,0,3, 1,2,3])]
    fn test_send_success(#[case] transport: TransportKind, #[case] expected_buf: Vec<u8>) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut pipe = MockPipe::new();
            pipe.expect_send()
                .times(2)
                .withf(move |dest, buf| dest.is_none() && buf == expected_buf.as_slice())
                .returning(|_, buf| Ok(buf.len()));

            let endpoint = endpoint(transport, Some(pipe));
            let xid = register(&endpoint);

            assert_eq!(endpoint.send(xid).await, Ok(SendOutcome::Sent { was_counted: false }));
            assert_eq!(endpoint.registry.with_request(xid, |r| r.state), Some(RequestState::Sent));
            assert_eq!(endpoint.congestion.lock().unwrap().sent(), CWND_SCALE);

            // the window slot is only taken once
            assert_eq!(endpoint.send(xid).await, Ok(SendOutcome::Sent { was_counted: true }));
            assert_eq!(endpoint.congestion.lock().unwrap().sent(), CWND_SCALE);
        });
    }

    #[tokio::test]
    async fn test_send_unconnected_datagram_has_destination() {
        let server_addr = SocketAddr::from(([127, 0, 0, 1], 2049));
        let mut pipe = MockPipe::new();
        pipe.expect_send()
            .once()
            .withf(move |dest, _| dest == &Some(server_addr))
            .returning(|_, buf| Ok(buf.len()));

        let mut config = MountConfig::default_for(server_addr, TransportKind::Datagram);
        config.connected_datagram = false;
        let endpoint = RpcEndpoint::new(config, Arc::new(MockPipeConnector::new()), Arc::new(SunRpcFraming)).unwrap();
        *endpoint.pipe.write().unwrap() = Some(Arc::new(pipe));

        let xid = register(&endpoint);
        assert_eq!(endpoint.send(xid).await, Ok(SendOutcome::Sent { was_counted: false }));
    }

    #[rstest]
    #[case::datagram_no_buffer_space(TransportKind::Datagram, io::Error::from_raw_os_error(libc::ENOBUFS), Ok(SendOutcome::Deferred))]
    #[case::datagram_would_block(TransportKind::Datagram, io::ErrorKind::WouldBlock.into(), Ok(SendOutcome::Deferred))]
    #[case::datagram_refused(TransportKind::Datagram, io::ErrorKind::ConnectionRefused.into(), Ok(SendOutcome::Deferred))]
    #[case::datagram_interrupted(TransportKind::Datagram, io::ErrorKind::Interrupted.into(), Err(RpcError::Transport(TransportErrorKind::Interrupted)))]
    #[case::stream_broken_pipe(TransportKind::Stream, io::ErrorKind::BrokenPipe.into(), Err(RpcError::Transport(TransportErrorKind::BrokenPipe)))]
    #[case::stream_would_block(TransportKind::Stream, io::ErrorKind::WouldBlock.into(), Err(RpcError::Transport(TransportErrorKind::WouldBlock)))]
    #[case::stream_reset(TransportKind::Stream, io::ErrorKind::ConnectionReset.into(), Ok(SendOutcome::Deferred))]
    fn test_send_error(#[case] transport: TransportKind, #[case] error: io::Error, #[case] expected: Result<SendOutcome, RpcError>) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let kind = error.kind();
            let raw = error.raw_os_error();
            let mut pipe = MockPipe::new();
            pipe.expect_send()
                .once()
                .returning(move |_, _| Err(match raw {
                    Some(raw) => io::Error::from_raw_os_error(raw),
                    None => kind.into(),
                }));

            let endpoint = endpoint(transport, Some(pipe));
            let xid = register(&endpoint);

            assert_eq!(endpoint.send(xid).await, expected);
            assert_eq!(endpoint.registry.with_request(xid, |r| r.state), Some(RequestState::MustResend { counted: false }));
            assert_eq!(endpoint.congestion.lock().unwrap().sent(), 0);
        });
    }

    #[tokio::test]
    async fn test_send_error_for_abandoned_request() {
        let endpoint = endpoint(TransportKind::Datagram, Some(MockPipe::new()));
        let xid = register(&endpoint);
        endpoint.registry.abandon(xid, RpcError::Timeout);

        assert_eq!(endpoint.send(xid).await, Err(RpcError::Cancelled));
    }

    #[tokio::test]
    async fn test_send_partial() {
        let mut pipe = MockPipe::new();
        pipe.expect_send()
            .once()
            .returning(|_, _| Ok(1));

        let endpoint = endpoint(TransportKind::Datagram, Some(pipe));
        let xid = register(&endpoint);
        endpoint.registry.with_request(xid, |r| r.state = RequestState::Sent);

        assert_eq!(endpoint.send(xid).await, Ok(SendOutcome::Deferred));
        assert_eq!(endpoint.registry.with_request(xid, |r| r.state), Some(RequestState::MustResend { counted: true }));
    }

    #[tokio::test]
    async fn test_send_without_pipe() {
        let endpoint = endpoint(TransportKind::Stream, None);
        let xid = register(&endpoint);

        assert_eq!(endpoint.send(xid).await, Ok(SendOutcome::Deferred));
        assert_eq!(endpoint.registry.with_request(xid, |r| r.state), Some(RequestState::MustResend { counted: false }));
    }

    #[tokio::test]
    async fn test_send_acked_request_is_skipped() {
        let endpoint = endpoint(TransportKind::Datagram, Some(MockPipe::new()));
        let xid = register(&endpoint);
        endpoint.registry.complete(xid, Ok(Bytes::new()));

        assert_eq!(endpoint.send(xid).await, Ok(SendOutcome::Skipped));
    }

    #[rstest]
    #[case::window_open(false, CWND_SCALE, false, 1, Ok(SendOutcome::Sent { was_counted: false }))]
    #[case::window_full(false, 2 * CWND_SCALE, false, 0, Ok(SendOutcome::Deferred))]
    #[case::dumb_timer(true, 2 * CWND_SCALE, false, 1, Ok(SendOutcome::Sent { was_counted: false }))]
    #[case::stream_ignores_window(false, 2 * CWND_SCALE, true, 1, Ok(SendOutcome::Sent { was_counted: false }))]
    fn test_submit_gating(#[case] dumb_timer: bool, #[case] sent: u32, #[case] stream: bool, #[case] num_sends: usize, #[case] expected: Result<SendOutcome, RpcError>) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut pipe = MockPipe::new();
            pipe.expect_send()
                .times(num_sends)
                .returning(|_, buf| Ok(buf.len()));

            let transport = if stream { TransportKind::Stream } else { TransportKind::Datagram };
            let mut config = MountConfig::default_for(SocketAddr::from(([127, 0, 0, 1], 2049)), transport);
            config.dumb_timer = dumb_timer;
            let endpoint = RpcEndpoint::new(config, Arc::new(MockPipeConnector::new()), Arc::new(SunRpcFraming)).unwrap();
            *endpoint.pipe.write().unwrap() = Some(Arc::new(pipe));
            endpoint.congestion.lock().unwrap().set_internals(2 * CWND_SCALE, sent, 0);

            let xid = register(&endpoint);
            assert_eq!(endpoint.submit(xid, &never_cancel()).await, expected);

            let expected_elapsed = if num_sends == 0 { None } else { Some(0) };
            assert_eq!(endpoint.registry.with_request(xid, |r| r.elapsed), Some(expected_elapsed));
        });
    }
}
