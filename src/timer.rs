//! The retransmit timer of an endpoint: a background task that periodically sweeps the registry
//!  to give up on requests and to resend those that have not been answered in time.

use std::cmp::min;
use std::sync::{Arc, Weak};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace, warn};
use crate::endpoint::{RpcEndpoint, MAX_REXMIT};
use crate::error::RpcError;
use crate::op_class::OpClass;
use crate::rpc_header::Xid;
use crate::transmitter::SendOutcome;

/// A datagram request that is due for (re)transmission
#[derive(Debug, Clone, Copy)]
struct ResendCandidate {
    xid: Xid,
    /// the request was transmitted before and ran into its timeout, as opposed to waiting for
    ///  the congestion window to open
    is_retransmission: bool,
    counted: bool,
    len: usize,
}

impl RpcEndpoint {
    /// Starts the timer task. It holds only a weak reference to the endpoint and terminates
    ///  when the endpoint is dropped or unmounted.
    pub(crate) fn spawn_timer(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let tick = self.config.tick;

        let handle = tokio::spawn(async move {
            let mut ticks = interval(tick);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticks.tick().await;

            loop {
                ticks.tick().await;
                let Some(endpoint) = Weak::upgrade(&weak) else {
                    break;
                };
                if endpoint.is_unmounted() {
                    break;
                }
                endpoint.sweep().await;
            }
            debug!("retransmit timer terminated");
        });

        if let Some(previous) = self.timer_handle.lock().unwrap().replace(handle) {
            warn!("retransmit timer was spawned twice");
            previous.abort();
        }
    }

    /// A single timer tick
    pub(crate) async fn sweep(&self) {
        self.abandon_cancelled();

        let stream = self.config.transport.is_connection_oriented();
        let dumb_timer = self.config.dumb_timer;
        let dead_threshold = self.config.dead_threshold;
        let mut expired = Vec::new();
        let mut candidates = Vec::new();

        self.registry.for_each_due(
            |req, elapsed| {
                let op_class = if dumb_timer { OpClass::Default } else { req.op_class };
                let mut congestion = self.congestion.lock().unwrap();
                if elapsed <= congestion.compute_timeout(op_class) {
                    return false;
                }
                congestion.note_expired();
                true
            },
            |req| {
                if !req.warned && req.rexmit > dead_threshold {
                    warn!("server {:?} not responding", self.config.server_addr);
                    req.warned = true;
                }

                if req.rexmit >= req.retry_ceiling {
                    expired.push(req.xid);
                    return;
                }

                if stream {
                    // resending is left to the receive path, this only drives backoff and the
                    //  retry ceiling
                    req.rexmit = min(req.rexmit + 1, MAX_REXMIT);
                    return;
                }

                candidates.push(ResendCandidate {
                    xid: req.xid,
                    is_retransmission: req.elapsed.is_some(),
                    counted: req.state.is_counted(),
                    len: req.payload.len(),
                });
            },
        );

        for xid in expired {
            debug!("request {:x} exceeded its retry ceiling", xid);
            self.stats.inc_timeouts();
            self.abandon(xid, RpcError::Timeout);
        }

        for candidate in candidates {
            self.retransmit(candidate).await;
        }
    }

    /// Wakes the waiters of requests whose calling context was interrupted. They are never
    ///  sent again.
    fn abandon_cancelled(&self) {
        let mut cancelled = Vec::new();
        self.registry.for_each_live(|req| {
            if self.is_interrupted(&req.cancel) {
                cancelled.push(req.xid);
            }
        });

        for xid in cancelled {
            debug!("request {:x} was cancelled", xid);
            self.abandon(xid, RpcError::Cancelled);
        }
    }

    fn abandon(&self, xid: Xid, error: RpcError) {
        if let Some(true) = self.registry.abandon(xid, error) {
            self.congestion.lock().unwrap().on_release();
        }
    }

    async fn retransmit(&self, candidate: ResendCandidate) {
        let Some(pipe) = self.current_pipe() else {
            return;
        };

        let allowed = self.config.dumb_timer || candidate.counted || self.congestion.lock().unwrap().window_open();
        if !allowed || !pipe.has_send_space(candidate.len) {
            trace!("request {:x} stays queued: window or send buffer full", candidate.xid);
            return;
        }

        let outcome = self.send(candidate.xid).await;

        if candidate.is_retransmission {
            self.registry.with_request(candidate.xid, |req| {
                req.rexmit = min(req.rexmit + 1, MAX_REXMIT);
                // a reply to a retransmitted request says nothing about the round trip time
                req.timing = false;
                req.elapsed = Some(0);
            });
        }

        match outcome {
            Ok(SendOutcome::Sent { was_counted: true }) => {
                self.stats.inc_retries();
                self.congestion.lock().unwrap().on_timeout();
            }
            Ok(SendOutcome::Sent { was_counted: false }) => {
                if candidate.is_retransmission {
                    self.stats.inc_retries();
                }
            }
            Ok(SendOutcome::Deferred) | Ok(SendOutcome::Skipped) => {}
            Err(e) => debug!("retransmitting request {:x} failed: {}", candidate.xid, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use bytes::Bytes;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use crate::config::MountConfig;
    use crate::pipe::{never_cancel, CancelPredicate, MockPipe, MockPipeConnector, TransportKind};
    use crate::registry::RequestState;
    use crate::rpc_header::SunRpcFraming;
    use crate::rtt::{CWND_SCALE, MAX_CWND};
    use crate::test_util::ScriptedPipe;
    use super::*;

    fn config(transport: TransportKind) -> MountConfig {
        let mut config = MountConfig::default_for(SocketAddr::from(([127, 0, 0, 1], 2049)), transport);
        config.timeo_ticks = 2;
        config.soft = true;
        config.retrans = 3;
        config.interruptible = true;
        config
    }

    fn endpoint_with(config: MountConfig, pipe: Arc<ScriptedPipe>) -> Arc<RpcEndpoint> {
        let endpoint = RpcEndpoint::new(config, Arc::new(MockPipeConnector::new()), Arc::new(SunRpcFraming)).unwrap();
        *endpoint.pipe.write().unwrap() = Some(pipe);
        endpoint
    }

    fn register(endpoint: &RpcEndpoint, payload: &'static [u8], cancel: CancelPredicate) -> (Xid, tokio::sync::oneshot::Receiver<crate::registry::Completion>) {
        endpoint.registry.register(OpClass::Default, 3, cancel, |_| Bytes::from_static(payload))
    }

    #[tokio::test]
    async fn test_oldest_first_retransmission() {
        let pipe = ScriptedPipe::datagram();
        let endpoint = endpoint_with(config(TransportKind::Datagram), pipe.clone());

        let (a, _rx_a) = register(&endpoint, b"A", never_cancel());
        let (b, _rx_b) = register(&endpoint, b"B", never_cancel());
        let (c, _rx_c) = register(&endpoint, b"C", never_cancel());
        for xid in [a, b, c] {
            endpoint.registry.with_request(xid, |r| {
                r.state = RequestState::Sent;
                // far enough past the deadline to stay due with backoff
                r.elapsed = Some(100);
            });
            endpoint.congestion.lock().unwrap().on_transmit();
        }

        endpoint.sweep().await;

        assert_eq!(pipe.sent(), vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);
        for xid in [a, b, c] {
            assert_eq!(endpoint.registry.with_request(xid, |r| (r.rexmit, r.elapsed, r.timing)), Some((1, Some(0), false)));
        }
        // halved once per retransmission
        assert_eq!(endpoint.congestion.lock().unwrap().cwnd(), MAX_CWND / 16);
        assert_eq!(endpoint.stats().retries, 3);
    }

    #[tokio::test]
    async fn test_not_due_is_left_alone() {
        let pipe = ScriptedPipe::datagram();
        let endpoint = endpoint_with(config(TransportKind::Datagram), pipe.clone());
        let (a, _rx) = register(&endpoint, b"A", never_cancel());
        endpoint.registry.with_request(a, |r| r.state = RequestState::Sent);

        // default class with base timeout 2: due after the third tick
        endpoint.sweep().await;
        endpoint.sweep().await;
        assert!(pipe.sent().is_empty());
        assert_eq!(endpoint.congestion.lock().unwrap().timeouts(), 0);

        endpoint.sweep().await;
        assert_eq!(pipe.sent().len(), 1);
        assert_eq!(endpoint.congestion.lock().unwrap().timeouts(), 1);
    }

    #[tokio::test]
    async fn test_deferred_request_is_sent_when_window_opens() {
        let pipe = ScriptedPipe::datagram();
        let endpoint = endpoint_with(config(TransportKind::Datagram), pipe.clone());
        let (a, _rx) = register(&endpoint, b"A", never_cancel());
        endpoint.registry.with_request(a, |r| r.elapsed = None);
        endpoint.congestion.lock().unwrap().set_internals(CWND_SCALE, CWND_SCALE, 0);

        endpoint.sweep().await;
        assert!(pipe.sent().is_empty());

        endpoint.congestion.lock().unwrap().set_internals(CWND_SCALE, 0, 0);
        endpoint.sweep().await;
        assert_eq!(pipe.sent(), vec![b"A".to_vec()]);
        // a first transmission, not a retry
        assert_eq!(endpoint.registry.with_request(a, |r| (r.state, r.rexmit, r.elapsed, r.timing)), Some((RequestState::Sent, 0, Some(0), false)));
        assert_eq!(endpoint.congestion.lock().unwrap().sent(), CWND_SCALE);
        assert_eq!(endpoint.congestion.lock().unwrap().cwnd(), CWND_SCALE);
    }

    #[tokio::test]
    async fn test_no_send_space() {
        let pipe = ScriptedPipe::datagram();
        pipe.set_send_space(false);
        let endpoint = endpoint_with(config(TransportKind::Datagram), pipe.clone());
        let (a, _rx) = register(&endpoint, b"A", never_cancel());
        endpoint.registry.with_request(a, |r| {
            r.state = RequestState::Sent;
            r.elapsed = Some(10);
        });

        endpoint.sweep().await;
        assert!(pipe.sent().is_empty());
        assert_eq!(endpoint.registry.with_request(a, |r| r.rexmit), Some(0));
    }

    #[tokio::test]
    async fn test_retry_ceiling() {
        let pipe = ScriptedPipe::datagram();
        let endpoint = endpoint_with(config(TransportKind::Datagram), pipe.clone());
        let (a, mut rx) = register(&endpoint, b"A", never_cancel());
        endpoint.registry.with_request(a, |r| {
            r.state = RequestState::Sent;
            r.rexmit = 3;
            r.elapsed = Some(100);
        });
        endpoint.congestion.lock().unwrap().on_transmit();

        endpoint.sweep().await;

        assert!(pipe.sent().is_empty());
        assert_eq!(rx.try_recv(), Ok(Err(RpcError::Timeout)));
        assert_eq!(endpoint.registry.with_request(a, |r| r.state), Some(RequestState::Abandoned));
        assert_eq!(endpoint.congestion.lock().unwrap().sent(), 0);
        assert_eq!(endpoint.stats().timeouts, 1);
    }

    #[rstest]
    #[case::interruptible(true, true)]
    #[case::not_interruptible(false, false)]
    fn test_cancelled_before_deadline(#[case] interruptible: bool, #[case] expect_cancelled: bool) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let pipe = ScriptedPipe::datagram();
            let mut config = config(TransportKind::Datagram);
            config.interruptible = interruptible;
            let endpoint = endpoint_with(config, pipe.clone());

            let flag = Arc::new(AtomicBool::new(false));
            let cancel: CancelPredicate = {
                let flag = flag.clone();
                Arc::new(move || flag.load(Ordering::Relaxed))
            };
            let (a, mut rx) = register(&endpoint, b"A", cancel);
            endpoint.registry.with_request(a, |r| {
                r.state = RequestState::Sent;
                // would be due in this very sweep
                r.elapsed = Some(100);
            });

            flag.store(true, Ordering::Relaxed);
            endpoint.sweep().await;

            if expect_cancelled {
                assert_eq!(rx.try_recv(), Ok(Err(RpcError::Cancelled)));
                assert!(pipe.sent().is_empty());
            }
            else {
                assert!(rx.try_recv().is_err());
                assert_eq!(pipe.sent().len(), 1);
            }
        });
    }

    #[tokio::test]
    async fn test_stream_only_counts() {
        let pipe = ScriptedPipe::stream();
        let endpoint = endpoint_with(config(TransportKind::Stream), pipe.clone());
        let (a, _rx) = register(&endpoint, b"A", never_cancel());
        endpoint.registry.with_request(a, |r| {
            r.state = RequestState::Sent;
            r.elapsed = Some(100);
        });

        endpoint.sweep().await;
        endpoint.sweep().await;

        assert!(pipe.sent().is_empty());
        assert_eq!(endpoint.registry.with_request(a, |r| r.rexmit), Some(2));
    }

    #[tokio::test]
    async fn test_not_responding_warning_once() {
        let pipe = ScriptedPipe::datagram();
        let mut config = config(TransportKind::Datagram);
        config.soft = false;
        config.dead_threshold = 1;
        let endpoint = endpoint_with(config, pipe.clone());
        let (a, _rx) = endpoint.registry.register(OpClass::Default, MAX_REXMIT + 1, never_cancel(), |_| Bytes::from_static(b"A"));
        endpoint.registry.with_request(a, |r| {
            r.state = RequestState::Sent;
            r.rexmit = 2;
            r.elapsed = Some(1000);
        });

        endpoint.sweep().await;
        assert_eq!(endpoint.registry.with_request(a, |r| (r.warned, r.rexmit)), Some((true, 3)));
    }

    #[tokio::test]
    async fn test_mock_pipe_error_bumps_rexmit() {
        let mut pipe = MockPipe::new();
        pipe.expect_has_send_space().return_const(true);
        pipe.expect_send()
            .once()
            .returning(|_, _| Err(std::io::ErrorKind::WouldBlock.into()));

        let endpoint = RpcEndpoint::new(config(TransportKind::Datagram), Arc::new(MockPipeConnector::new()), Arc::new(SunRpcFraming)).unwrap();
        *endpoint.pipe.write().unwrap() = Some(Arc::new(pipe));
        let (a, _rx) = register(&endpoint, b"A", never_cancel());
        endpoint.registry.with_request(a, |r| r.elapsed = Some(100));

        endpoint.sweep().await;
        assert_eq!(endpoint.registry.with_request(a, |r| (r.state, r.rexmit, r.elapsed)), Some((RequestState::MustResend { counted: false }, 1, Some(0))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_task_stops_on_unmount() {
        let pipe = ScriptedPipe::datagram();
        let endpoint = endpoint_with(config(TransportKind::Datagram), pipe.clone());
        endpoint.spawn_timer();
        assert!(endpoint.timer_handle.lock().unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(350)).await;
        endpoint.unmount().await;
        assert!(endpoint.timer_handle.lock().unwrap().is_none());
    }
}
