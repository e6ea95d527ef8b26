use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use bytes::Bytes;
use tokio::sync::{oneshot, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, span, Instrument, Level};
use uuid::Uuid;
use crate::config::MountConfig;
use crate::error::{RpcError, TransportErrorKind};
use crate::op_class::OpClass;
use crate::pipe::{CancelPredicate, Pipe, PipeConnector};
use crate::registry::{Completion, RequestRegistry};
use crate::rpc_header::{CallHeader, RpcFraming, Xid};
use crate::rtt::CongestionState;
use crate::stats::{RpcStats, RpcStatsSnapshot};

/// retransmit counter cap, which is also the retry ceiling of hard mounts (plus one, so that it
///  is never reached)
pub const MAX_REXMIT: u32 = 100;

/// RpcEndpoint is the place where all parts of the transport come together: it owns the pipe to
///  one server and the table of requests in flight on it, and it is shared by all callers
///  issuing RPCs on a mount and by the mount's retransmit timer.
///
/// The components are implemented in separate modules as `impl RpcEndpoint` blocks:
///  * [connection](crate::connection): establishing and replacing the pipe
///  * [transmitter](crate::transmitter): framing and sending requests
///  * [receiver](crate::receiver): reading replies and matching them to requests
///  * [timer](crate::timer): periodic retransmission and timeouts
pub struct RpcEndpoint {
    pub(crate) config: Arc<MountConfig>,
    pub(crate) connector: Arc<dyn PipeConnector>,
    pub(crate) framing: Arc<dyn RpcFraming>,

    /// `None` while disconnected
    pub(crate) pipe: RwLock<Option<Arc<dyn Pipe>>>,
    /// serializes writes to stream pipes, and reconnects
    pub(crate) send_lock: tokio::sync::Mutex<()>,
    /// there is never more than one caller reading from the pipe
    pub(crate) recv_lock: tokio::sync::Mutex<()>,
    /// length of a stream record whose record mark was consumed, but not the body
    pub(crate) pending_record: Mutex<Option<u32>>,

    pub(crate) congestion: Mutex<CongestionState>,
    pub(crate) registry: RequestRegistry,
    pub(crate) stats: RpcStats,

    pub(crate) unmounted: AtomicBool,
    pub(crate) timer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RpcEndpoint {
    /// Creates an endpoint without connecting it, see [RpcEndpoint::mount]
    pub fn new(config: MountConfig, connector: Arc<dyn PipeConnector>, framing: Arc<dyn RpcFraming>) -> anyhow::Result<Arc<RpcEndpoint>> {
        config.validate()?;

        let congestion = CongestionState::new(config.timeo_ticks);
        Ok(Arc::new(RpcEndpoint {
            config: Arc::new(config),
            connector,
            framing,
            pipe: RwLock::new(None),
            send_lock: Default::default(),
            recv_lock: Default::default(),
            pending_record: Mutex::new(None),
            congestion: Mutex::new(congestion),
            registry: RequestRegistry::new(),
            stats: Default::default(),
            unmounted: AtomicBool::new(false),
            timer_handle: Mutex::new(None),
        }))
    }

    /// Creates an endpoint, connects it to the server and starts its retransmit timer
    pub async fn mount(config: MountConfig, connector: Arc<dyn PipeConnector>, framing: Arc<dyn RpcFraming>, cancel: &CancelPredicate) -> anyhow::Result<Arc<RpcEndpoint>> {
        let endpoint = Self::new(config, connector, framing)?;
        endpoint.connect(cancel).await?;
        endpoint.spawn_timer();
        info!("mounted {:?} via {:?}", endpoint.config.server_addr, endpoint.config.transport);
        Ok(endpoint)
    }

    /// Tears the mount down: all requests in flight fail with [RpcError::Cancelled], and new
    ///  ones are refused
    pub async fn unmount(&self) {
        info!("unmounting {:?}", self.config.server_addr);
        self.unmounted.store(true, Ordering::Release);

        if let Some(handle) = self.timer_handle.lock().unwrap().take() {
            handle.abort();
        }

        let num_counted = self.registry.abandon_all(RpcError::Cancelled);
        {
            let mut congestion = self.congestion.lock().unwrap();
            for _ in 0..num_counted {
                congestion.on_release();
            }
        }

        self.disconnect().await;
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn stats(&self) -> RpcStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn num_outstanding(&self) -> usize {
        self.registry.len()
    }

    pub(crate) fn is_unmounted(&self) -> bool {
        self.unmounted.load(Ordering::Acquire)
    }

    /// Should a blocked operation on behalf of this calling context give up?
    pub(crate) fn is_interrupted(&self, cancel: &CancelPredicate) -> bool {
        self.is_unmounted() || (self.config.interruptible && cancel())
    }

    pub(crate) fn current_pipe(&self) -> Option<Arc<dyn Pipe>> {
        self.pipe.read().unwrap().clone()
    }

    /// destination for datagrams on an unconnected socket
    pub(crate) fn send_dest(&self) -> Option<SocketAddr> {
        if self.config.connected_datagram {
            None
        }
        else {
            Some(self.config.server_addr)
        }
    }

    /// Waits for `lock`, re-checking the cancellation predicate every `cancel_poll`
    pub(crate) async fn lock_interruptible<'a>(&self, lock: &'a tokio::sync::Mutex<()>, cancel: &CancelPredicate) -> Result<MutexGuard<'a, ()>, RpcError> {
        let acquire = lock.lock();
        tokio::pin!(acquire);

        loop {
            tokio::select! {
                guard = &mut acquire => return Ok(guard),
                _ = tokio::time::sleep(self.config.cancel_poll) => {
                    if self.is_interrupted(cancel) {
                        return Err(RpcError::Cancelled);
                    }
                }
            }
        }
    }

    /// Issues a single RPC and waits for its outcome. This registers the request, sends it (or
    ///  leaves it for the timer if the congestion window is full), waits for the matching reply
    ///  and finally removes the request again.
    ///
    /// The returned bytes are the procedure specific results, following the reply header.
    pub async fn issue(&self, proc_num: u32, op_class: OpClass, body: &[u8], cancel: CancelPredicate) -> Result<Bytes, RpcError> {
        if self.is_unmounted() {
            return Err(RpcError::Cancelled);
        }

        let retry_ceiling = if self.config.soft {
            self.config.retrans
        }
        else {
            MAX_REXMIT + 1
        };

        let (xid, mut completion) = self.registry.register(op_class, retry_ceiling, cancel.clone(), |xid| {
            self.framing.build_call(&CallHeader {
                xid,
                program: self.config.program,
                version: self.config.version,
                procedure: proc_num,
                credential: &self.config.credential,
            }, body)
        });
        // removes the request even if the caller stops polling this future
        let _in_flight = InFlight { endpoint: self, xid };
        self.stats.inc_requests();

        let correlation_id = Uuid::new_v4();
        let result = self.run_request(xid, &mut completion, &cancel)
            .instrument(span!(Level::TRACE, "rpc", ?correlation_id, xid, proc_num))
            .await;

        if let Err(e) = &result {
            debug!("RPC {:x} (proc {}) failed: {}", xid, proc_num, e);
        }
        result
    }

    async fn run_request(&self, xid: Xid, completion: &mut oneshot::Receiver<Completion>, cancel: &CancelPredicate) -> Result<Bytes, RpcError> {
        match self.submit(xid, cancel).await {
            Ok(_) => {}
            // the receive path reconnects and resends
            Err(RpcError::Transport(TransportErrorKind::BrokenPipe)) if self.config.transport.is_connection_oriented() => {}
            Err(e) => return Err(e),
        }
        self.await_reply(xid, completion, cancel).await
    }
}

/// Owns a registered request on behalf of [RpcEndpoint::issue], and takes it out of the registry
///  (releasing its congestion window slot) when dropped
struct InFlight<'a> {
    endpoint: &'a RpcEndpoint,
    xid: Xid,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(req) = self.endpoint.registry.remove(self.xid) {
            if req.state.is_counted() {
                self.endpoint.congestion.lock().unwrap().on_release();
            }
        }
    }
}

/// NFS version 3 convenience on top of [RpcEndpoint::issue]
impl RpcEndpoint {
    pub async fn issue_nfsv3(&self, proc_num: u32, body: &[u8], cancel: CancelPredicate) -> Result<Bytes, RpcError> {
        self.issue(proc_num, OpClass::for_nfsv3_proc(proc_num), body, cancel).await
    }
}
