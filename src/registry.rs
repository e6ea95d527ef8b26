//! The table of requests that are currently in flight on an endpoint.
//!
//! Every request has a one-shot completion channel that is fired exactly once - with the reply
//!  or with the reason the request was given up - while the entry itself stays in the registry
//!  until the issuing caller removes it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::trace;
use crate::error::RpcError;
use crate::op_class::OpClass;
use crate::pipe::CancelPredicate;
use crate::rpc_header::Xid;

pub type Completion = Result<Bytes, RpcError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    /// registered, but not handed to the pipe yet
    Fresh,
    /// on the wire and counted against the congestion window
    Sent,
    /// the last send attempt failed or was lost with a pipe that was replaced since. `counted`
    ///  is set if the request still holds a slot in the congestion window.
    MustResend { counted: bool },
    Acked,
    Abandoned,
}

impl RequestState {
    pub fn is_counted(self) -> bool {
        matches!(self, RequestState::Sent | RequestState::MustResend { counted: true })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Acked | RequestState::Abandoned)
    }

    pub fn must_resend(self) -> bool {
        matches!(self, RequestState::MustResend { .. })
    }
}

pub struct OutstandingRequest {
    pub xid: Xid,
    pub op_class: OpClass,
    /// the complete RPC call message, kept for retransmission
    pub payload: Bytes,
    pub state: RequestState,
    /// ticks since the last transmission, `None` while the request waits for the congestion
    ///  window to open
    pub elapsed: Option<u32>,
    pub rexmit: u32,
    pub retry_ceiling: u32,
    /// a round trip sample is taken only if the request was never retransmitted
    pub timing: bool,
    /// a 'not responding' warning was logged on behalf of this request
    pub warned: bool,
    pub cancel: CancelPredicate,
    completion: Option<oneshot::Sender<Completion>>,
}

impl OutstandingRequest {
    fn fire(&mut self, result: Completion) {
        if let Some(completion) = self.completion.take() {
            // the waiter may be gone already, which is fine
            let _ = completion.send(result);
        }
    }

    /// Flags the request for retransmission, keeping its congestion window slot
    pub fn mark_must_resend(&mut self) {
        if !self.state.is_terminal() {
            self.state = RequestState::MustResend { counted: self.state.is_counted() };
        }
    }
}

/// What the receiver needs to know about a request that was just acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completed {
    pub op_class: OpClass,
    pub rtt: Option<u32>,
    pub was_counted: bool,
    pub warned: bool,
}

#[derive(Default)]
struct Entries {
    by_xid: FxHashMap<Xid, OutstandingRequest>,
    /// registration order, for oldest-first traversal
    order: BTreeMap<u64, Xid>,
    seq_of: FxHashMap<Xid, u64>,
    next_seq: u64,
}

pub struct RequestRegistry {
    entries: Mutex<Entries>,
    next_xid: AtomicU32,
}

impl Default for RequestRegistry {
    fn default() -> Self {
        RequestRegistry::new()
    }
}

impl RequestRegistry {
    pub fn new() -> RequestRegistry {
        RequestRegistry {
            entries: Default::default(),
            next_xid: AtomicU32::new(rand::random()),
        }
    }

    /// Adds a request, assigning it an xid that is unique among the requests in the registry.
    ///  `build` creates the call message for the assigned xid.
    pub fn register(&self, op_class: OpClass, retry_ceiling: u32, cancel: CancelPredicate, build: impl FnOnce(Xid) -> Bytes) -> (Xid, oneshot::Receiver<Completion>) {
        let mut entries = self.entries.lock().unwrap();

        let xid = loop {
            let candidate = self.next_xid.fetch_add(1, Ordering::Relaxed);
            if !entries.by_xid.contains_key(&candidate) {
                break candidate;
            }
        };

        let (tx, rx) = oneshot::channel();
        let seq = entries.next_seq;
        entries.next_seq += 1;
        entries.order.insert(seq, xid);
        entries.seq_of.insert(xid, seq);
        entries.by_xid.insert(xid, OutstandingRequest {
            xid,
            op_class,
            payload: build(xid),
            state: RequestState::Fresh,
            elapsed: Some(0),
            rexmit: 0,
            retry_ceiling,
            timing: op_class.is_timed(),
            warned: false,
            cancel,
            completion: Some(tx),
        });
        trace!("registered request {:x}", xid);
        (xid, rx)
    }

    /// Delivers the outcome of a request to its waiter. This happens at most once per request,
    ///  a second reply with the same xid is reported as `None`, just like a reply for an xid
    ///  that is unknown.
    pub fn complete(&self, xid: Xid, result: Completion) -> Option<Completed> {
        let mut entries = self.entries.lock().unwrap();
        let req = entries.by_xid.get_mut(&xid)?;
        if req.state.is_terminal() {
            return None;
        }

        let completed = Completed {
            op_class: req.op_class,
            rtt: if req.timing { req.elapsed } else { None },
            was_counted: req.state.is_counted(),
            warned: req.warned,
        };
        req.state = RequestState::Acked;
        req.fire(result);
        Some(completed)
    }

    /// Gives up on a request, waking its waiter with `error`. Returns whether the request held
    ///  a slot in the congestion window, or `None` if it was terminal or unknown.
    pub fn abandon(&self, xid: Xid, error: RpcError) -> Option<bool> {
        let mut entries = self.entries.lock().unwrap();
        let req = entries.by_xid.get_mut(&xid)?;
        if req.state.is_terminal() {
            return None;
        }

        let was_counted = req.state.is_counted();
        req.state = RequestState::Abandoned;
        req.fire(Err(error));
        Some(was_counted)
    }

    /// Abandons every live request, returning the number of them that held a congestion
    ///  window slot
    pub fn abandon_all(&self, error: RpcError) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let mut num_counted = 0;
        for req in entries.by_xid.values_mut() {
            if req.state.is_terminal() {
                continue;
            }
            if req.state.is_counted() {
                num_counted += 1;
            }
            req.state = RequestState::Abandoned;
            req.fire(Err(error.clone()));
        }
        num_counted
    }

    pub fn remove(&self, xid: Xid) -> Option<OutstandingRequest> {
        let mut entries = self.entries.lock().unwrap();
        let req = entries.by_xid.remove(&xid)?;
        if let Some(seq) = entries.seq_of.remove(&xid) {
            entries.order.remove(&seq);
        }
        trace!("removed request {:x}", xid);
        Some(req)
    }

    pub fn with_request<R>(&self, xid: Xid, f: impl FnOnce(&mut OutstandingRequest) -> R) -> Option<R> {
        let mut entries = self.entries.lock().unwrap();
        entries.by_xid.get_mut(&xid).map(f)
    }

    pub fn contains(&self, xid: Xid) -> bool {
        self.entries.lock().unwrap().by_xid.contains_key(&xid)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().by_xid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `f` for every request that is not terminal, oldest first
    pub fn for_each_live(&self, mut f: impl FnMut(&mut OutstandingRequest)) {
        let mut entries = self.entries.lock().unwrap();
        let Entries { by_xid, order, .. } = &mut *entries;
        for xid in order.values() {
            if let Some(req) = by_xid.get_mut(xid) {
                if !req.state.is_terminal() {
                    f(req);
                }
            }
        }
    }

    /// One timer tick: advances the elapsed tick counter of every live request that is on the
    ///  wire, and calls `f` oldest first for requests that are due. A request is due if it is
    ///  waiting for the congestion window, or if `is_expired` says so given its elapsed ticks.
    pub fn for_each_due(
        &self,
        mut is_expired: impl FnMut(&OutstandingRequest, u32) -> bool,
        mut f: impl FnMut(&mut OutstandingRequest),
    ) {
        self.for_each_live(|req| {
            let due = match req.elapsed {
                None => true,
                Some(elapsed) => {
                    let elapsed = elapsed.saturating_add(1);
                    req.elapsed = Some(elapsed);
                    is_expired(req, elapsed)
                }
            };
            if due {
                f(req);
            }
        });
    }

    /// Flags every live request for retransmission after the pipe was replaced. The new pipe
    ///  starts with an empty congestion window, so no request keeps its slot.
    pub fn mark_all_must_resend(&self) {
        self.for_each_live(|req| {
            req.state = RequestState::MustResend { counted: false };
        });
    }

    /// The oldest live request that is flagged for retransmission, with its call message
    pub fn next_must_resend(&self) -> Option<(Xid, Bytes)> {
        let entries = self.entries.lock().unwrap();
        entries.order.values()
            .filter_map(|xid| entries.by_xid.get(xid))
            .find(|req| req.state.must_resend())
            .map(|req| (req.xid, req.payload.clone()))
    }
}
