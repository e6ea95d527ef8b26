//! Round trip estimation and congestion window, as pure functions of per-endpoint state.
//!
//! The estimator is the classic Jacobson / Karels one, in fixed-point integer arithmetic: the
//!  smoothed RTT is stored scaled by 8 and the smoothed mean deviation scaled by 4, which turns
//!  the gains of 1/8 (mean) and 1/4 (deviation) into shifts. All values are in timer ticks.
//!
//! The congestion window limits the number of requests in flight. It is measured in units of
//!  [CWND_SCALE] per request, grows additively by roughly one request per round trip when it is
//!  actually being used to capacity, and is halved on every retransmission of a request that was
//!  on the wire (AIMD).

use std::cmp::{max, min};
use tracing::{debug, trace};
use crate::op_class::OpClass;

/// weight of a single request in the congestion window
pub const CWND_SCALE: u32 = 256;
pub const MAX_CWND: u32 = 32 * CWND_SCALE;

/// the consecutive timeout counter saturates here, which is also the size of the backoff table
pub const MAX_TIMEOUTS: usize = 8;
const BACKOFF: [u32; MAX_TIMEOUTS] = [2, 4, 8, 16, 32, 64, 128, 256];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CongestionState {
    base_timeout: u32,
    /// smoothed RTT per timed class, scaled by 8
    srtt: [u32; OpClass::NUM_TIMED],
    /// smoothed mean deviation per timed class, scaled by 4
    sdrtt: [u32; OpClass::NUM_TIMED],
    cwnd: u32,
    /// sum of the weights of requests currently counted against the window
    sent: u32,
    timeouts: usize,
}

impl CongestionState {
    pub fn new(base_timeout: u32) -> CongestionState {
        let mut result = CongestionState {
            base_timeout: max(1, base_timeout),
            srtt: [0; OpClass::NUM_TIMED],
            sdrtt: [0; OpClass::NUM_TIMED],
            cwnd: 0,
            sent: 0,
            timeouts: 0,
        };
        result.reset();
        result
    }

    /// Back to the initial model, done whenever a new pipe is established: we know nothing about
    ///  the new path, so every class starts out with the base timeout and no deviation.
    pub fn reset(&mut self) {
        self.srtt = [self.base_timeout << 3; OpClass::NUM_TIMED];
        self.sdrtt = [0; OpClass::NUM_TIMED];
        self.cwnd = MAX_CWND / 2;
        self.sent = 0;
        self.timeouts = 0;
    }

    #[cfg(test)]
    pub fn set_internals(&mut self, cwnd: u32, sent: u32, timeouts: usize) {
        self.cwnd = cwnd;
        self.sent = sent;
        self.timeouts = timeouts;
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn sent(&self) -> u32 {
        self.sent
    }

    pub fn timeouts(&self) -> usize {
        self.timeouts
    }

    /// (smoothed RTT scaled by 8, smoothed deviation scaled by 4) - `None` for the untimed class
    pub fn estimate(&self, op_class: OpClass) -> Option<(u32, u32)> {
        op_class.timer_index()
            .map(|i| (self.srtt[i], self.sdrtt[i]))
    }

    pub fn window_open(&self) -> bool {
        self.sent < self.cwnd
    }

    /// The retransmission timeout in ticks for a request of the given class, including backoff
    ///  for consecutive timeouts. Never less than one tick.
    pub fn compute_timeout(&self, op_class: OpClass) -> u32 {
        let raw = match op_class.timer_index() {
            None => self.base_timeout,
            Some(i) => {
                let srtt = self.srtt[i];
                let sdrtt = self.sdrtt[i];
                // small requests are weighted more conservatively than bulk data transfers
                if i < 2 {
                    ((srtt + 3) >> 2) + sdrtt + 1
                }
                else {
                    ((srtt + 7) >> 3) + sdrtt + 1
                }
            }
        };

        let backed_off = if self.timeouts > 0 {
            raw.saturating_mul(BACKOFF[self.timeouts - 1])
        }
        else {
            raw
        };
        max(1, backed_off)
    }

    /// A request was handed to the pipe for the first time (in its current transmission cycle)
    pub fn on_transmit(&mut self) {
        self.sent = self.sent.saturating_add(CWND_SCALE);
        trace!("request counted against congestion window: {}/{}", self.sent, self.cwnd);
    }

    /// A counted request left the window without a reply (abandoned or removed)
    pub fn on_release(&mut self) {
        self.sent = self.sent.saturating_sub(CWND_SCALE);
    }

    /// A reply was matched to a request. `rtt_ticks` is present if the request was being timed.
    pub fn on_ack(&mut self, op_class: OpClass, rtt_ticks: Option<u32>, was_counted: bool) {
        // additive increase, but only if the window is actually used to capacity - an ack while
        //  the window is half empty says nothing about available capacity
        if self.cwnd <= self.sent {
            self.cwnd += (CWND_SCALE * CWND_SCALE + (self.cwnd >> 1)) / self.cwnd;
            self.cwnd = min(self.cwnd, MAX_CWND);
            debug!("full window acknowledged - adjusted cwnd to {}", self.cwnd);
        }

        if was_counted {
            self.sent = self.sent.saturating_sub(CWND_SCALE);
        }

        if let (Some(i), Some(rtt)) = (op_class.timer_index(), rtt_ticks) {
            let t = rtt as i64 + 1 - (self.srtt[i] >> 3) as i64;
            self.srtt[i] = (self.srtt[i] as i64 + t).max(0) as u32;

            let t = t.abs() - (self.sdrtt[i] >> 2) as i64;
            self.sdrtt[i] = (self.sdrtt[i] as i64 + t).max(0) as u32;

            trace!("RTT sample {} for {:?}: srtt={} sdrtt={}", rtt, op_class, self.srtt[i], self.sdrtt[i]);
        }

        self.timeouts = 0;
    }

    /// multiplicative decrease on retransmission
    pub fn on_timeout(&mut self) {
        self.cwnd = max(CWND_SCALE, self.cwnd >> 1);
        debug!("retransmission -> adjusting cwnd downwards to {}", self.cwnd);
    }

    /// A timed request ran past its timeout
    pub fn note_expired(&mut self) {
        self.timeouts = min(self.timeouts + 1, MAX_TIMEOUTS);
    }
}
