use std::cmp::{max, min};
use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;
use crate::pipe::TransportKind;
use crate::rpc_header::Credential;

/// Upper bound for the space taken up by RPC and transport headers in a single message. This
///  is added to the read / write size when reserving socket buffers.
pub const MAX_PACKET_HEADER: usize = 404;

/// Sanity ceiling for the length of a stream record, i.e. a single RPC message. Anything above
///  this means we are out of sync with the server's byte stream.
pub const DEFAULT_MAX_RECORD_LEN: u32 = 1 << 27;

/// Everything that is fixed for the lifetime of a mount.
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub server_addr: SocketAddr,
    pub transport: TransportKind,

    /// RPC program and version that all calls are addressed to
    pub program: u32,
    pub version: u32,
    pub credential: Credential,

    /// Interval of the retransmit timer. All timeouts and round trip times are measured in
    ///  multiples of this.
    pub tick: Duration,
    /// Base timeout in ticks. This is the timeout for requests that are not timed individually,
    ///  and the seed for all RTT estimates after (re)connecting.
    pub timeo_ticks: u32,
    /// Retry ceiling for soft mounts. Hard mounts never run into a retry ceiling.
    pub retrans: u32,
    /// If set, requests fail with a timeout after `retrans` retransmissions. Otherwise they are
    ///  retried for as long as it takes.
    pub soft: bool,
    /// If set, the per-request cancellation predicate is consulted at every blocking point
    pub interruptible: bool,
    /// Use a fixed timeout (`timeo_ticks` with backoff) and do not hold back retransmissions
    ///  when the congestion window is full
    pub dumb_timer: bool,
    /// Connect the datagram socket to the server. If not set, every datagram is addressed
    ///  individually, and replies are accepted from any source.
    pub connected_datagram: bool,
    /// Bind to a privileged local port (some servers insist on this)
    pub reserved_port: bool,

    pub rsize: usize,
    pub wsize: usize,
    /// Socket buffers are reserved for this many messages of maximum size. Clamped to 2..=64.
    pub buffer_multiplier: usize,

    /// Number of retransmissions after which a 'server not responding' warning is logged
    pub dead_threshold: u32,
    pub max_record_len: u32,

    /// Upper bound for establishing a connection
    pub connect_timeout: Duration,
    /// Granularity with which a pending connect or lock acquisition re-checks the cancellation
    ///  predicate
    pub cancel_poll: Duration,
}

impl MountConfig {
    /// Defaults for NFS version 3 with AUTH_NULL credentials
    pub fn default_for(server_addr: SocketAddr, transport: TransportKind) -> MountConfig {
        MountConfig {
            server_addr,
            transport,
            program: 100_003,
            version: 3,
            credential: Credential::Null,
            tick: Duration::from_millis(100),
            timeo_ticks: 10,
            retrans: 10,
            soft: false,
            interruptible: false,
            dumb_timer: false,
            connected_datagram: true,
            reserved_port: false,
            rsize: 8192,
            wsize: 8192,
            buffer_multiplier: 2,
            dead_threshold: 9,
            max_record_len: DEFAULT_MAX_RECORD_LEN,
            connect_timeout: Duration::from_secs(60),
            cancel_poll: Duration::from_secs(1),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rsize == 0 || self.wsize == 0 {
            bail!("read and write size must be positive");
        }
        if self.tick.is_zero() {
            bail!("timer tick must be positive");
        }
        if self.timeo_ticks == 0 {
            bail!("base timeout must be at least one tick");
        }
        if self.soft && self.retrans == 0 {
            bail!("a soft mount needs at least one retransmission");
        }
        if (self.max_record_len as usize) < max(self.rsize, self.wsize) + MAX_PACKET_HEADER {
            bail!("maximum record length {} does not fit a message of read / write size", self.max_record_len);
        }
        if self.cancel_poll.is_zero() {
            bail!("cancellation poll interval must be positive");
        }
        Ok(())
    }

    pub fn effective_buffer_multiplier(&self) -> usize {
        min(64, max(2, self.buffer_multiplier))
    }

    /// (send, receive) socket buffer reservations in bytes
    pub fn socket_buffer_sizes(&self) -> (usize, usize) {
        let record_mark_len = match self.transport {
            TransportKind::Datagram => 0,
            TransportKind::Stream => size_of::<u32>(),
        };
        let multiplier = self.effective_buffer_multiplier();

        (
            (self.wsize + MAX_PACKET_HEADER + record_mark_len) * multiplier,
            (self.rsize + MAX_PACKET_HEADER + record_mark_len) * multiplier,
        )
    }

    /// Maximum size of a datagram reply we are prepared to receive
    pub fn max_datagram_len(&self) -> usize {
        max(self.rsize, self.wsize) + MAX_PACKET_HEADER
    }
}
