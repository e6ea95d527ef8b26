//! Client side RPC transport for NFS: issues ONC RPC calls over UDP or TCP, matches replies to
//!  callers, and retransmits with adaptive timeouts and a congestion window.
//!
//! An [RpcEndpoint](endpoint::RpcEndpoint) represents one mount. It is shared by any number of
//!  concurrent callers, each of which calls [issue](endpoint::RpcEndpoint::issue) and waits for
//!  its own reply.

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod op_class;
pub mod pipe;
pub mod receiver;
pub mod registry;
pub mod rpc_header;
pub mod rtt;
pub mod stats;
pub mod test_util;
pub mod timer;
pub mod transmitter;
mod util;
