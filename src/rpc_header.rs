//! The small part of ONC RPC version 2 (RFC 5531) that the transport engine needs: building call
//!  headers, and decoding reply headers far enough to match replies to requests and to tell
//!  success from failure. Everything after the header is opaque to this crate.
//!
//! ```ascii
//! call:  xid | CALL (0) | rpcvers (2) | prog | vers | proc | cred | verf | <args>
//! reply: xid | REPLY (1) | MSG_ACCEPTED (0) | verf | accept_stat | <results>
//!        xid | REPLY (1) | MSG_DENIED (1) | RPC_MISMATCH (0) | low | high
//!        xid | REPLY (1) | MSG_DENIED (1) | AUTH_ERROR (1) | auth_stat
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use crate::error::ProtocolError;
use crate::util::buf_ext::{XdrBufExt, XdrBufMutExt};

pub type Xid = u32;

pub const RPC_VERSION: u32 = 2;
const MSG_TYPE_CALL: u32 = 0;
const MSG_TYPE_REPLY: u32 = 1;

const AUTH_NULL: u32 = 0;
const AUTH_UNIX: u32 = 1;
/// RFC 5531 limits the body of an authenticator to 400 bytes
const MAX_AUTH_BYTES: usize = 400;
const MAX_AUX_GIDS: usize = 16;
const MAX_MACHINE_NAME_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum ReplyStat {
    Accepted = 0,
    Denied = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum AcceptStat {
    Success = 0,
    ProgUnavail = 1,
    ProgMismatch = 2,
    ProcUnavail = 3,
    GarbageArgs = 4,
    SystemErr = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum RejectStat {
    RpcMismatch = 0,
    AuthError = 1,
}

/// The credential sent with every call of a mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Null,
    Unix {
        stamp: u32,
        machine_name: String,
        uid: u32,
        gid: u32,
        gids: Vec<u32>,
    },
}

impl Credential {
    fn ser(&self, buf: &mut BytesMut) {
        match self {
            Credential::Null => {
                buf.put_u32(AUTH_NULL);
                buf.put_u32(0);
            }
            Credential::Unix { stamp, machine_name, uid, gid, gids } => {
                let mut body = BytesMut::new();
                body.put_u32(*stamp);
                let name_len = machine_name.len().min(MAX_MACHINE_NAME_LEN);
                body.put_xdr_opaque(&machine_name.as_bytes()[..name_len]);
                body.put_u32(*uid);
                body.put_u32(*gid);
                let gids = &gids[..gids.len().min(MAX_AUX_GIDS)];
                body.put_u32(gids.len() as u32);
                for g in gids {
                    body.put_u32(*g);
                }

                buf.put_u32(AUTH_UNIX);
                buf.put_xdr_opaque(&body);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CallHeader<'a> {
    pub xid: Xid,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub credential: &'a Credential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Accepted(AcceptStat),
    /// Only for `PROG_MISMATCH`, which carries the supported version range
    AcceptedMismatch { low: u32, high: u32 },
    RpcMismatch { low: u32, high: u32 },
    AuthError(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub xid: Xid,
    pub status: ReplyStatus,
    /// offset of the procedure-specific results in the reply message
    pub body_offset: usize,
}

impl ReplyHeader {
    /// The procedure results if the call was successful, or the RPC level failure
    pub fn into_result(self, message: Bytes) -> Result<Bytes, ProtocolError> {
        match self.status {
            ReplyStatus::Accepted(AcceptStat::Success) => Ok(message.slice(self.body_offset..)),
            ReplyStatus::Accepted(AcceptStat::ProgUnavail) => Err(ProtocolError::ProgUnavailable),
            ReplyStatus::Accepted(AcceptStat::ProgMismatch) => Err(ProtocolError::ProgMismatch { low: 0, high: 0 }),
            ReplyStatus::Accepted(AcceptStat::ProcUnavail) => Err(ProtocolError::ProcUnavailable),
            ReplyStatus::Accepted(AcceptStat::GarbageArgs) => Err(ProtocolError::GarbageArgs),
            ReplyStatus::Accepted(AcceptStat::SystemErr) => Err(ProtocolError::SystemError),
            ReplyStatus::AcceptedMismatch { low, high } => Err(ProtocolError::ProgMismatch { low, high }),
            ReplyStatus::RpcMismatch { low, high } => Err(ProtocolError::RpcMismatch { low, high }),
            ReplyStatus::AuthError(stat) => Err(ProtocolError::AuthError(stat)),
        }
    }
}

/// This is an abstraction for the RPC message layer, introduced so that the transport engine
///  can be used with different call header conventions (and tested without them)
pub trait RpcFraming: Send + Sync + 'static {
    /// The complete call message for `header` followed by the already serialized arguments
    fn build_call(&self, header: &CallHeader, body: &[u8]) -> Bytes;

    fn parse_reply_header(&self, message: &[u8]) -> Result<ReplyHeader, ProtocolError>;
}

pub struct SunRpcFraming;

impl RpcFraming for SunRpcFraming {
    fn build_call(&self, header: &CallHeader, body: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + body.len());
        buf.put_u32(header.xid);
        buf.put_u32(MSG_TYPE_CALL);
        buf.put_u32(RPC_VERSION);
        buf.put_u32(header.program);
        buf.put_u32(header.version);
        buf.put_u32(header.procedure);
        header.credential.ser(&mut buf);
        // verifier
        buf.put_u32(AUTH_NULL);
        buf.put_u32(0);
        buf.put_slice(body);
        buf.freeze()
    }

    fn parse_reply_header(&self, message: &[u8]) -> Result<ReplyHeader, ProtocolError> {
        let mut buf = message;

        let xid = buf.try_get_xdr_u32()?;
        if buf.try_get_xdr_u32()? != MSG_TYPE_REPLY {
            return Err(ProtocolError::NotAReply);
        }

        let reply_stat = ReplyStat::try_from(buf.try_get_xdr_u32()?)
            .map_err(|_| ProtocolError::Malformed)?;

        let status = match reply_stat {
            ReplyStat::Accepted => {
                let _flavor = buf.try_get_xdr_u32()?;
                buf.try_skip_opaque(MAX_AUTH_BYTES)?;

                let accept_stat = AcceptStat::try_from(buf.try_get_xdr_u32()?)
                    .map_err(|_| ProtocolError::Malformed)?;
                if accept_stat == AcceptStat::ProgMismatch {
                    let low = buf.try_get_xdr_u32()?;
                    let high = buf.try_get_xdr_u32()?;
                    ReplyStatus::AcceptedMismatch { low, high }
                }
                else {
                    ReplyStatus::Accepted(accept_stat)
                }
            }
            ReplyStat::Denied => {
                let reject_stat = RejectStat::try_from(buf.try_get_xdr_u32()?)
                    .map_err(|_| ProtocolError::Malformed)?;
                match reject_stat {
                    RejectStat::RpcMismatch => {
                        let low = buf.try_get_xdr_u32()?;
                        let high = buf.try_get_xdr_u32()?;
                        ReplyStatus::RpcMismatch { low, high }
                    }
                    RejectStat::AuthError => ReplyStatus::AuthError(buf.try_get_xdr_u32()?),
                }
            }
        };

        Ok(ReplyHeader {
            xid,
            status,
            body_offset: message.len() - buf.len(),
        })
    }
}

/// The xid of an RPC message, without any further validation
pub fn peek_xid(message: &[u8]) -> Option<Xid> {
    let mut buf = message;
    buf.try_get_xdr_u32().ok()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_build_call_auth_null() {
        let call = SunRpcFraming.build_call(&CallHeader {
            xid: 0x01020304,
            program: 100_003,
            version: 3,
            procedure: 1,
            credential: &Credential::Null,
        }, &[9, 9]);

        assert_eq!(call.as_ref(), &[
            1,2,3,4,
            0,0,0,0,
            0,0,0,2,
            0,1,0x86,0xa3,
            0,0,0,3,
            0,0,0,1,
            0,0,0,0, 0,0,0,0,
            0,0,0,0, 0,0,0,0,
            9,9,
        ]);
    }

    #[test]
    fn test_build_call_auth_unix() {
        let call = SunRpcFraming.build_call(&CallHeader {
            xid: 7,
            program: 100_003,
            version: 3,
            procedure: 0,
            credential: &Credential::Unix {
                stamp: 5,
                machine_name: "abc".to_string(),
                uid: 1000,
                gid: 100,
                gids: vec![4, 24],
            },
        }, &[]);

        let cred = &call[24..];
        assert_eq!(&cred[..8], &[0,0,0,1, 0,0,0,32]);
        assert_eq!(&cred[8..40], &[
            0,0,0,5,
            0,0,0,3, b'a',b'b',b'c',0,
            0,0,0x03,0xe8,
            0,0,0,100,
            0,0,0,2, 0,0,0,4, 0,0,0,24,
        ]);
        // verifier
        assert_eq!(&cred[40..], &[0,0,0,0, 0,0,0,0]);
    }

    #[test]
    fn test_build_call_truncates_gids() {
        let call = SunRpcFraming.build_call(&CallHeader {
            xid: 7,
            program: 1,
            version: 1,
            procedure: 0,
            credential: &Credential::Unix {
                stamp: 0,
                machine_name: String::new(),
                uid: 0,
                gid: 0,
                gids: (0..40).collect(),
            },
        }, &[]);

        // 24 header + 8 flavor/len + 4 stamp + 4 name + 8 uid/gid + 4 count + 16*4 gids + 8 verf
        assert_eq!(call.len(), 24 + 8 + 4 + 4 + 8 + 4 + 64 + 8);
    }

    #[rstest]
    #[case::success(
        vec![0,0,0,9, 0,0,0,1, 0,0,0,0, 0,0,0,0, 0,0,0,0, 0,0,0,0, 7,7],
        Ok(ReplyHeader { xid: 9, status: ReplyStatus::Accepted(AcceptStat::Success), body_offset: 24 }),
    )]
    #[case::success_with_verifier(
        vec![0,0,0,9, 0,0,0,1, 0,0,0,0, 0,0,0,1, 0,0,0,3, 1,2,3,0, 0,0,0,0],
        Ok(ReplyHeader { xid: 9, status: ReplyStatus::Accepted(AcceptStat::Success), body_offset: 28 }),
    )]
    #[case::garbage_args(
        vec![0,0,0,9, 0,0,0,1, 0,0,0,0, 0,0,0,0, 0,0,0,0, 0,0,0,4],
        Ok(ReplyHeader { xid: 9, status: ReplyStatus::Accepted(AcceptStat::GarbageArgs), body_offset: 24 }),
    )]
    #[case::prog_mismatch(
        vec![0,0,0,9, 0,0,0,1, 0,0,0,0, 0,0,0,0, 0,0,0,0, 0,0,0,2, 0,0,0,2, 0,0,0,3],
        Ok(ReplyHeader { xid: 9, status: ReplyStatus::AcceptedMismatch { low: 2, high: 3 }, body_offset: 32 }),
    )]
    #[case::rpc_mismatch(
        vec![0,0,0,9, 0,0,0,1, 0,0,0,1, 0,0,0,0, 0,0,0,2, 0,0,0,2],
        Ok(ReplyHeader { xid: 9, status: ReplyStatus::RpcMismatch { low: 2, high: 2 }, body_offset: 24 }),
    )]
    #[case::auth_error(
        vec![0,0,0,9, 0,0,0,1, 0,0,0,1, 0,0,0,1, 0,0,0,5],
        Ok(ReplyHeader { xid: 9, status: ReplyStatus::AuthError(5), body_offset: 20 }),
    )]
    #[case::call(vec![0,0,0,9, 0,0,0,0, 0,0,0,2], Err(ProtocolError::NotAReply))]
    #[case::truncated(vec![0,0,0,9, 0,0,0,1, 0,0,0,0, 0,0], Err(ProtocolError::Malformed))]
    #[case::bad_reply_stat(vec![0,0,0,9, 0,0,0,1, 0,0,0,7], Err(ProtocolError::Malformed))]
    #[case::bad_accept_stat(vec![0,0,0,9, 0,0,0,1, 0,0,0,0, 0,0,0,0, 0,0,0,0, 0,0,0,99], Err(ProtocolError::Malformed))]
    #[case::oversized_verifier(vec![0,0,0,9, 0,0,0,1, 0,0,0,0, 0,0,0,0, 0,0,0xff,0xff], Err(ProtocolError::Malformed))]
    #[case::empty(vec![], Err(ProtocolError::Malformed))]
    fn test_parse_reply_header(#[case] message: Vec<u8>, #[case] expected: Result<ReplyHeader, ProtocolError>) {
        assert_eq!(SunRpcFraming.parse_reply_header(&message), expected);
    }

    #[rstest]
    #[case::success(ReplyStatus::Accepted(AcceptStat::Success), Ok(Bytes::from_static(&[7, 7])))]
    #[case::proc_unavail(ReplyStatus::Accepted(AcceptStat::ProcUnavail), Err(ProtocolError::ProcUnavailable))]
    #[case::system_err(ReplyStatus::Accepted(AcceptStat::SystemErr), Err(ProtocolError::SystemError))]
    #[case::prog_mismatch(ReplyStatus::AcceptedMismatch { low: 2, high: 3 }, Err(ProtocolError::ProgMismatch { low: 2, high: 3 }))]
    #[case::auth(ReplyStatus::AuthError(1), Err(ProtocolError::AuthError(1)))]
    fn test_into_result(#[case] status: ReplyStatus, #[case] expected: Result<Bytes, ProtocolError>) {
        let header = ReplyHeader { xid: 1, status, body_offset: 2 };
        assert_eq!(header.into_result(Bytes::from_static(&[0, 0, 7, 7])), expected);
    }

    #[test]
    fn test_peek_xid() {
        assert_eq!(peek_xid(&[0, 0, 1, 0, 5]), Some(256));
        assert_eq!(peek_xid(&[0, 0, 1]), None);
    }
}
