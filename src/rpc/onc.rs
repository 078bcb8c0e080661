//! Open Network Computing (ONC) RPC message envelope, as defined by RFC5531.
//!
//! Unlike a client, which only ever packs calls and unpacks replies, the
//! gateway sits on the server side of this protocol: it unpacks calls and
//! packs replies. Both directions of the envelope are implemented here so
//! the dispatcher in [`crate::rpc::listener`] can work purely in terms of
//! [`RpcMessage`].

use crate::{
    error::{Error, Result},
    xdr::{self, XdrPack},
};

pub const RPC_VERSION: u32 = 2;

/// High bit of the record-mark header marks the final fragment of a message.
pub const LAST_FRAGMENT_MARKER: u32 = 0x8000_0000;

#[derive(Debug)]
pub struct RpcMessage {
    pub xid: u32,
    pub body: MessageBody,
}
impl RpcMessage {
    pub fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        Ok(Self {
            xid: xdr::unpack_u32(src)?,
            body: MessageBody::unpack(src)?,
        })
    }

    /// Build a reply to this call carrying a successfully-encoded result.
    pub fn reply_success(&self, results: Vec<u8>) -> RpcMessage {
        RpcMessage {
            xid: self.xid,
            body: MessageBody::Reply(ReplyBody::Accepted(AcceptedReplyBody {
                verf: OpaqueAuth::new_null(),
                body: AcceptedReplyBodyType::Success(results),
            })),
        }
    }

    pub fn reply_prog_unavail(&self) -> RpcMessage {
        self.reply_accepted(AcceptedReplyBodyType::ProgUnavail)
    }

    pub fn reply_prog_mismatch(&self, low: u32, high: u32) -> RpcMessage {
        self.reply_accepted(AcceptedReplyBodyType::ProgMismatch { low, high })
    }

    pub fn reply_proc_unavail(&self) -> RpcMessage {
        self.reply_accepted(AcceptedReplyBodyType::ProcUnavail)
    }

    pub fn reply_garbage_args(&self) -> RpcMessage {
        self.reply_accepted(AcceptedReplyBodyType::GarbageArgs)
    }

    fn reply_accepted(&self, body: AcceptedReplyBodyType) -> RpcMessage {
        RpcMessage {
            xid: self.xid,
            body: MessageBody::Reply(ReplyBody::Accepted(AcceptedReplyBody {
                verf: OpaqueAuth::new_null(),
                body,
            })),
        }
    }

    /// If this message is a call, return the program/version/procedure and
    /// the still-packed argument bytes.
    pub fn as_call(&self) -> Option<&CallBody> {
        match &self.body {
            MessageBody::Call(call) => Some(call),
            MessageBody::Reply(_) => None,
        }
    }
}
impl XdrPack for RpcMessage {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.xid.pack_xdr(out);
        self.body.pack_xdr(out);
    }
}

#[derive(Debug)]
pub enum MessageBody {
    Call(CallBody),
    Reply(ReplyBody),
}
impl MessageBody {
    pub fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        match xdr::unpack_u32(src)? {
            0 => Ok(Self::Call(CallBody::unpack(src)?)),
            1 => Ok(Self::Reply(ReplyBody::unpack(src)?)),
            i => Err(Error::Decode(format!("Unknown message type {i}"))),
        }
    }
}
impl XdrPack for MessageBody {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        match self {
            Self::Call(call) => {
                0u32.pack_xdr(out);
                call.pack_xdr(out);
            }
            Self::Reply(reply) => {
                1u32.pack_xdr(out);
                reply.pack_xdr(out);
            }
        }
    }
}

#[derive(Debug)]
pub struct CallBody {
    pub rpc_version: u32,
    pub prog: u32,
    pub vers: u32,
    pub proc: u32,
    pub cred: OpaqueAuth,
    pub verf: OpaqueAuth,
    /// Still-packed procedure arguments; decoded by the specific handler.
    pub args: Vec<u8>,
}
impl CallBody {
    pub fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        Ok(Self {
            rpc_version: xdr::unpack_u32(src)?,
            prog: xdr::unpack_u32(src)?,
            vers: xdr::unpack_u32(src)?,
            proc: xdr::unpack_u32(src)?,
            cred: OpaqueAuth::unpack(src)?,
            verf: OpaqueAuth::unpack(src)?,
            args: std::mem::take(src),
        })
    }
}
impl XdrPack for CallBody {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.rpc_version.pack_xdr(out);
        self.prog.pack_xdr(out);
        self.vers.pack_xdr(out);
        self.proc.pack_xdr(out);
        self.cred.pack_xdr(out);
        self.verf.pack_xdr(out);
        out.extend(self.args);
    }
}

#[derive(Debug)]
pub enum ReplyBody {
    Accepted(AcceptedReplyBody),
    Rejected(RejectedReplyBody),
}
impl ReplyBody {
    pub fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        match xdr::unpack_u32(src)? {
            0 => Ok(Self::Accepted(AcceptedReplyBody::unpack(src)?)),
            1 => Ok(Self::Rejected(RejectedReplyBody::unpack(src)?)),
            i => Err(Error::Decode(format!("Unknown reply type {i}"))),
        }
    }
}
impl XdrPack for ReplyBody {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        match self {
            Self::Accepted(accepted) => {
                0u32.pack_xdr(out);
                accepted.pack_xdr(out);
            }
            Self::Rejected(rejected) => {
                1u32.pack_xdr(out);
                rejected.pack_xdr(out);
            }
        }
    }
}

#[derive(Debug)]
pub struct AcceptedReplyBody {
    pub verf: OpaqueAuth,
    pub body: AcceptedReplyBodyType,
}
impl AcceptedReplyBody {
    pub fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        Ok(Self {
            verf: OpaqueAuth::unpack(src)?,
            body: AcceptedReplyBodyType::unpack(src)?,
        })
    }
}
impl XdrPack for AcceptedReplyBody {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.verf.pack_xdr(out);
        self.body.pack_xdr(out);
    }
}

#[derive(Debug)]
pub enum AcceptedReplyBodyType {
    /// Already-packed procedure-specific result bytes.
    Success(Vec<u8>),
    ProgUnavail,
    ProgMismatch { low: u32, high: u32 },
    ProcUnavail,
    GarbageArgs,
    SystemErr,
}
impl AcceptedReplyBodyType {
    fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        match xdr::unpack_u32(src)? {
            0 => Ok(Self::Success(std::mem::take(src))),
            1 => Ok(Self::ProgUnavail),
            2 => Ok(Self::ProgMismatch {
                low: xdr::unpack_u32(src)?,
                high: xdr::unpack_u32(src)?,
            }),
            3 => Ok(Self::ProcUnavail),
            4 => Ok(Self::GarbageArgs),
            5 => Ok(Self::SystemErr),
            i => Err(Error::Decode(format!("Unknown accepted reply type {i}"))),
        }
    }
}
impl XdrPack for AcceptedReplyBodyType {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        match self {
            Self::Success(results) => {
                0u32.pack_xdr(out);
                out.extend(results);
            }
            Self::ProgUnavail => 1u32.pack_xdr(out),
            Self::ProgMismatch { low, high } => {
                2u32.pack_xdr(out);
                low.pack_xdr(out);
                high.pack_xdr(out);
            }
            Self::ProcUnavail => 3u32.pack_xdr(out),
            Self::GarbageArgs => 4u32.pack_xdr(out),
            Self::SystemErr => 5u32.pack_xdr(out),
        }
    }
}

#[derive(Debug)]
pub enum RejectedReplyBody {
    RpcMismatch { low: u32, high: u32 },
    AuthError(u32),
}
impl RejectedReplyBody {
    fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        match xdr::unpack_u32(src)? {
            0 => Ok(Self::RpcMismatch {
                low: xdr::unpack_u32(src)?,
                high: xdr::unpack_u32(src)?,
            }),
            1 => Ok(Self::AuthError(xdr::unpack_u32(src)?)),
            i => Err(Error::Decode(format!("Unknown rejected reply type {i}"))),
        }
    }
}
impl XdrPack for RejectedReplyBody {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        match self {
            Self::RpcMismatch { low, high } => {
                0u32.pack_xdr(out);
                low.pack_xdr(out);
                high.pack_xdr(out);
            }
            Self::AuthError(stat) => {
                1u32.pack_xdr(out);
                stat.pack_xdr(out);
            }
        }
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug)]
pub enum AuthFlavor {
    Null = 0,
    Sys = 1,
    Short = 2,
    Dh = 3,
    RpcSecGss = 4,
}

#[derive(Debug)]
pub struct OpaqueAuth {
    pub flavor: AuthFlavor,
    pub body: Vec<u8>,
}
impl OpaqueAuth {
    pub fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        Ok(Self {
            flavor: match xdr::unpack_u32(src)? {
                0 => AuthFlavor::Null,
                1 => AuthFlavor::Sys,
                2 => AuthFlavor::Short,
                3 => AuthFlavor::Dh,
                4 => AuthFlavor::RpcSecGss,
                i => return Err(Error::Decode(format!("Unknown auth flavor {i}"))),
            },
            body: xdr::unpack_opaque(src)?,
        })
    }

    pub fn new_null() -> Self {
        Self {
            flavor: AuthFlavor::Null,
            body: vec![],
        }
    }
}
impl XdrPack for OpaqueAuth {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        (self.flavor as u32).pack_xdr(out);
        self.body.pack_xdr(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_call(prog: u32, vers: u32, proc: u32, args: Vec<u8>) -> Vec<u8> {
        let mut buf = vec![];
        7u32.pack_xdr(&mut buf); // xid
        0u32.pack_xdr(&mut buf); // CALL
        RPC_VERSION.pack_xdr(&mut buf);
        prog.pack_xdr(&mut buf);
        vers.pack_xdr(&mut buf);
        proc.pack_xdr(&mut buf);
        (0u32).pack_xdr(&mut buf); // cred flavor null
        vec![].pack_xdr(&mut buf); // cred body
        (0u32).pack_xdr(&mut buf); // verf flavor null
        vec![].pack_xdr(&mut buf); // verf body
        buf.extend(args);
        buf
    }

    #[test]
    fn decode_call_roundtrips_program_fields() {
        let mut buf = sample_call(0x0607AF, 1, 10, vec![1, 2, 3, 4]);
        let msg = RpcMessage::unpack(&mut buf).unwrap();
        assert_eq!(msg.xid, 7);
        let call = msg.as_call().unwrap();
        assert_eq!(call.prog, 0x0607AF);
        assert_eq!(call.vers, 1);
        assert_eq!(call.proc, 10);
        assert_eq!(call.args, vec![1, 2, 3, 4]);
    }

    #[test]
    fn success_reply_carries_results_verbatim() {
        let mut req = sample_call(1, 1, 1, vec![]);
        let msg = RpcMessage::unpack(&mut req).unwrap();
        let reply = msg.reply_success(vec![9, 9, 9, 9]);
        let mut packed = vec![];
        reply.pack_xdr(&mut packed);

        let decoded = RpcMessage::unpack(&mut packed).unwrap();
        match decoded.body {
            MessageBody::Reply(ReplyBody::Accepted(AcceptedReplyBody {
                body: AcceptedReplyBodyType::Success(results),
                ..
            })) => assert_eq!(results, vec![9, 9, 9, 9]),
            other => panic!("unexpected reply body: {other:?}"),
        }
    }

    #[test]
    fn prog_unavail_reply_roundtrips() {
        let mut req = sample_call(1, 1, 1, vec![]);
        let msg = RpcMessage::unpack(&mut req).unwrap();
        let mut packed = vec![];
        msg.reply_prog_unavail().pack_xdr(&mut packed);

        let decoded = RpcMessage::unpack(&mut packed).unwrap();
        assert!(matches!(
            decoded.body,
            MessageBody::Reply(ReplyBody::Accepted(AcceptedReplyBody {
                body: AcceptedReplyBodyType::ProgUnavail,
                ..
            }))
        ));
    }
}
