//! VXI-11 DEVICE_CORE/DEVICE_ASYNC procedure structures (VXI-11 1.0 spec).
//!
//! The gateway is the server for this protocol, so every `*Parms` type here
//! is unpacked from an incoming call and every `*Resp` type is packed into
//! the reply.

use crate::{
    error::{Result, VxiError},
    xdr::{self, XdrPack},
};

pub const DEVICE_CORE_PROG: u32 = 0x0607AF;
pub const DEVICE_CORE_VERS: u32 = 1;
pub const DEVICE_ASYNC_PROG: u32 = 0x0607B0;
pub const DEVICE_ASYNC_VERS: u32 = 1;
pub const DEVICE_INTR_PROG: u32 = 0x0607B1;
pub const DEVICE_INTR_VERS: u32 = 1;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreProc {
    CreateLink = 10,
    DeviceWrite = 11,
    DeviceRead = 12,
    DeviceReadStb = 13,
    DeviceTrigger = 14,
    DeviceClear = 15,
    DeviceRemote = 16,
    DeviceLocal = 17,
    DeviceLock = 18,
    DeviceUnlock = 19,
    DestroyLink = 23,
}
impl CoreProc {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            10 => Self::CreateLink,
            11 => Self::DeviceWrite,
            12 => Self::DeviceRead,
            13 => Self::DeviceReadStb,
            14 => Self::DeviceTrigger,
            15 => Self::DeviceClear,
            16 => Self::DeviceRemote,
            17 => Self::DeviceLocal,
            18 => Self::DeviceLock,
            19 => Self::DeviceUnlock,
            23 => Self::DestroyLink,
            _ => return None,
        })
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncProc {
    DeviceAbort = 1,
}
impl AsyncProc {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::DeviceAbort),
            _ => None,
        }
    }
}

/// Operation flags, shared by CREATE_LINK, write, read, and lock requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceFlags {
    pub wait_lock: bool,
    pub end: bool,
    pub termchr_set: bool,
}
impl DeviceFlags {
    pub fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        let flags = xdr::unpack_u32(src)?;
        Ok(Self {
            wait_lock: (flags & 0x01) != 0,
            end: (flags & 0x08) != 0,
            termchr_set: (flags & 0x80) != 0,
        })
    }
}

/// Bits returned in a DEVICE_READ response describing why the read stopped.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadReason {
    pub request_size_satisfied: bool,
    pub termchr_matched: bool,
    pub end: bool,
}
impl ReadReason {
    pub fn bits(self) -> u32 {
        let mut v = 0;
        if self.request_size_satisfied {
            v |= 0x01;
        }
        if self.termchr_matched {
            v |= 0x02;
        }
        if self.end {
            v |= 0x04;
        }
        v
    }
}
impl XdrPack for ReadReason {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.bits().pack_xdr(out);
    }
}

pub struct CreateLinkParms {
    pub client_id: i32,
    pub lock_device: bool,
    pub lock_timeout_ms: u32,
    pub device: String,
}
impl CreateLinkParms {
    pub fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        Ok(Self {
            client_id: xdr::unpack_i32(src)?,
            lock_device: xdr::unpack_bool(src)?,
            lock_timeout_ms: xdr::unpack_u32(src)?,
            device: xdr::unpack_string(src)?,
        })
    }
}

pub struct CreateLinkResp {
    pub error: VxiError,
    pub lid: i32,
    pub abort_port: u16,
    pub max_recv_size: u32,
}
impl XdrPack for CreateLinkResp {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.error.code().pack_xdr(out);
        self.lid.pack_xdr(out);
        (self.abort_port as u32).pack_xdr(out);
        self.max_recv_size.pack_xdr(out);
    }
}

pub struct DeviceWriteParms {
    pub lid: i32,
    pub io_timeout_ms: u32,
    pub lock_timeout_ms: u32,
    pub flags: DeviceFlags,
    pub data: Vec<u8>,
}
impl DeviceWriteParms {
    pub fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        Ok(Self {
            lid: xdr::unpack_i32(src)?,
            io_timeout_ms: xdr::unpack_u32(src)?,
            lock_timeout_ms: xdr::unpack_u32(src)?,
            flags: DeviceFlags::unpack(src)?,
            data: xdr::unpack_opaque(src)?,
        })
    }
}

pub struct DeviceWriteResp {
    pub error: VxiError,
    pub size: u32,
}
impl XdrPack for DeviceWriteResp {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.error.code().pack_xdr(out);
        self.size.pack_xdr(out);
    }
}

pub struct DeviceReadParms {
    pub lid: i32,
    pub request_size: u32,
    pub io_timeout_ms: u32,
    pub lock_timeout_ms: u32,
    pub flags: DeviceFlags,
    pub termchr: u8,
}
impl DeviceReadParms {
    pub fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        Ok(Self {
            lid: xdr::unpack_i32(src)?,
            request_size: xdr::unpack_u32(src)?,
            io_timeout_ms: xdr::unpack_u32(src)?,
            lock_timeout_ms: xdr::unpack_u32(src)?,
            flags: DeviceFlags::unpack(src)?,
            termchr: xdr::unpack_u32(src)? as u8,
        })
    }
}

pub struct DeviceReadResp {
    pub error: VxiError,
    pub reason: ReadReason,
    pub data: Vec<u8>,
}
impl XdrPack for DeviceReadResp {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.error.code().pack_xdr(out);
        self.reason.pack_xdr(out);
        self.data.pack_xdr(out);
    }
}

/// Shared by DEVICE_TRIGGER/CLEAR/REMOTE/LOCAL/READSTB.
pub struct DeviceGenericParms {
    pub lid: i32,
    pub flags: DeviceFlags,
    pub lock_timeout_ms: u32,
    pub io_timeout_ms: u32,
}
impl DeviceGenericParms {
    pub fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        Ok(Self {
            lid: xdr::unpack_i32(src)?,
            flags: DeviceFlags::unpack(src)?,
            lock_timeout_ms: xdr::unpack_u32(src)?,
            io_timeout_ms: xdr::unpack_u32(src)?,
        })
    }
}

pub struct DeviceLockParms {
    pub lid: i32,
    pub flags: DeviceFlags,
    pub lock_timeout_ms: u32,
}
impl DeviceLockParms {
    pub fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        Ok(Self {
            lid: xdr::unpack_i32(src)?,
            flags: DeviceFlags::unpack(src)?,
            lock_timeout_ms: xdr::unpack_u32(src)?,
        })
    }
}

/// The sole response shape for ops that only report an error: UNLOCK,
/// TRIGGER, CLEAR, REMOTE, LOCAL, LOCK, DESTROY_LINK.
pub struct DeviceError {
    pub error: VxiError,
}
impl XdrPack for DeviceError {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.error.code().pack_xdr(out);
    }
}

pub struct DeviceReadStbResp {
    pub error: VxiError,
    pub stb: u8,
}
impl XdrPack for DeviceReadStbResp {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.error.code().pack_xdr(out);
        (self.stb as u32).pack_xdr(out);
    }
}

pub fn unpack_device_link(src: &mut Vec<u8>) -> Result<i32> {
    xdr::unpack_i32(src)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_link_parms_roundtrip() {
        let mut buf = vec![];
        1i32.pack_xdr(&mut buf);
        true.pack_xdr(&mut buf);
        2000u32.pack_xdr(&mut buf);
        "oven".to_string().pack_xdr(&mut buf);

        let parms = CreateLinkParms::unpack(&mut buf).unwrap();
        assert_eq!(parms.client_id, 1);
        assert!(parms.lock_device);
        assert_eq!(parms.lock_timeout_ms, 2000);
        assert_eq!(parms.device, "oven");
    }

    #[test]
    fn device_flags_decode_known_bits() {
        let mut buf = vec![];
        (0x01u32 | 0x08 | 0x80).pack_xdr(&mut buf);
        let flags = DeviceFlags::unpack(&mut buf).unwrap();
        assert!(flags.wait_lock);
        assert!(flags.end);
        assert!(flags.termchr_set);
    }

    #[test]
    fn read_reason_bits_match_vxi11_spec() {
        let reason = ReadReason {
            request_size_satisfied: true,
            termchr_matched: false,
            end: true,
        };
        assert_eq!(reason.bits(), 0x5);
    }

    #[test]
    fn create_link_resp_packs_fields_in_order() {
        let resp = CreateLinkResp {
            error: VxiError::NoError,
            lid: 3,
            abort_port: 1024,
            max_recv_size: 1 << 20,
        };
        let mut buf = vec![];
        resp.pack_xdr(&mut buf);
        assert_eq!(xdr::unpack_u32(&mut buf).unwrap(), 0);
        assert_eq!(xdr::unpack_i32(&mut buf).unwrap(), 3);
        assert_eq!(xdr::unpack_u32(&mut buf).unwrap(), 1024);
        assert_eq!(xdr::unpack_u32(&mut buf).unwrap(), 1 << 20);
    }
}
