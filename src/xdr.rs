//! External Data Representation (XDR), as defined by RFC4506.
//!
//! This module is used in both directions: the gateway decodes XDR-encoded
//! RPC *requests* from clients and encodes XDR *replies* back to them, so
//! every primitive has both a `pack` and an `unpack` side.

use crate::error::{Error, Result};

pub trait XdrPack {
    /// Consume self, appending XDR representation into out
    fn pack_xdr(self, out: &mut Vec<u8>);
}

impl XdrPack for u32 {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        out.extend(self.to_be_bytes());
    }
}

impl XdrPack for i32 {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        out.extend(self.to_be_bytes());
    }
}

impl XdrPack for bool {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        (self as u32).pack_xdr(out);
    }
}

impl XdrPack for Vec<u8> {
    /// This only applies to "opaque" data buffers that are prefixed by the size
    fn pack_xdr(self, out: &mut Vec<u8>) {
        let len = self.len();
        (self.len() as u32).pack_xdr(out);
        out.extend(self);
        /* Must be padded to multiple of 4-byte words */
        if !len.is_multiple_of(4) {
            for _ in 0..(4 - (len % 4)) {
                out.push(0);
            }
        }
    }
}

impl XdrPack for String {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.into_bytes().pack_xdr(out);
    }
}

pub fn unpack_u32(src: &mut Vec<u8>) -> Result<u32> {
    if src.len() < 4 {
        return Err(Error::Decode("Not enough bytes to read u32".to_string()));
    }
    let bytes = src
        .drain(0..4)
        .collect::<Vec<_>>()
        .try_into()
        .map_err(|_| Error::Decode("Not enough bytes to read u32".to_string()))?;

    Ok(u32::from_be_bytes(bytes))
}

pub fn unpack_i32(src: &mut Vec<u8>) -> Result<i32> {
    if src.len() < 4 {
        return Err(Error::Decode("Not enough bytes to read i32".to_string()));
    }
    let bytes = src
        .drain(0..4)
        .collect::<Vec<_>>()
        .try_into()
        .map_err(|_| Error::Decode("Not enough bytes to read i32".to_string()))?;

    Ok(i32::from_be_bytes(bytes))
}

pub fn unpack_u16(src: &mut Vec<u8>) -> Result<u16> {
    let val = unpack_u32(src)?;
    val.try_into()
        .map_err(|_| Error::Decode(format!("Value {val} does not represent a 16-bit value")))
}

pub fn unpack_bool(src: &mut Vec<u8>) -> Result<bool> {
    Ok(unpack_u32(src)? != 0)
}

pub fn unpack_opaque(src: &mut Vec<u8>) -> Result<Vec<u8>> {
    let length = unpack_u32(src)? as usize;
    let padding = if !length.is_multiple_of(4) {
        4 - (length % 4)
    } else {
        0
    };

    if src.len() < (length + padding) {
        return Err(Error::Decode(
            "Not enough bytes to read opaque type".to_string(),
        ));
    }

    let res = src.drain(0..length).collect();
    src.drain(0..padding);
    Ok(res)
}

pub fn unpack_string(src: &mut Vec<u8>) -> Result<String> {
    let bytes = unpack_opaque(src)?;
    String::from_utf8(bytes).map_err(|e| Error::Decode(format!("Invalid UTF-8 string: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_roundtrip() {
        let mut buf = vec![];
        42u32.pack_xdr(&mut buf);
        assert_eq!(unpack_u32(&mut buf).unwrap(), 42);
    }

    #[test]
    fn i32_roundtrip_negative() {
        let mut buf = vec![];
        (-7i32).pack_xdr(&mut buf);
        assert_eq!(unpack_i32(&mut buf).unwrap(), -7);
    }

    #[test]
    fn opaque_roundtrip_with_padding() {
        let mut buf = vec![];
        vec![1u8, 2, 3].pack_xdr(&mut buf);
        // 3 bytes of payload should be padded to a 4-byte boundary
        assert_eq!(buf.len(), 4 + 4);
        assert_eq!(unpack_opaque(&mut buf).unwrap(), vec![1, 2, 3]);
        assert!(buf.is_empty());
    }

    #[test]
    fn opaque_roundtrip_exact_word() {
        let mut buf = vec![];
        vec![1u8, 2, 3, 4].pack_xdr(&mut buf);
        assert_eq!(buf.len(), 4 + 4);
        assert_eq!(unpack_opaque(&mut buf).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn string_roundtrip() {
        let mut buf = vec![];
        "inst0".to_string().pack_xdr(&mut buf);
        assert_eq!(unpack_string(&mut buf).unwrap(), "inst0");
    }

    #[test]
    fn bool_roundtrip() {
        let mut buf = vec![];
        true.pack_xdr(&mut buf);
        false.pack_xdr(&mut buf);
        assert!(unpack_bool(&mut buf).unwrap());
        assert!(!unpack_bool(&mut buf).unwrap());
    }
}
