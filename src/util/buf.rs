use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::error::{Error, Result};

fn underflow(what: &str) -> Error {
    Error::Decode(format!("buffer underflow reading {}", what))
}

pub fn try_get_byte(buf: &mut impl Buf) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(underflow("u8"));
    }
    Ok(buf.get_u8())
}

pub fn try_get_fixed_u32(buf: &mut impl Buf) -> Result<u32> {
    if buf.remaining() < size_of::<u32>() {
        return Err(underflow("u32"));
    }
    Ok(buf.get_u32())
}

pub fn try_get_varint_u64(buf: &mut impl Buf) -> Result<u64> {
    buf.try_get_u64_varint()
        .map_err(|e| Error::Decode(format!("invalid varint: {:?}", e)))
}

pub fn try_get_varint_i64(buf: &mut impl Buf) -> Result<i64> {
    buf.try_get_i64_varint()
        .map_err(|e| Error::Decode(format!("invalid varint: {:?}", e)))
}

pub fn try_get_varint_u32(buf: &mut impl Buf) -> Result<u32> {
    let v = try_get_varint_u64(buf)?;
    u32::try_from(v)
        .map_err(|_| Error::Decode(format!("varint {} out of range for u32", v)))
}

pub fn put_bytes(buf: &mut impl BufMut, b: &[u8]) {
    buf.put_u64_varint(b.len() as u64);
    buf.put_slice(b);
}

pub fn try_get_bytes(buf: &mut impl Buf) -> Result<Vec<u8>> {
    let len = try_get_varint_u64(buf)? as usize;
    if buf.remaining() < len {
        return Err(underflow("byte string"));
    }
    let mut result = vec![0u8; len];
    buf.copy_to_slice(&mut result);
    Ok(result)
}

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> Result<String> {
    let raw = try_get_bytes(buf)?;
    String::from_utf8(raw)
        .map_err(|e| Error::Decode(format!("invalid UTF-8 in string: {}", e)))
}

pub fn put_opt_string(buf: &mut impl BufMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_string(buf, s);
        }
        None => buf.put_u8(0),
    }
}

pub fn try_get_opt_string(buf: &mut impl Buf) -> Result<Option<String>> {
    match try_get_byte(buf)? {
        0 => Ok(None),
        1 => Ok(Some(try_get_string(buf)?)),
        other => Err(Error::Decode(format!("invalid option marker {}", other))),
    }
}

pub fn put_opt_varint_u64(buf: &mut impl BufMut, v: Option<u64>) {
    match v {
        Some(v) => {
            buf.put_u8(1);
            buf.put_u64_varint(v);
        }
        None => buf.put_u8(0),
    }
}

pub fn try_get_opt_varint_u64(buf: &mut impl Buf) -> Result<Option<u64>> {
    match try_get_byte(buf)? {
        0 => Ok(None),
        1 => Ok(Some(try_get_varint_u64(buf)?)),
        other => Err(Error::Decode(format!("invalid option marker {}", other))),
    }
}

pub fn put_opt_varint_i64(buf: &mut impl BufMut, v: Option<i64>) {
    match v {
        Some(v) => {
            buf.put_u8(1);
            buf.put_i64_varint(v);
        }
        None => buf.put_u8(0),
    }
}

pub fn try_get_opt_varint_i64(buf: &mut impl Buf) -> Result<Option<i64>> {
    match try_get_byte(buf)? {
        0 => Ok(None),
        1 => Ok(Some(try_get_varint_i64(buf)?)),
        other => Err(Error::Decode(format!("invalid option marker {}", other))),
    }
}
