//! Typed key/value entries: the payload of a HELLO frame, a NOTIFY message,
//! and (reused) a stick-table entry's extra fields.
//!
//! [`KVEntry`] borrows its name/value bytes straight out of the scanner's
//! input slice — no allocation happens while scanning. Callers that need to
//! keep a value past the next [`KVScanner::next`] call must copy it out.

use std::fmt;
use std::net::IpAddr;

use crate::data_type::{DataType, UnknownDataType, DATA_FLAG_TRUE, DATA_TYPE_MASK};
use crate::pool::Reset;
use crate::varint::{decode_varint, encode_varint, put_bytes, VarintError};

/// Error produced while scanning or writing KV entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    Varint(VarintError),
    UnknownDataType(UnknownDataType),
    /// The backing buffer ended in the middle of a field.
    Truncated,
    /// `ValueAddr` was called on an entry whose byte value isn't 4 or 16 bytes.
    InvalidAddress,
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvError::Varint(e) => write!(f, "{e}"),
            KvError::UnknownDataType(e) => write!(f, "{e}"),
            KvError::Truncated => write!(f, "truncated kv entry"),
            KvError::InvalidAddress => write!(f, "invalid address decode"),
        }
    }
}

impl std::error::Error for KvError {}

impl From<VarintError> for KvError {
    fn from(e: VarintError) -> Self {
        KvError::Varint(e)
    }
}

impl From<UnknownDataType> for KvError {
    fn from(e: UnknownDataType) -> Self {
        KvError::UnknownDataType(e)
    }
}

/// A single decoded key/value pair. Reused across `next()` calls; call
/// [`KVEntry::reset`] (or let the pool do it) before reading stale fields.
#[derive(Default)]
pub struct KVEntry<'a> {
    name: &'a [u8],
    data_type: DataType,
    byte_val: &'a [u8],
    bool_val: bool,
    int_val: i64,
}

impl<'a> KVEntry<'a> {
    pub fn name_bytes(&self) -> &'a [u8] {
        self.name
    }

    pub fn name_equals(&self, s: &str) -> bool {
        self.name == s.as_bytes()
    }

    pub fn value_bytes(&self) -> &'a [u8] {
        self.byte_val
    }

    pub fn value_int(&self) -> i64 {
        self.int_val
    }

    pub fn value_bool(&self) -> bool {
        self.bool_val
    }

    pub fn value_addr(&self) -> Result<IpAddr, KvError> {
        match self.byte_val.len() {
            4 => {
                let mut o = [0u8; 4];
                o.copy_from_slice(self.byte_val);
                Ok(IpAddr::from(o))
            }
            16 => {
                let mut o = [0u8; 16];
                o.copy_from_slice(self.byte_val);
                Ok(IpAddr::from(o))
            }
            _ => Err(KvError::InvalidAddress),
        }
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }
}

impl<'a> fmt::Debug for KVEntry<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KVEntry")
            .field("name", &String::from_utf8_lossy(self.name))
            .field("data_type", &self.data_type)
            .finish()
    }
}

impl<'a> Reset for KVEntry<'a> {
    fn reset(&mut self) {
        self.name = &[];
        self.data_type = DataType::Null;
        self.byte_val = &[];
        self.bool_val = false;
        self.int_val = 0;
    }
}

/// Scans a flat run of KV entries out of a borrowed buffer.
///
/// `left` tracks the declared entry count for message-scoped scans (`-1`
/// means "scan until the buffer is empty", used for HELLO frames which have
/// no entry count prefix).
pub struct KVScanner<'a> {
    buf: &'a [u8],
    left: i64,
    last_err: Option<KvError>,
}

impl<'a> KVScanner<'a> {
    pub fn new(buf: &'a [u8], count: i64) -> Self {
        Self {
            buf,
            left: count,
            last_err: None,
        }
    }

    /// Bytes not yet consumed by the scanner.
    pub fn remaining_buf(&self) -> usize {
        self.buf.len()
    }

    pub fn error(&self) -> Option<&KvError> {
        self.last_err.as_ref()
    }

    /// Decodes the next entry into `entry`, returning `false` once the
    /// buffer is exhausted or an error occurred (check [`Self::error`]).
    pub fn next(&mut self, entry: &mut KVEntry<'a>) -> bool {
        if self.left == 0 || self.buf.is_empty() {
            return false;
        }

        entry.reset();
        self.left -= 1;

        let (name_len, n) = match decode_varint(self.buf) {
            Ok(v) => v,
            Err(e) => {
                self.last_err = Some(e.into());
                return false;
            }
        };
        self.buf = &self.buf[n..];

        let name_len = name_len as usize;
        if name_len > self.buf.len() {
            self.last_err = Some(KvError::Truncated);
            return false;
        }
        entry.name = &self.buf[..name_len];
        self.buf = &self.buf[name_len..];

        let Some(&type_byte) = self.buf.first() else {
            self.last_err = Some(KvError::Truncated);
            return false;
        };
        let data_type = match DataType::from_u8(type_byte & DATA_TYPE_MASK) {
            Ok(dt) => dt,
            Err(e) => {
                self.last_err = Some(e.into());
                return false;
            }
        };
        entry.data_type = data_type;
        // Decoded unconditionally, even for non-bool types: matches upstream.
        entry.bool_val = type_byte & DATA_FLAG_TRUE > 0;
        self.buf = &self.buf[1..];

        match data_type {
            DataType::Null | DataType::Bool => {}

            DataType::Int32 | DataType::Int64 | DataType::UInt32 | DataType::UInt64 => {
                let (v, n) = match decode_varint(self.buf) {
                    Ok(v) => v,
                    Err(e) => {
                        self.last_err = Some(e.into());
                        return false;
                    }
                };
                entry.int_val = v as i64;
                self.buf = &self.buf[n..];
            }

            DataType::Ipv4 => {
                if self.buf.len() < 4 {
                    self.last_err = Some(KvError::Truncated);
                    return false;
                }
                entry.byte_val = &self.buf[..4];
                self.buf = &self.buf[4..];
            }

            DataType::Ipv6 => {
                if self.buf.len() < 16 {
                    self.last_err = Some(KvError::Truncated);
                    return false;
                }
                entry.byte_val = &self.buf[..16];
                self.buf = &self.buf[16..];
            }

            DataType::String => {
                let (len, n) = match decode_varint(self.buf) {
                    Ok(v) => v,
                    Err(e) => {
                        self.last_err = Some(e.into());
                        return false;
                    }
                };
                self.buf = &self.buf[n..];
                let len = len as usize;
                if len > self.buf.len() {
                    self.last_err = Some(KvError::Truncated);
                    return false;
                }
                entry.byte_val = &self.buf[..len];
                self.buf = &self.buf[len..];
            }

            DataType::Binary => {
                let (len, n) = match decode_varint(self.buf) {
                    Ok(v) => v,
                    Err(e) => {
                        self.last_err = Some(e.into());
                        return false;
                    }
                };
                self.buf = &self.buf[n..];
                let len = len as usize;
                if len > self.buf.len() {
                    self.last_err = Some(KvError::Truncated);
                    return false;
                }
                entry.byte_val = &self.buf[..len];
                self.buf = &self.buf[len..];
            }
        }

        true
    }

    /// Consumes every remaining entry without examining it.
    pub fn discard(&mut self) -> Result<(), KvError> {
        if self.remaining_buf() == 0 {
            return Ok(());
        }

        let mut e = KVEntry::default();
        while self.next(&mut e) {}

        match self.last_err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<'a> Reset for KVScanner<'a> {
    fn reset(&mut self) {
        self.buf = &[];
        self.left = 0;
        self.last_err = None;
    }
}

impl<'a> Default for KVScanner<'a> {
    fn default() -> Self {
        Self::new(&[], 0)
    }
}

/// Appends typed KV entries into a caller-owned buffer. Plain KV entries
/// carry no scope tag — that's an `action.rs` concept for SET-VAR/UNSET-VAR.
pub struct KVWriter<'a> {
    data: &'a mut [u8],
    off: usize,
}

impl<'a> KVWriter<'a> {
    pub fn new(data: &'a mut [u8], off: usize) -> Self {
        Self { data, off }
    }

    pub fn off(&self) -> usize {
        self.off
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.off]
    }

    fn write_key(&mut self, name: &[u8]) -> Result<(), KvError> {
        let n = put_bytes(&mut self.data[self.off..], name)?;
        self.off += n;
        Ok(())
    }

    pub fn set_string(&mut self, name: &str, v: &str) -> Result<(), KvError> {
        self.write_key(name.as_bytes())?;
        self.data[self.off] = DataType::String.as_u8();
        self.off += 1;
        let n = put_bytes(&mut self.data[self.off..], v.as_bytes())?;
        self.off += n;
        Ok(())
    }

    pub fn set_binary(&mut self, name: &str, v: &[u8]) -> Result<(), KvError> {
        self.write_key(name.as_bytes())?;
        self.data[self.off] = DataType::Binary.as_u8();
        self.off += 1;
        let n = put_bytes(&mut self.data[self.off..], v)?;
        self.off += n;
        Ok(())
    }

    pub fn set_null(&mut self, name: &str) -> Result<(), KvError> {
        self.write_key(name.as_bytes())?;
        self.data[self.off] = DataType::Null.as_u8();
        self.off += 1;
        Ok(())
    }

    pub fn set_bool(&mut self, name: &str, v: bool) -> Result<(), KvError> {
        self.write_key(name.as_bytes())?;
        self.data[self.off] = DataType::Bool.as_u8() | if v { DATA_FLAG_TRUE } else { 0 };
        self.off += 1;
        Ok(())
    }

    fn set_int(&mut self, name: &str, d: DataType, v: i64) -> Result<(), KvError> {
        self.write_key(name.as_bytes())?;
        self.data[self.off] = d.as_u8();
        self.off += 1;
        let n = encode_varint(&mut self.data[self.off..], v as u64)?;
        self.off += n;
        Ok(())
    }

    pub fn set_u32(&mut self, name: &str, v: u32) -> Result<(), KvError> {
        self.set_int(name, DataType::UInt32, v as i64)
    }

    pub fn set_i32(&mut self, name: &str, v: i32) -> Result<(), KvError> {
        self.set_int(name, DataType::Int32, v as i64)
    }

    pub fn set_i64(&mut self, name: &str, v: i64) -> Result<(), KvError> {
        self.set_int(name, DataType::Int64, v)
    }

    pub fn set_u64(&mut self, name: &str, v: u64) -> Result<(), KvError> {
        self.set_int(name, DataType::UInt64, v as i64)
    }

    pub fn set_addr(&mut self, name: &str, v: IpAddr) -> Result<(), KvError> {
        self.write_key(name.as_bytes())?;
        let (tag, octets): (DataType, Vec<u8>) = match v {
            IpAddr::V4(a) => (DataType::Ipv4, a.octets().to_vec()),
            IpAddr::V6(a) => (DataType::Ipv6, a.octets().to_vec()),
        };
        self.data[self.off] = tag.as_u8();
        self.off += 1;
        if self.data.len() < self.off + octets.len() {
            return Err(KvError::Truncated);
        }
        self.data[self.off..self.off + octets.len()].copy_from_slice(&octets);
        self.off += octets.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn golden_kv_writer_hex() {
        let mut buf = [0u8; 32];
        let mut w = KVWriter::new(&mut buf, 0);
        w.set_string("key", "value").unwrap();
        assert_eq!(
            w.bytes(),
            &[0x03, b'k', b'e', b'y', 0x08, 0x05, b'v', b'a', b'l', b'u', b'e']
        );
    }

    #[test]
    fn write_then_scan_round_trip_string_and_int() {
        let mut buf = [0u8; 64];
        let mut w = KVWriter::new(&mut buf, 0);
        w.set_string("name", "bob").unwrap();
        w.set_u32("age", 42).unwrap();
        let off = w.off();

        let mut s = KVScanner::new(&buf[..off], -1);
        let mut e = KVEntry::default();

        assert!(s.next(&mut e));
        assert!(e.name_equals("name"));
        assert_eq!(e.data_type(), DataType::String);
        assert_eq!(e.value_bytes(), b"bob");

        assert!(s.next(&mut e));
        assert!(e.name_equals("age"));
        assert_eq!(e.data_type(), DataType::UInt32);
        assert_eq!(e.value_int(), 42);

        assert!(!s.next(&mut e));
        assert!(s.error().is_none());
    }

    #[test]
    fn bool_flag_is_decoded_regardless_of_type() {
        let mut buf = [0u8; 16];
        let mut w = KVWriter::new(&mut buf, 0);
        w.set_bool("flag", true).unwrap();
        let off = w.off();

        let mut s = KVScanner::new(&buf[..off], -1);
        let mut e = KVEntry::default();
        assert!(s.next(&mut e));
        assert!(e.value_bool());
    }

    #[test]
    fn discard_consumes_whole_buffer() {
        let mut buf = [0u8; 32];
        let mut w = KVWriter::new(&mut buf, 0);
        w.set_string("a", "1").unwrap();
        w.set_string("b", "2").unwrap();
        let off = w.off();

        let mut s = KVScanner::new(&buf[..off], -1);
        assert!(s.discard().is_ok());
        assert_eq!(s.remaining_buf(), 0);
    }

    #[test]
    fn ipv4_round_trip() {
        let mut buf = [0u8; 16];
        let mut w = KVWriter::new(&mut buf, 0);
        let addr: IpAddr = "192.168.1.1".parse().unwrap();
        w.set_addr("ip", addr).unwrap();
        let off = w.off();

        let mut s = KVScanner::new(&buf[..off], -1);
        let mut e = KVEntry::default();
        assert!(s.next(&mut e));
        assert_eq!(e.value_addr().unwrap(), addr);
    }

    #[test]
    fn unknown_data_type_surfaces_as_error() {
        let buf = [0x01u8, b'x', 0x0Fu8]; // name="x", type nibble 15 is unused
        let mut s = KVScanner::new(&buf, -1);
        let mut e = KVEntry::default();
        assert!(!s.next(&mut e));
        assert!(matches!(s.error(), Some(KvError::UnknownDataType(_))));
    }
}
