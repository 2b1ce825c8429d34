//! Scans the flat sequence of named, KV-bearing messages inside a NOTIFY
//! frame's body.
//!
//! [`MessageScanner::next`] fast-forwards past whatever KV bytes the
//! previous [`Message`] consumed. A caller that reads only some of a
//! message's KV entries MUST call [`Message::discard_kv`] before the next
//! [`MessageScanner::next`] call, or the scanner will misinterpret the
//! unread KV bytes as the next message's header.

use std::fmt;

use crate::kv::{KVScanner, KvError};
use crate::pool::Reset;
use crate::varint::{decode_varint, VarintError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageError {
    Varint(VarintError),
    Truncated,
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageError::Varint(e) => write!(f, "{e}"),
            MessageError::Truncated => write!(f, "truncated message header"),
        }
    }
}

impl std::error::Error for MessageError {}

impl From<VarintError> for MessageError {
    fn from(e: VarintError) -> Self {
        MessageError::Varint(e)
    }
}

/// One named message and a scanner over its KV entries.
///
/// `kv` is `None` until the first call to [`MessageScanner::next`]
/// populates it, and becomes `None` again when the entry is reset for reuse.
pub struct Message<'a> {
    name: &'a [u8],
    kv_entry_count: u8,
    kv: Option<KVScanner<'a>>,
}

impl<'a> Default for Message<'a> {
    fn default() -> Self {
        Self {
            name: &[],
            kv_entry_count: 0,
            kv: None,
        }
    }
}

impl<'a> Message<'a> {
    pub fn name_bytes(&self) -> &'a [u8] {
        self.name
    }

    pub fn kv_entry_count(&self) -> u8 {
        self.kv_entry_count
    }

    pub fn kv(&mut self) -> &mut KVScanner<'a> {
        self.kv.get_or_insert_with(|| KVScanner::new(&[], 0))
    }

    /// Discards any KV entries the caller didn't inspect. Call this after
    /// handling a message and before relying on [`MessageScanner::next`] to
    /// fast-forward past it, matching the "message.KV.Discard()" pattern
    /// every NOTIFY handler loop uses upstream.
    pub fn discard_kv(&mut self) -> Result<(), KvError> {
        match self.kv.as_mut() {
            Some(s) => s.discard(),
            None => Ok(()),
        }
    }
}

impl<'a> Reset for Message<'a> {
    fn reset(&mut self) {
        self.name = &[];
        self.kv_entry_count = 0;
        self.kv = None;
    }
}

/// Scans a flat run of [`Message`]s out of a NOTIFY frame body.
pub struct MessageScanner<'a> {
    buf: &'a [u8],
    last_err: Option<MessageError>,
}

impl<'a> MessageScanner<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, last_err: None }
    }

    pub fn error(&self) -> Option<MessageError> {
        self.last_err
    }

    pub fn next(&mut self, m: &mut Message<'a>) -> bool {
        // Fast-forward past whatever the previous message's KV scanner left
        // unread: `buf` may still hold the bytes, but `m.kv`'s own view of
        // them has already been advanced past consumed entries.
        if let Some(kv) = m.kv.take() {
            let remaining = kv.remaining_buf();
            self.buf = &self.buf[self.buf.len() - remaining..];
        }

        if self.buf.is_empty() {
            return false;
        }

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
            self.last_err = Some(MessageError::Truncated);
            return false;
        }
        m.name = &self.buf[..name_len];
        self.buf = &self.buf[name_len..];

        let Some(&count) = self.buf.first() else {
            self.last_err = Some(MessageError::Truncated);
            return false;
        };
        m.kv_entry_count = count;
        self.buf = &self.buf[1..];

        m.kv = Some(KVScanner::new(self.buf, count as i64));

        true
    }
}

impl<'a> Reset for MessageScanner<'a> {
    fn reset(&mut self) {
        self.buf = &[];
        self.last_err = None;
    }
}

impl<'a> Default for MessageScanner<'a> {
    fn default() -> Self {
        Self::new(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KVWriter;

    fn build_single_message(name: &str, kvs: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = vec![0u8; 256];
        let mut off = 0;

        let n = crate::varint::put_bytes(&mut buf[off..], name.as_bytes()).unwrap();
        off += n;

        buf[off] = kvs.len() as u8;
        off += 1;

        let mut w = KVWriter::new(&mut buf[off..], 0);
        for (k, v) in kvs {
            w.set_string(k, v).unwrap();
        }
        off += w.off();

        buf.truncate(off);
        buf
    }

    #[test]
    fn scans_a_single_message_and_its_kv() {
        let buf = build_single_message("msg1", &[("a", "1"), ("b", "2")]);
        let mut s = MessageScanner::new(&buf);
        let mut m = Message::default();

        assert!(s.next(&mut m));
        assert_eq!(m.name_bytes(), b"msg1");
        assert_eq!(m.kv_entry_count(), 2);

        let mut entry = crate::kv::KVEntry::default();
        assert!(m.kv().next(&mut entry));
        assert!(entry.name_equals("a"));

        assert!(!s.next(&mut Message::default()));
    }

    #[test]
    fn forward_progress_after_discarding_unread_kv_entries() {
        let mut whole = build_single_message("first", &[("a", "1"), ("b", "2")]);
        let second = build_single_message("second", &[]);
        whole.extend_from_slice(&second);

        let mut s = MessageScanner::new(&whole);
        let mut m = Message::default();

        assert!(s.next(&mut m));
        assert_eq!(m.name_bytes(), b"first");
        // A handler loop must discard whatever it didn't read before
        // the scanner can safely advance to the next message.
        assert!(m.discard_kv().is_ok());

        assert!(s.next(&mut m));
        assert_eq!(m.name_bytes(), b"second");
        assert!(!s.next(&mut m));
        assert!(s.error().is_none());
    }

    #[test]
    fn forward_progress_after_partially_reading_kv_entries() {
        let mut whole = build_single_message("first", &[("a", "1"), ("b", "2")]);
        let second = build_single_message("second", &[]);
        whole.extend_from_slice(&second);

        let mut s = MessageScanner::new(&whole);
        let mut m = Message::default();

        assert!(s.next(&mut m));
        let mut e = crate::kv::KVEntry::default();
        assert!(m.kv().next(&mut e)); // consume only the first of two entries
        assert!(m.discard_kv().is_ok()); // discard the rest, as a real handler must

        assert!(s.next(&mut m));
        assert_eq!(m.name_bytes(), b"second");
        assert!(!s.next(&mut m));
    }

    #[test]
    fn discard_kv_consumes_partially_read_entries() {
        let buf = build_single_message("m", &[("a", "1"), ("b", "2"), ("c", "3")]);
        let mut s = MessageScanner::new(&buf);
        let mut m = Message::default();
        assert!(s.next(&mut m));

        let mut e = crate::kv::KVEntry::default();
        assert!(m.kv().next(&mut e)); // only consume the first entry
        assert!(m.discard_kv().is_ok());
        assert_eq!(m.kv().remaining_buf(), 0);
    }
}
