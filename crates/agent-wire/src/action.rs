//! Writes the `SET-VAR`/`UNSET-VAR` actions an agent returns in an ACK frame.

use std::fmt;
use std::net::IpAddr;

use crate::data_type::{DataType, DATA_FLAG_TRUE};
use crate::kv::KvError;
use crate::varint::{encode_varint, put_bytes};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    SetVar = 1,
    UnsetVar = 2,
}

/// The scope a `SET-VAR`/`UNSET-VAR` action's variable lives in.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarScope {
    Process = 0,
    Session = 1,
    Transaction = 2,
    Request = 3,
    Response = 4,
}

impl fmt::Display for VarScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VarScope::Process => "process",
            VarScope::Session => "session",
            VarScope::Transaction => "transaction",
            VarScope::Request => "request",
            VarScope::Response => "response",
        };
        write!(f, "{s}")
    }
}

/// Appends actions into a caller-owned buffer, ready to be copied into an
/// ACK frame's body.
pub struct ActionWriter<'a> {
    data: &'a mut [u8],
    off: usize,
}

impl<'a> ActionWriter<'a> {
    pub fn new(data: &'a mut [u8], off: usize) -> Self {
        Self { data, off }
    }

    pub fn off(&self) -> usize {
        self.off
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.off]
    }

    /// Rewinds the write cursor to `off`, discarding any bytes written past
    /// it. Used to drop a partially-written action left behind by a handler
    /// that panicked midway through appending it.
    pub fn truncate(&mut self, off: usize) {
        debug_assert!(off <= self.off);
        self.off = off;
    }

    fn action_header(&mut self, t: ActionType, scope: VarScope, name: &[u8]) -> Result<(), KvError> {
        self.data[self.off] = t as u8;
        self.off += 1;

        let nb_args: u8 = match t {
            ActionType::SetVar => 3,
            ActionType::UnsetVar => 2,
        };
        self.data[self.off] = nb_args;
        self.off += 1;

        self.data[self.off] = scope as u8;
        self.off += 1;

        let n = put_bytes(&mut self.data[self.off..], name)?;
        self.off += n;
        Ok(())
    }

    pub fn unset(&mut self, scope: VarScope, name: &str) -> Result<(), KvError> {
        self.action_header(ActionType::UnsetVar, scope, name.as_bytes())
    }

    pub fn set_string(&mut self, scope: VarScope, name: &str, v: &str) -> Result<(), KvError> {
        self.set_string_bytes(scope, name, v.as_bytes())
    }

    pub fn set_string_bytes(&mut self, scope: VarScope, name: &str, v: &[u8]) -> Result<(), KvError> {
        self.action_header(ActionType::SetVar, scope, name.as_bytes())?;
        self.data[self.off] = DataType::String.as_u8();
        self.off += 1;
        let n = put_bytes(&mut self.data[self.off..], v)?;
        self.off += n;
        Ok(())
    }

    pub fn set_binary(&mut self, scope: VarScope, name: &str, v: &[u8]) -> Result<(), KvError> {
        self.action_header(ActionType::SetVar, scope, name.as_bytes())?;
        self.data[self.off] = DataType::Binary.as_u8();
        self.off += 1;
        let n = put_bytes(&mut self.data[self.off..], v)?;
        self.off += n;
        Ok(())
    }

    pub fn set_null(&mut self, scope: VarScope, name: &str) -> Result<(), KvError> {
        self.action_header(ActionType::SetVar, scope, name.as_bytes())?;
        self.data[self.off] = DataType::Null.as_u8();
        self.off += 1;
        Ok(())
    }

    pub fn set_bool(&mut self, scope: VarScope, name: &str, v: bool) -> Result<(), KvError> {
        self.action_header(ActionType::SetVar, scope, name.as_bytes())?;
        self.data[self.off] = DataType::Bool.as_u8() | if v { DATA_FLAG_TRUE } else { 0 };
        self.off += 1;
        Ok(())
    }

    pub fn set_i64(&mut self, scope: VarScope, name: &str, v: i64) -> Result<(), KvError> {
        self.action_header(ActionType::SetVar, scope, name.as_bytes())?;
        self.data[self.off] = DataType::Int64.as_u8();
        self.off += 1;
        let n = encode_varint(&mut self.data[self.off..], v as u64)?;
        self.off += n;
        Ok(())
    }

    pub fn set_u32(&mut self, scope: VarScope, name: &str, v: u32) -> Result<(), KvError> {
        self.set_i64(scope, name, v as i64)
    }

    pub fn set_i32(&mut self, scope: VarScope, name: &str, v: i32) -> Result<(), KvError> {
        self.set_i64(scope, name, v as i64)
    }

    pub fn set_u64(&mut self, scope: VarScope, name: &str, v: u64) -> Result<(), KvError> {
        self.set_i64(scope, name, v as i64)
    }

    pub fn set_addr(&mut self, scope: VarScope, name: &str, v: IpAddr) -> Result<(), KvError> {
        self.action_header(ActionType::SetVar, scope, name.as_bytes())?;
        let (tag, octets): (DataType, Vec<u8>) = match v {
            IpAddr::V4(a) => (DataType::Ipv4, a.octets().to_vec()),
            IpAddr::V6(a) => (DataType::Ipv6, a.octets().to_vec()),
        };
        self.data[self.off] = tag.as_u8();
        self.off += 1;
        self.data[self.off..self.off + octets.len()].copy_from_slice(&octets);
        self.off += octets.len();
        Ok(())
    }
}
