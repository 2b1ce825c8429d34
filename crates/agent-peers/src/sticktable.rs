//! Stick-table replication: a table [`Definition`] (name, key type, and the
//! ordered list of extra data columns it carries) and the [`EntryUpdate`]s
//! decoded against it.
//!
//! Every update frame borrows nothing — `Definition` and `EntryUpdate` are
//! owned because a `Definition` is connection-scoped state that outlives the
//! single buffer it was decoded from (it replaces the prior definition and
//! is consulted by every later update until the next one arrives).

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use agent_wire::decode_varint;

use crate::error::PeersError;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Any = 0,
    Boolean = 1,
    SignedInteger = 2,
    Address = 3,
    Ipv4Address = 4,
    Ipv6Address = 5,
    String = 6,
    Binary = 7,
    Method = 8,
}

impl KeyType {
    pub fn from_u64(v: u64) -> Result<Self, UnknownKeyType> {
        match v {
            0 => Ok(KeyType::Any),
            1 => Ok(KeyType::Boolean),
            2 => Ok(KeyType::SignedInteger),
            3 => Ok(KeyType::Address),
            4 => Ok(KeyType::Ipv4Address),
            5 => Ok(KeyType::Ipv6Address),
            6 => Ok(KeyType::String),
            7 => Ok(KeyType::Binary),
            8 => Ok(KeyType::Method),
            other => Err(UnknownKeyType(other)),
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KeyType::Any => "any",
            KeyType::Boolean => "boolean",
            KeyType::SignedInteger => "signed integer",
            KeyType::Address => "address",
            KeyType::Ipv4Address => "ipv4 address",
            KeyType::Ipv6Address => "ipv6 address",
            KeyType::String => "string",
            KeyType::Binary => "binary",
            KeyType::Method => "method",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownKeyType(pub u64);

impl fmt::Display for UnknownKeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown key type: {}", self.0)
    }
}

impl std::error::Error for UnknownKeyType {}

/// The extra per-entry data columns a stick table can carry, in the bit
/// order HAProxy assigns them (bit `i` of the definition's data-types
/// bitmap selects `DataType` code `i`).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    ServerId = 0,
    Gpt0 = 1,
    Gpc0 = 2,
    Gpc0Rate = 3,
    ConnCnt = 4,
    ConnRate = 5,
    ConnCur = 6,
    SessCnt = 7,
    SessRate = 8,
    HttpReqCnt = 9,
    HttpReqRate = 10,
    HttpErrCnt = 11,
    HttpErrRate = 12,
    BytesInCnt = 13,
    BytesInRate = 14,
    BytesOutCnt = 15,
    BytesOutRate = 16,
    Gpc1 = 17,
    Gpc1Rate = 18,
    ServerKey = 19,
    HttpFailCnt = 20,
    HttpFailRate = 21,
    GptArray = 22,
    GpcArray = 23,
    GpcRateArray = 24,
    GlitchCnt = 25,
    GlitchRate = 26,
}

impl DataType {
    /// Maps a set bit index (0..64, per the definition's bitmap) to a
    /// `DataType`. Only bits 0..26 are currently assigned; anything higher
    /// is not yet a known column.
    pub fn from_bit(i: u32) -> Option<Self> {
        Some(match i {
            0 => DataType::ServerId,
            1 => DataType::Gpt0,
            2 => DataType::Gpc0,
            3 => DataType::Gpc0Rate,
            4 => DataType::ConnCnt,
            5 => DataType::ConnRate,
            6 => DataType::ConnCur,
            7 => DataType::SessCnt,
            8 => DataType::SessRate,
            9 => DataType::HttpReqCnt,
            10 => DataType::HttpReqRate,
            11 => DataType::HttpErrCnt,
            12 => DataType::HttpErrRate,
            13 => DataType::BytesInCnt,
            14 => DataType::BytesInRate,
            15 => DataType::BytesOutCnt,
            16 => DataType::BytesOutRate,
            17 => DataType::Gpc1,
            18 => DataType::Gpc1Rate,
            19 => DataType::ServerKey,
            20 => DataType::HttpFailCnt,
            21 => DataType::HttpFailRate,
            22 => DataType::GptArray,
            23 => DataType::GpcArray,
            24 => DataType::GpcRateArray,
            25 => DataType::GlitchCnt,
            26 => DataType::GlitchRate,
            _ => return None,
        })
    }

    /// Whether this column is stored as a `(counter, period)` pair in the
    /// definition itself (every `*_rate` scalar column — the array columns
    /// are `Dict`-encoded and carry no counter/period of their own).
    pub fn is_delay(self) -> bool {
        matches!(
            self,
            DataType::Gpc0Rate
                | DataType::ConnRate
                | DataType::SessRate
                | DataType::HttpReqRate
                | DataType::HttpErrRate
                | DataType::BytesInRate
                | DataType::BytesOutRate
                | DataType::Gpc1Rate
                | DataType::HttpFailRate
                | DataType::GlitchRate
        )
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::ServerId => "server_id",
            DataType::Gpt0 => "gpt0",
            DataType::Gpc0 => "gpc0",
            DataType::Gpc0Rate => "gpc0_rate",
            DataType::ConnCnt => "conn_cnt",
            DataType::ConnRate => "conn_rate",
            DataType::ConnCur => "conn_cur",
            DataType::SessCnt => "sess_cnt",
            DataType::SessRate => "sess_rate",
            DataType::HttpReqCnt => "http_req_cnt",
            DataType::HttpReqRate => "http_req_rate",
            DataType::HttpErrCnt => "http_err_cnt",
            DataType::HttpErrRate => "http_err_rate",
            DataType::BytesInCnt => "bytes_in_cnt",
            DataType::BytesInRate => "bytes_in_rate",
            DataType::BytesOutCnt => "bytes_out_cnt",
            DataType::BytesOutRate => "bytes_out_rate",
            DataType::Gpc1 => "gpc1",
            DataType::Gpc1Rate => "gpc1_rate",
            DataType::ServerKey => "server_key",
            DataType::HttpFailCnt => "http_fail_cnt",
            DataType::HttpFailRate => "http_fail_rate",
            DataType::GptArray => "gpt[]",
            DataType::GpcArray => "gpc[]",
            DataType::GpcRateArray => "gpc_rate[]",
            DataType::GlitchCnt => "glitch_cnt",
            DataType::GlitchRate => "glitch_rate",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownDataType(pub u32);

impl fmt::Display for UnknownDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown data type bit: {}", self.0)
    }
}

impl std::error::Error for UnknownDataType {}

/// One column of a [`Definition`]: its type, and — only when
/// [`DataType::is_delay`] — the counter/period pair the definition itself
/// carries for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataTypeDefinition {
    pub data_type: DataType,
    pub counter: u64,
    pub period: u64,
}

/// A stick table's shape: its key, and the ordered list of extra data
/// columns each entry carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    pub stick_table_id: u64,
    pub name: String,
    pub key_type: KeyType,
    pub key_length: u64,
    pub data_types: Vec<DataTypeDefinition>,
    pub expiry: u64,
}

impl Definition {
    /// Decodes a `Definition` from `b`, returning the number of bytes
    /// consumed. `b` may carry trailing bytes belonging to a later message;
    /// only the prefix this definition occupies is read.
    pub fn unmarshal(b: &[u8]) -> Result<(Self, usize), PeersError> {
        let mut off = 0usize;

        let (stick_table_id, n) = decode_varint(&b[off..])?;
        off += n;

        let (name_length, n) = decode_varint(&b[off..])?;
        off += n;
        let name_length = name_length as usize;
        let name = String::from_utf8_lossy(&b[off..off + name_length]).into_owned();
        off += name_length;

        let (key_type, n) = decode_varint(&b[off..])?;
        off += n;
        let key_type = KeyType::from_u64(key_type)?;

        let (key_length, n) = decode_varint(&b[off..])?;
        off += n;

        let (data_types_bitmap, n) = decode_varint(&b[off..])?;
        off += n;

        let (expiry, n) = decode_varint(&b[off..])?;
        off += n;

        let mut data_types = Vec::new();
        for i in 0..64u32 {
            if (data_types_bitmap >> i) & 1 != 1 {
                continue;
            }

            let data_type = DataType::from_bit(i).ok_or(UnknownDataType(i))?;

            let mut d = DataTypeDefinition {
                data_type,
                counter: 0,
                period: 0,
            };

            if data_type.is_delay() {
                let (counter, n) = decode_varint(&b[off..])?;
                off += n;
                d.counter = counter;

                let (period, n) = decode_varint(&b[off..])?;
                off += n;
                d.period = period;
            }

            data_types.push(d);
        }

        Ok((
            Self {
                stick_table_id,
                name,
                key_type,
                key_length,
                data_types,
                expiry,
            },
            off,
        ))
    }
}

/// A stick-table key, typed per the owning [`Definition`]'s `key_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapKey {
    SignedInteger(i32),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    String(String),
    Binary(Vec<u8>),
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapKey::SignedInteger(v) => write!(f, "{v}"),
            MapKey::Ipv4(v) => write!(f, "{v}"),
            MapKey::Ipv6(v) => write!(f, "{v}"),
            MapKey::String(v) => write!(f, "{v}"),
            MapKey::Binary(v) => write!(f, "{v:?}"),
        }
    }
}

impl MapKey {
    fn unmarshal(key_type: KeyType, key_length: u64, b: &[u8]) -> Result<(Self, usize), PeersError> {
        match key_type {
            KeyType::SignedInteger => {
                let v = i32::from_be_bytes(b[..4].try_into().unwrap());
                Ok((MapKey::SignedInteger(v), 4))
            }
            KeyType::Ipv4Address => {
                let v = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
                Ok((MapKey::Ipv4(v), 4))
            }
            KeyType::Ipv6Address => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&b[..16]);
                Ok((MapKey::Ipv6(Ipv6Addr::from(octets)), 16))
            }
            KeyType::String => {
                let (len, n) = decode_varint(b)?;
                if len == 0 {
                    return Ok((MapKey::String(String::new()), n));
                }
                let len = len as usize;
                let s = String::from_utf8_lossy(&b[n..n + len]).into_owned();
                Ok((MapKey::String(s), n + len))
            }
            KeyType::Binary => {
                let len = key_length as usize;
                Ok((MapKey::Binary(b[..len].to_vec()), len))
            }
            other => Err(PeersError::UnknownKeyType(UnknownKeyType(other as u64))),
        }
    }
}

/// A stick-table entry's data column, typed per the owning [`Definition`]'s
/// column list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapData {
    /// `(current_tick, current_period, last_period)` — the rolling-window
    /// rate counters every `*_rate` column stores.
    Freq { current_tick: u64, current_period: u64, last_period: u64 },
    SignedInteger32(i64),
    UnsignedInteger32(u64),
    UnsignedInteger64(u64),
    Dict { id: u64, value: Vec<u8> },
}

impl fmt::Display for MapData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapData::Freq { current_tick, current_period, last_period } => {
                write!(f, "tick/cur/last: {current_tick}/{current_period}/{last_period}")
            }
            MapData::SignedInteger32(v) => write!(f, "{v}"),
            MapData::UnsignedInteger32(v) => write!(f, "{v}"),
            MapData::UnsignedInteger64(v) => write!(f, "{v}"),
            MapData::Dict { id, .. } if *id == 0 => write!(f, "no entry"),
            MapData::Dict { id, value } => write!(f, "{id}: {value:?}"),
        }
    }
}

impl MapData {
    fn unmarshal(data_type: DataType, b: &[u8]) -> Result<(Self, usize), PeersError> {
        match data_type {
            DataType::ServerId => {
                let (v, n) = decode_varint(b)?;
                Ok((MapData::SignedInteger32(v as i64), n))
            }
            DataType::ServerKey | DataType::GptArray | DataType::GpcArray | DataType::GpcRateArray => {
                let mut off = 0;
                let (length, n) = decode_varint(&b[off..])?;
                off += n;
                if length == 0 {
                    return Ok((MapData::Dict { id: 0, value: Vec::new() }, off));
                }

                let (id, n) = decode_varint(&b[off..])?;
                off += n;
                if length == 1 {
                    return Ok((MapData::Dict { id, value: Vec::new() }, off));
                }

                let (value_length, n) = decode_varint(&b[off..])?;
                off += n;
                if value_length == 0 {
                    return Ok((MapData::Dict { id, value: Vec::new() }, off));
                }

                let value_length = value_length as usize;
                let value = b[off..off + value_length].to_vec();
                off += value_length;
                Ok((MapData::Dict { id, value }, off))
            }
            dt if dt.is_delay() => {
                let mut off = 0;
                let (current_tick, n) = decode_varint(&b[off..])?;
                off += n;
                let (current_period, n) = decode_varint(&b[off..])?;
                off += n;
                let (last_period, n) = decode_varint(&b[off..])?;
                off += n;
                Ok((
                    MapData::Freq { current_tick, current_period, last_period },
                    off,
                ))
            }
            DataType::BytesInCnt | DataType::BytesOutCnt => {
                let (v, n) = decode_varint(b)?;
                Ok((MapData::UnsignedInteger64(v), n))
            }
            _ => {
                let (v, n) = decode_varint(b)?;
                Ok((MapData::UnsignedInteger32(v), n))
            }
        }
    }
}

/// A decoded stick-table entry update: the key and, in the owning
/// [`Definition`]'s column order, one value per column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryUpdate {
    pub local_update_id: u32,
    pub expiry: u32,
    pub key: MapKey,
    pub data: Vec<MapData>,
}

impl EntryUpdate {
    /// Decodes an entry update from `b` against `definition`, reading an
    /// explicit `local_update_id`/`expiry` only when the message type
    /// carries them (`with_local_update_id`/`with_expiry`); otherwise the
    /// caller is expected to have already set `fallback_local_update_id` to
    /// `previous + 1`.
    pub fn unmarshal(
        b: &[u8],
        definition: &Definition,
        with_local_update_id: bool,
        with_expiry: bool,
        fallback_local_update_id: u32,
    ) -> Result<(Self, usize), PeersError> {
        let mut off = 0usize;

        let local_update_id = if with_local_update_id {
            let v = u32::from_be_bytes(b[off..off + 4].try_into().unwrap());
            off += 4;
            v
        } else {
            fallback_local_update_id
        };

        let expiry = if with_expiry {
            let v = u32::from_be_bytes(b[off..off + 4].try_into().unwrap());
            off += 4;
            v
        } else {
            0
        };

        let (key, n) = MapKey::unmarshal(definition.key_type, definition.key_length, &b[off..])?;
        off += n;

        let mut data = Vec::with_capacity(definition.data_types.len());
        for dtd in &definition.data_types {
            let (value, n) = MapData::unmarshal(dtd.data_type, &b[off..])?;
            off += n;
            data.push(value);
        }

        Ok((
            Self {
                local_update_id,
                expiry,
                key,
                data,
            },
            off,
        ))
    }
}
