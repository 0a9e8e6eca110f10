//! Checksummed values
//!
//! ```text
//! +----------+-----+-----------+
//! | checksum | tag |  payload  |
//! | 4 bytes  | 1   |           |
//! +----------+-----+-----------+
//! ```
//!
//! The checksum is CRC32-IEEE over `key || tag || payload`, so a value can
//! only be verified together with its key. A zero checksum means "not set".
//! Empty raw bytes are a deletion tombstone.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{Error, Result};
use crate::hlc::Timestamp;
use crate::mvcc::timeseries::InternalTimeSeriesData;

const CHECKSUM_SIZE: usize = 4;
const TAG_POS: usize = CHECKSUM_SIZE;
const HEADER_SIZE: usize = CHECKSUM_SIZE + 1;

/// Payload type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    Unknown = 0,
    Int = 1,
    Float = 2,
    Bytes = 3,
    Time = 4,
    Decimal = 5,
    Interval = 6,
    String = 7,
    Uuid = 8,
    Tuple = 10,
    Array = 11,
    Timestamp = 12,
    /// A serialized structured record
    Record = 13,
    TimeSeries = 100,
}

impl ValueType {
    fn from_u8(tag: u8) -> ValueType {
        match tag {
            1 => ValueType::Int,
            2 => ValueType::Float,
            3 => ValueType::Bytes,
            4 => ValueType::Time,
            5 => ValueType::Decimal,
            6 => ValueType::Interval,
            7 => ValueType::String,
            8 => ValueType::Uuid,
            10 => ValueType::Tuple,
            11 => ValueType::Array,
            12 => ValueType::Timestamp,
            13 => ValueType::Record,
            100 => ValueType::TimeSeries,
            _ => ValueType::Unknown,
        }
    }
}

/// A stored value and the timestamp it was read at.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub raw_bytes: Vec<u8>,
    pub timestamp: Timestamp,
}

impl Value {
    fn with_payload(tag: ValueType, payload: &[u8]) -> Value {
        let mut raw_bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
        raw_bytes.extend_from_slice(&[0u8; CHECKSUM_SIZE]);
        raw_bytes.push(tag as u8);
        raw_bytes.extend_from_slice(payload);
        Value {
            raw_bytes,
            timestamp: Timestamp::ZERO,
        }
    }

    /// Wrap already encoded raw bytes.
    pub fn from_raw(raw_bytes: Vec<u8>) -> Value {
        Value {
            raw_bytes,
            timestamp: Timestamp::ZERO,
        }
    }

    /// A deletion tombstone
    pub fn tombstone() -> Value {
        Value::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Value {
        Value::with_payload(ValueType::Bytes, bytes)
    }

    pub fn from_string(s: &str) -> Value {
        Value::with_payload(ValueType::String, s.as_bytes())
    }

    pub fn from_int(i: i64) -> Value {
        Value::with_payload(ValueType::Int, &i.to_be_bytes())
    }

    pub fn from_float(f: f64) -> Value {
        Value::with_payload(ValueType::Float, &f.to_bits().to_be_bytes())
    }

    pub fn from_record<T: Serialize>(record: &T) -> Result<Value> {
        Ok(Value::with_payload(
            ValueType::Record,
            &codec::encode_record(record)?,
        ))
    }

    pub fn from_timeseries(data: &InternalTimeSeriesData) -> Result<Value> {
        Ok(Value::with_payload(
            ValueType::TimeSeries,
            &codec::encode_record(data)?,
        ))
    }

    pub fn is_tombstone(&self) -> bool {
        self.raw_bytes.is_empty()
    }

    pub fn tag(&self) -> ValueType {
        match self.raw_bytes.get(TAG_POS) {
            Some(&tag) => ValueType::from_u8(tag),
            None => ValueType::Unknown,
        }
    }

    /// Tag and payload, excluding the checksum.
    pub fn tag_and_data(&self) -> &[u8] {
        self.raw_bytes.get(TAG_POS..).unwrap_or(&[])
    }

    /// The payload, excluding checksum and tag.
    pub fn data_bytes(&self) -> &[u8] {
        self.raw_bytes.get(HEADER_SIZE..).unwrap_or(&[])
    }

    fn check_tag(&self, expected: ValueType) -> Result<()> {
        let tag = self.tag();
        if tag != expected {
            return Err(Error::Codec(format!(
                "value type is not {expected:?}: {tag:?}"
            )));
        }
        Ok(())
    }

    pub fn get_bytes(&self) -> Result<&[u8]> {
        if self.tag() == ValueType::String {
            return Ok(self.data_bytes());
        }
        self.check_tag(ValueType::Bytes)?;
        Ok(self.data_bytes())
    }

    pub fn get_int(&self) -> Result<i64> {
        self.check_tag(ValueType::Int)?;
        let data: [u8; 8] = self
            .data_bytes()
            .try_into()
            .map_err(|_| Error::Codec("int value must be 8 bytes".to_string()))?;
        Ok(i64::from_be_bytes(data))
    }

    pub fn get_float(&self) -> Result<f64> {
        self.check_tag(ValueType::Float)?;
        let data: [u8; 8] = self
            .data_bytes()
            .try_into()
            .map_err(|_| Error::Codec("float value must be 8 bytes".to_string()))?;
        Ok(f64::from_bits(u64::from_be_bytes(data)))
    }

    pub fn get_record<T: DeserializeOwned>(&self) -> Result<T> {
        self.check_tag(ValueType::Record)?;
        codec::decode_record(self.data_bytes())
    }

    pub fn get_timeseries(&self) -> Result<InternalTimeSeriesData> {
        self.check_tag(ValueType::TimeSeries)?;
        codec::decode_record(self.data_bytes())
    }

    /// Stored checksum, zero if unset.
    pub fn checksum(&self) -> u32 {
        match self.raw_bytes.get(..CHECKSUM_SIZE) {
            Some(b) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            None => 0,
        }
    }

    /// Checksum the value would carry under `key`.
    pub fn compute_checksum(&self, key: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(key);
        hasher.update(self.tag_and_data());
        let sum = hasher.finalize();
        // Zero is reserved for "unset".
        if sum == 0 {
            1
        } else {
            sum
        }
    }

    /// Stamp the checksum for `key`.
    pub fn init_checksum(&mut self, key: &[u8]) {
        if self.raw_bytes.len() < HEADER_SIZE {
            return;
        }
        let sum = self.compute_checksum(key);
        self.raw_bytes[..CHECKSUM_SIZE].copy_from_slice(&sum.to_be_bytes());
    }

    pub fn clear_checksum(&mut self) {
        if self.raw_bytes.len() >= CHECKSUM_SIZE {
            self.raw_bytes[..CHECKSUM_SIZE].copy_from_slice(&[0u8; CHECKSUM_SIZE]);
        }
    }

    /// Verify the checksum against `key`. Unset checksums and tombstones pass.
    pub fn verify(&self, key: &[u8]) -> Result<()> {
        if self.raw_bytes.is_empty() {
            return Ok(());
        }
        if self.raw_bytes.len() < HEADER_SIZE {
            return Err(Error::Codec(format!(
                "value of {} bytes shorter than header",
                self.raw_bytes.len()
            )));
        }
        let expected = self.checksum();
        if expected == 0 {
            return Ok(());
        }
        let computed = self.compute_checksum(key);
        if expected != computed {
            return Err(Error::InvalidChecksum {
                key: key.to_vec(),
                expected,
                computed,
            });
        }
        Ok(())
    }

    /// Human-readable rendering of the payload.
    pub fn pretty_print(&self) -> String {
        if self.is_tombstone() {
            return "<tombstone>".to_string();
        }
        match self.tag() {
            ValueType::Int => match self.get_int() {
                Ok(i) => format!("/INT/{i}"),
                Err(e) => format!("/INT/<err: {e}>"),
            },
            ValueType::Float => match self.get_float() {
                Ok(f) => format!("/FLOAT/{f}"),
                Err(e) => format!("/FLOAT/<err: {e}>"),
            },
            ValueType::Bytes => format!("/BYTES/{}", self.data_bytes().escape_ascii()),
            ValueType::String => format!("/STRING/{}", self.data_bytes().escape_ascii()),
            ValueType::TimeSeries => match self.get_timeseries() {
                Ok(ts) => format!("/TIMESERIES/{ts}"),
                Err(e) => format!("/TIMESERIES/<err: {e}>"),
            },
            tag => format!("/{tag:?}/{}", hex(self.data_bytes())),
        }
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pretty_print(), self.timestamp)
    }
}
