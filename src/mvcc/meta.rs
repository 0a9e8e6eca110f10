//! MVCC metadata records
//!
//! A metadata record lives at the zero-timestamp key of a user key. It either
//! holds an inline value (no version history) or describes the write intent
//! whose provisional value sits at `timestamp`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::Result;
use crate::hlc::Timestamp;
use crate::mvcc::value::Value;
use crate::txn::TxnMeta;

/// A prior provisional value of an intent, kept for savepoint rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedValue {
    pub sequence: i32,
    pub value: Vec<u8>,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MvccMetadata {
    /// Owning transaction of the intent; `None` for inline values.
    pub txn: Option<TxnMeta>,
    /// Timestamp of the provisional value.
    pub timestamp: Timestamp,
    /// The provisional value is a deletion.
    pub deleted: bool,
    /// Size of the provisional version's key, for stats.
    pub key_bytes: i64,
    /// Size of the provisional version's value, for stats.
    pub val_bytes: i64,
    /// Inline value.
    pub raw_bytes: Option<Vec<u8>>,
    /// Earlier provisional values of this epoch, by sequence.
    pub intent_history: Vec<SequencedValue>,
    /// Latest timestamp at which an inline value was merged.
    pub merge_timestamp: Option<Timestamp>,
}

impl MvccMetadata {
    /// Metadata holding an inline value.
    pub fn inline(raw_bytes: Vec<u8>) -> Self {
        Self {
            raw_bytes: Some(raw_bytes),
            ..Default::default()
        }
    }

    pub fn is_inline(&self) -> bool {
        self.raw_bytes.is_some()
    }

    pub fn is_intent(&self) -> bool {
        self.txn.is_some()
    }

    /// The inline value, if any.
    pub fn inline_value(&self) -> Option<Value> {
        self.raw_bytes.as_ref().map(|raw| Value::from_raw(raw.clone()))
    }

    /// Most recent history entry at or below `sequence`.
    pub fn history_at(&self, sequence: i32) -> Option<&SequencedValue> {
        self.intent_history
            .iter()
            .rev()
            .find(|sv| sv.sequence <= sequence)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        codec::encode_record(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        codec::decode_record(bytes)
    }
}

impl fmt::Display for MvccMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(raw) = &self.raw_bytes {
            write!(f, "inline {}", Value::from_raw(raw.clone()).pretty_print())?;
            if let Some(ts) = self.merge_timestamp {
                write!(f, " mergeTS={ts}")?;
            }
            return Ok(());
        }
        match &self.txn {
            Some(txn) => write!(
                f,
                "txn={{{txn}}} ts={} del={} klen={} vlen={}",
                self.timestamp, self.deleted, self.key_bytes, self.val_bytes
            )?,
            None => write!(f, "ts={} del={}", self.timestamp, self.deleted)?,
        }
        if !self.intent_history.is_empty() {
            let seqs: Vec<String> = self
                .intent_history
                .iter()
                .map(|sv| sv.sequence.to_string())
                .collect();
            write!(f, " ih=[{}]", seqs.join(" "))?;
        }
        Ok(())
    }
}

impl fmt::Debug for MvccMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_lookup() {
        let meta = MvccMetadata {
            intent_history: vec![
                SequencedValue {
                    sequence: 1,
                    value: b"one".to_vec(),
                },
                SequencedValue {
                    sequence: 3,
                    value: b"three".to_vec(),
                },
            ],
            ..Default::default()
        };
        assert!(meta.history_at(0).is_none());
        assert_eq!(meta.history_at(2).unwrap().value, b"one");
        assert_eq!(meta.history_at(3).unwrap().value, b"three");
    }

    #[test]
    fn test_inline_encoding() {
        let meta = MvccMetadata::inline(Value::from_int(3).raw_bytes);
        let decoded = MvccMetadata::decode(&meta.encode().unwrap()).unwrap();
        assert!(decoded.is_inline());
        assert_eq!(decoded.inline_value().unwrap().get_int().unwrap(), 3);
    }
}
