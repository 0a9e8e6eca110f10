//! Record codec
//!
//! Every persisted or replicated record (descriptors, leases, metadata,
//! transaction records, Raft commands) goes through these two functions, so
//! the wire encoding lives in one place.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Serialize a record.
pub fn encode_record<T: Serialize + ?Sized>(record: &T) -> Result<Vec<u8>> {
    bincode::serialize(record).map_err(|e| Error::Codec(e.to_string()))
}

/// Deserialize a record, rejecting trailing bytes.
pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    use bincode::Options;
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
        .deserialize(bytes)
        .map_err(|e| Error::Codec(e.to_string()))
}

/// Size of a record's encoding.
pub fn encoded_size<T: Serialize + ?Sized>(record: &T) -> Result<u64> {
    bincode::serialized_size(record).map_err(|e| Error::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Rec {
        id: u64,
        name: String,
    }

    #[test]
    fn test_roundtrip_and_size() {
        let rec = Rec {
            id: 7,
            name: "r7".into(),
        };
        let bytes = encode_record(&rec).unwrap();
        assert_eq!(encoded_size(&rec).unwrap(), bytes.len() as u64);
        assert_eq!(decode_record::<Rec>(&bytes).unwrap(), rec);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode_record(&5u64).unwrap();
        bytes.push(0);
        assert!(matches!(decode_record::<u64>(&bytes), Err(Error::Codec(_))));
    }
}
