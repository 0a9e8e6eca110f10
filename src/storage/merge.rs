//! Merge operator
//!
//! Merge operands and merged values are encoded inline MVCC metadata records.
//! Time series payloads merge their samples by offset; any other payloads
//! concatenate. The merged value carries no checksum.

use crate::mvcc::timeseries::InternalTimeSeriesData;
use crate::mvcc::{MvccMetadata, Value, ValueType};
use crate::storage::error::{StorageError, StorageResult};

fn decode(bytes: &[u8]) -> StorageResult<(MvccMetadata, Value)> {
    let meta = MvccMetadata::decode(bytes).map_err(|e| StorageError::Merge(e.to_string()))?;
    let value = meta
        .inline_value()
        .ok_or_else(|| StorageError::Merge("merge operand is not an inline value".to_string()))?;
    Ok((meta, value))
}

fn timeseries(value: &Value) -> StorageResult<InternalTimeSeriesData> {
    let mut data = value
        .get_timeseries()
        .map_err(|e| StorageError::Merge(e.to_string()))?;
    data.sort_samples();
    Ok(data)
}

/// Combine `operand` with the `existing` merged value, if any.
pub fn merge_values(existing: Option<&[u8]>, operand: &[u8]) -> StorageResult<Vec<u8>> {
    let (op_meta, op_value) = decode(operand)?;
    let Some(existing) = existing else {
        if op_value.tag() == ValueType::TimeSeries {
            let data = timeseries(&op_value)?;
            let mut merged = Value::from_timeseries(&data)
                .map_err(|e| StorageError::Merge(e.to_string()))?;
            merged.clear_checksum();
            let meta = MvccMetadata {
                raw_bytes: Some(merged.raw_bytes),
                merge_timestamp: op_meta.merge_timestamp,
                ..Default::default()
            };
            return meta.encode().map_err(|e| StorageError::Merge(e.to_string()));
        }
        return Ok(operand.to_vec());
    };
    let (old_meta, old_value) = decode(existing)?;

    let merged = if old_value.tag() == ValueType::TimeSeries
        && op_value.tag() == ValueType::TimeSeries
    {
        let mut data = timeseries(&old_value)?;
        data.merge(timeseries(&op_value)?)
            .map_err(StorageError::Merge)?;
        Value::from_timeseries(&data).map_err(|e| StorageError::Merge(e.to_string()))?
    } else if old_value.tag() == ValueType::TimeSeries || op_value.tag() == ValueType::TimeSeries {
        return Err(StorageError::Merge(
            "cannot merge time series with non-time-series data".to_string(),
        ));
    } else {
        let mut data = old_value.data_bytes().to_vec();
        data.extend_from_slice(op_value.data_bytes());
        Value::from_bytes(&data)
    };

    let mut merged = merged;
    merged.clear_checksum();
    let merge_timestamp = match (old_meta.merge_timestamp, op_meta.merge_timestamp) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    let meta = MvccMetadata {
        raw_bytes: Some(merged.raw_bytes),
        merge_timestamp,
        ..Default::default()
    };
    meta.encode().map_err(|e| StorageError::Merge(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlc::Timestamp;
    use crate::mvcc::timeseries::TimeSeriesSample;

    fn operand(value: Value, ts: Option<Timestamp>) -> Vec<u8> {
        MvccMetadata {
            raw_bytes: Some(value.raw_bytes),
            merge_timestamp: ts,
            ..Default::default()
        }
        .encode()
        .unwrap()
    }

    fn sample(offset: i32, sum: f64) -> TimeSeriesSample {
        TimeSeriesSample {
            offset,
            count: 1,
            sum,
            max: None,
            min: None,
        }
    }

    #[test]
    fn test_bytes_concatenate() {
        let a = operand(Value::from_bytes(b"ab"), Some(Timestamp::from_wall(5)));
        let b = operand(Value::from_bytes(b"cd"), Some(Timestamp::from_wall(3)));
        let merged = merge_values(Some(&a), &b).unwrap();
        let meta = MvccMetadata::decode(&merged).unwrap();
        let value = meta.inline_value().unwrap();
        assert_eq!(value.data_bytes(), b"abcd");
        assert_eq!(value.checksum(), 0);
        assert_eq!(meta.merge_timestamp, Some(Timestamp::from_wall(5)));
    }

    #[test]
    fn test_timeseries_merge_by_offset() {
        let slab = |samples| InternalTimeSeriesData {
            start_timestamp_nanos: 0,
            sample_duration_nanos: 10,
            samples,
        };
        let a = operand(
            Value::from_timeseries(&slab(vec![sample(3, 1.0), sample(1, 1.0)])).unwrap(),
            None,
        );
        let b = operand(
            Value::from_timeseries(&slab(vec![sample(3, 9.0), sample(2, 2.0)])).unwrap(),
            None,
        );
        let merged = merge_values(Some(&a), &b).unwrap();
        let data = MvccMetadata::decode(&merged)
            .unwrap()
            .inline_value()
            .unwrap()
            .get_timeseries()
            .unwrap();
        let offsets: Vec<i32> = data.samples.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![1, 2, 3]);
        assert_eq!(data.samples[2].sum, 9.0);
    }

    #[test]
    fn test_mixed_kinds_rejected() {
        let a = operand(Value::from_bytes(b"x"), None);
        let b = operand(
            Value::from_timeseries(&InternalTimeSeriesData::default()).unwrap(),
            None,
        );
        assert!(matches!(
            merge_values(Some(&a), &b),
            Err(StorageError::Merge(_))
        ));
    }
}
