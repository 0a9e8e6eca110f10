//! Time series values
//!
//! A time series value holds samples at offsets from a start timestamp.
//! Merging two values combines their sample lists ordered by offset; a later
//! sample at an existing offset replaces the earlier one.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One aggregated sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesSample {
    /// Offset from the start timestamp in units of the sample duration.
    pub offset: i32,
    pub count: u32,
    pub sum: f64,
    pub max: Option<f64>,
    pub min: Option<f64>,
}

/// Samples for one source over one time slab.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InternalTimeSeriesData {
    pub start_timestamp_nanos: i64,
    pub sample_duration_nanos: i64,
    pub samples: Vec<TimeSeriesSample>,
}

impl InternalTimeSeriesData {
    /// Merge `other` into `self`. Fails if the slabs do not line up.
    pub fn merge(&mut self, other: InternalTimeSeriesData) -> Result<(), String> {
        if self.start_timestamp_nanos != other.start_timestamp_nanos
            || self.sample_duration_nanos != other.sample_duration_nanos
        {
            return Err(format!(
                "mismatched time series slabs: start {} / {} duration {} / {}",
                self.start_timestamp_nanos,
                other.start_timestamp_nanos,
                self.sample_duration_nanos,
                other.sample_duration_nanos
            ));
        }
        for sample in other.samples {
            match self.samples.binary_search_by_key(&sample.offset, |s| s.offset) {
                Ok(i) => self.samples[i] = sample,
                Err(i) => self.samples.insert(i, sample),
            }
        }
        Ok(())
    }

    /// Normalize sample order so merges of unsorted operands stay sorted.
    pub fn sort_samples(&mut self) {
        self.samples.sort_by_key(|s| s.offset);
    }
}

impl fmt::Display for InternalTimeSeriesData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "start={} duration={} samples=[",
            self.start_timestamp_nanos, self.sample_duration_nanos
        )?;
        for (i, s) in self.samples.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}:{}/{}", s.offset, s.count, s.sum)?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(offset: i32, sum: f64) -> TimeSeriesSample {
        TimeSeriesSample {
            offset,
            count: 1,
            sum,
            max: None,
            min: None,
        }
    }

    fn slab(samples: Vec<TimeSeriesSample>) -> InternalTimeSeriesData {
        InternalTimeSeriesData {
            start_timestamp_nanos: 0,
            sample_duration_nanos: 10,
            samples,
        }
    }

    #[test]
    fn test_merge_orders_and_replaces() {
        let mut a = slab(vec![sample(1, 1.0), sample(5, 5.0)]);
        a.merge(slab(vec![sample(3, 3.0), sample(5, 50.0)])).unwrap();
        let offsets: Vec<i32> = a.samples.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![1, 3, 5]);
        assert_eq!(a.samples[2].sum, 50.0);
    }

    #[test]
    fn test_merge_mismatch() {
        let mut a = slab(vec![]);
        let mut b = slab(vec![]);
        b.sample_duration_nanos = 20;
        assert!(a.merge(b).is_err());
    }
}
