//! Store tuning knobs
//!
//! None of these affect correctness. Defaults are the documented values;
//! [`StoreConfig::from_env`] overrides them from `RANGEDB_*` variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::stateloader::{ClusterVersion, VERSION_RANGE_APPLIED_STATE_KEY};

/// Default capacity of a rangefeed registration's event buffer.
pub const DEFAULT_RANGEFEED_BUFFER_SIZE: usize = 4096;

/// Default number of intents resolved synchronously by an ending transaction.
pub const DEFAULT_INTENT_RESOLUTION_BATCH: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Per-registration buffer of the rangefeed output loop.
    pub rangefeed_buffer_size: usize,
    /// Capacity of a rangefeed processor's input channel.
    pub rangefeed_event_chan_cap: usize,
    /// How long the apply loop waits on a full processor channel before
    /// disconnecting the processor.
    pub rangefeed_event_chan_timeout: Duration,
    /// Interval between intent-age push attempts.
    pub push_interval: Duration,
    /// Age after which an intent blocking the resolved timestamp is pushed.
    pub push_txns_age: Duration,
    /// Keys per catch-up scan step between cancellation checks.
    pub catch_up_scan_batch: usize,
    /// Intents resolved synchronously by an ending transaction; the rest are
    /// resolved asynchronously.
    pub intent_resolution_batch: usize,
    /// A transaction not heartbeated for this long may be aborted by any
    /// pusher.
    pub txn_liveness_threshold: Duration,
    /// Timestamp cache entries kept before rotating into the low-water mark.
    pub tscache_capacity: usize,
    /// Version gating on-disk representations of new replicas.
    pub cluster_version: ClusterVersion,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            rangefeed_buffer_size: DEFAULT_RANGEFEED_BUFFER_SIZE,
            rangefeed_event_chan_cap: 4096,
            rangefeed_event_chan_timeout: Duration::from_millis(50),
            push_interval: Duration::from_secs(10),
            push_txns_age: Duration::from_secs(10),
            catch_up_scan_batch: 100,
            intent_resolution_batch: DEFAULT_INTENT_RESOLUTION_BATCH,
            txn_liveness_threshold: Duration::from_secs(5),
            tscache_capacity: crate::concurrency::DEFAULT_TSCACHE_CAPACITY,
            cluster_version: VERSION_RANGE_APPLIED_STATE_KEY,
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by any `RANGEDB_*` variables that are set and
    /// parse. Durations are given in milliseconds.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        override_with(&mut cfg.rangefeed_buffer_size, "RANGEDB_RANGEFEED_BUFFER_SIZE");
        override_with(&mut cfg.rangefeed_event_chan_cap, "RANGEDB_RANGEFEED_EVENT_CHAN_CAP");
        override_millis(
            &mut cfg.rangefeed_event_chan_timeout,
            "RANGEDB_RANGEFEED_EVENT_CHAN_TIMEOUT_MS",
        );
        override_millis(&mut cfg.push_interval, "RANGEDB_PUSH_INTERVAL_MS");
        override_millis(&mut cfg.push_txns_age, "RANGEDB_PUSH_TXNS_AGE_MS");
        override_with(&mut cfg.catch_up_scan_batch, "RANGEDB_CATCH_UP_SCAN_BATCH");
        override_with(&mut cfg.intent_resolution_batch, "RANGEDB_INTENT_RESOLUTION_BATCH");
        override_millis(&mut cfg.txn_liveness_threshold, "RANGEDB_TXN_LIVENESS_THRESHOLD_MS");
        override_with(&mut cfg.tscache_capacity, "RANGEDB_TSCACHE_CAPACITY");
        cfg
    }

    /// Alias of `intent_resolution_batch`.
    pub fn max_intent_resolution_keys(&self) -> usize {
        self.intent_resolution_batch
    }
}

fn override_with<T: FromStr>(field: &mut T, var: &str) {
    let Ok(raw) = env::var(var) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *field = v,
        Err(_) => tracing::warn!(var, value = %raw, "ignoring unparseable config override"),
    }
}

fn override_millis(field: &mut Duration, var: &str) {
    let mut millis = field.as_millis() as u64;
    override_with(&mut millis, var);
    *field = Duration::from_millis(millis);
}
