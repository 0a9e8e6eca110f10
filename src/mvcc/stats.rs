//! MVCC statistics
//!
//! Stats are additive per user key: the stats of a span are the sum of the
//! stats of its keys. Writes update a running total by subtracting the stats
//! of the touched key before the write and adding them after, both computed
//! at the same instant, which keeps incremental totals identical to a full
//! recomputation.
//!
//! Ages advance in whole seconds of wall time. `gc_bytes_age` accumulates
//! the non-live bytes of a key from the moment they stopped being live;
//! `intent_age` accumulates from the intent's timestamp.

use std::fmt;
use std::ops::{AddAssign, SubAssign};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hlc::NANOS_PER_SEC;
use crate::keys;
use crate::mvcc::key::{decode_mvcc_key, engine_span, key_upper_bound, MVCC_VERSION_TIMESTAMP_SIZE};
use crate::mvcc::meta::MvccMetadata;
use crate::hlc::Timestamp;
use crate::storage::Reader;

const VERSION_KEY_SIZE: i64 = MVCC_VERSION_TIMESTAMP_SIZE as i64;

/// Aggregate counters of a span of keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MvccStats {
    /// Nonzero if any contribution was estimated rather than computed.
    pub contains_estimates: i64,
    pub last_update_nanos: i64,
    pub intent_age: i64,
    pub gc_bytes_age: i64,
    pub live_bytes: i64,
    pub live_count: i64,
    pub key_bytes: i64,
    pub key_count: i64,
    pub val_bytes: i64,
    pub val_count: i64,
    pub intent_bytes: i64,
    pub intent_count: i64,
    pub sys_bytes: i64,
    pub sys_count: i64,
}

impl MvccStats {
    /// Bytes not live: shadowed versions, tombstones and deleted keys.
    pub fn gc_bytes(&self) -> i64 {
        self.key_bytes + self.val_bytes - self.live_bytes
    }

    /// Total bytes, user and system.
    pub fn total(&self) -> i64 {
        self.key_bytes + self.val_bytes + self.sys_bytes
    }

    /// Advance the age accumulators to `nanos`. Never moves backwards.
    pub fn age_to(&mut self, nanos: i64) {
        if nanos <= self.last_update_nanos {
            return;
        }
        let diff = nanos / NANOS_PER_SEC as i64 - self.last_update_nanos / NANOS_PER_SEC as i64;
        if diff > 0 {
            self.gc_bytes_age += self.gc_bytes() * diff;
            self.intent_age += self.intent_count * diff;
        }
        self.last_update_nanos = nanos;
    }

    /// Add `other`, first aging both sides to the later update time.
    pub fn add(&mut self, other: &MvccStats) {
        let mut other = *other;
        if self.last_update_nanos < other.last_update_nanos {
            self.age_to(other.last_update_nanos);
        } else {
            other.age_to(self.last_update_nanos);
        }
        self.contains_estimates += other.contains_estimates;
        self.intent_age += other.intent_age;
        self.gc_bytes_age += other.gc_bytes_age;
        self.live_bytes += other.live_bytes;
        self.live_count += other.live_count;
        self.key_bytes += other.key_bytes;
        self.key_count += other.key_count;
        self.val_bytes += other.val_bytes;
        self.val_count += other.val_count;
        self.intent_bytes += other.intent_bytes;
        self.intent_count += other.intent_count;
        self.sys_bytes += other.sys_bytes;
        self.sys_count += other.sys_count;
    }

    /// Subtract `other`, first aging both sides to the later update time.
    pub fn subtract(&mut self, other: &MvccStats) {
        let mut other = *other;
        if self.last_update_nanos < other.last_update_nanos {
            self.age_to(other.last_update_nanos);
        } else {
            other.age_to(self.last_update_nanos);
        }
        self.contains_estimates -= other.contains_estimates;
        self.intent_age -= other.intent_age;
        self.gc_bytes_age -= other.gc_bytes_age;
        self.live_bytes -= other.live_bytes;
        self.live_count -= other.live_count;
        self.key_bytes -= other.key_bytes;
        self.key_count -= other.key_count;
        self.val_bytes -= other.val_bytes;
        self.val_count -= other.val_count;
        self.intent_bytes -= other.intent_bytes;
        self.intent_count -= other.intent_count;
        self.sys_bytes -= other.sys_bytes;
        self.sys_count -= other.sys_count;
    }

    /// Counters equal, ignoring the update time.
    pub fn equal_counters(&self, other: &MvccStats) -> bool {
        let mut a = *self;
        let mut b = *other;
        a.age_to(b.last_update_nanos);
        b.age_to(a.last_update_nanos);
        a == b
    }

    /// Charge a system key/value pair written outside the MVCC write path.
    pub fn account_sys(&mut self, key_bytes: i64, val_bytes: i64) {
        self.sys_bytes += key_bytes + val_bytes;
        self.sys_count += 1;
    }
}

impl fmt::Display for MvccStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "last_update_nanos:{} intent_age:{} gc_bytes_age:{} live_bytes:{} live_count:{} \
             key_bytes:{} key_count:{} val_bytes:{} val_count:{} intent_bytes:{} \
             intent_count:{} sys_bytes:{} sys_count:{}",
            self.last_update_nanos,
            self.intent_age,
            self.gc_bytes_age,
            self.live_bytes,
            self.live_count,
            self.key_bytes,
            self.key_count,
            self.val_bytes,
            self.val_count,
            self.intent_bytes,
            self.intent_count,
            self.sys_bytes,
            self.sys_count
        )?;
        if self.contains_estimates != 0 {
            write!(f, " contains_estimates:{}", self.contains_estimates)?;
        }
        Ok(())
    }
}

impl AddAssign<&MvccStats> for MvccStats {
    fn add_assign(&mut self, rhs: &MvccStats) {
        self.add(rhs);
    }
}

impl SubAssign<&MvccStats> for MvccStats {
    fn sub_assign(&mut self, rhs: &MvccStats) {
        self.subtract(rhs);
    }
}

/// One stored version of a key.
#[derive(Debug, Clone, Copy)]
struct Version {
    timestamp: Timestamp,
    val_len: i64,
}

fn secs(nanos: i64) -> i64 {
    nanos / NANOS_PER_SEC as i64
}

/// Stats of a single user key given its metadata (with encoded length) and
/// versions, newest first.
fn stats_for_key(
    key: &[u8],
    meta: Option<(&MvccMetadata, i64)>,
    versions: &[Version],
    now: i64,
) -> MvccStats {
    let mut ms = MvccStats {
        last_update_nanos: now,
        ..Default::default()
    };
    let meta_key_size = key.len() as i64 + 1;
    let meta_val_size = meta.map(|(_, len)| len).unwrap_or(0);
    let sys = keys::is_local(key);

    if let Some((m, _)) = meta {
        if m.is_inline() {
            if sys {
                ms.account_sys(meta_key_size, meta_val_size);
            } else {
                ms.key_bytes = meta_key_size;
                ms.val_bytes = meta_val_size;
                ms.key_count = 1;
                ms.val_count = 1;
                ms.live_bytes = meta_key_size + meta_val_size;
                ms.live_count = 1;
            }
            return ms;
        }
    }
    if versions.is_empty() {
        if meta.is_some() {
            // Metadata without versions only arises mid-write; charge its bytes.
            if sys {
                ms.account_sys(meta_key_size, meta_val_size);
            } else {
                ms.key_bytes = meta_key_size;
                ms.val_bytes = meta_val_size;
                ms.key_count = 1;
            }
        }
        return ms;
    }

    let version_bytes: i64 = versions.iter().map(|v| VERSION_KEY_SIZE + v.val_len).sum();
    if sys {
        ms.sys_bytes = meta_key_size + meta_val_size + version_bytes;
        ms.sys_count = 1;
        return ms;
    }

    let n = versions.len() as i64;
    ms.key_count = 1;
    ms.key_bytes = meta_key_size + VERSION_KEY_SIZE * n;
    ms.val_count = n;
    ms.val_bytes = meta_val_size + versions.iter().map(|v| v.val_len).sum::<i64>();

    let newest = versions[0];
    if let Some((m, _)) = meta {
        if m.is_intent() {
            ms.intent_count = 1;
            ms.intent_bytes = VERSION_KEY_SIZE + newest.val_len;
            ms.intent_age = secs(now) - secs(m.timestamp.wall_time as i64);
        }
    }
    if newest.val_len > 0 {
        ms.live_count = 1;
        ms.live_bytes = meta_key_size + meta_val_size + VERSION_KEY_SIZE + newest.val_len;
    } else {
        let age = secs(now) - secs(newest.timestamp.wall_time as i64);
        ms.gc_bytes_age += (meta_key_size + meta_val_size + VERSION_KEY_SIZE) * age;
    }
    for pair in versions.windows(2) {
        let (newer, older) = (pair[0], pair[1]);
        let age = secs(now) - secs(newer.timestamp.wall_time as i64);
        ms.gc_bytes_age += (VERSION_KEY_SIZE + older.val_len) * age;
    }
    ms
}

/// Accumulates per-key stats over engine entries in key order.
struct StatsBuilder {
    now: i64,
    total: MvccStats,
    cur_key: Option<Vec<u8>>,
    meta: Option<(MvccMetadata, i64)>,
    versions: Vec<Version>,
}

impl StatsBuilder {
    fn new(now: i64) -> Self {
        Self {
            now,
            total: MvccStats {
                last_update_nanos: now,
                ..Default::default()
            },
            cur_key: None,
            meta: None,
            versions: Vec::new(),
        }
    }

    fn push(&mut self, engine_key: &[u8], value: &[u8]) -> Result<()> {
        let mk = decode_mvcc_key(engine_key)?;
        if self.cur_key.as_deref() != Some(mk.key.as_slice()) {
            self.flush();
            self.cur_key = Some(mk.key);
        }
        if mk.timestamp.is_empty() {
            self.meta = Some((MvccMetadata::decode(value)?, value.len() as i64));
        } else {
            self.versions.push(Version {
                timestamp: mk.timestamp,
                val_len: value.len() as i64,
            });
        }
        Ok(())
    }

    fn flush(&mut self) {
        if let Some(key) = self.cur_key.take() {
            let meta = self.meta.take();
            let ms = stats_for_key(
                &key,
                meta.as_ref().map(|(m, len)| (m, *len)),
                &self.versions,
                self.now,
            );
            self.total.add(&ms);
            self.versions.clear();
        }
    }

    fn finish(mut self) -> MvccStats {
        self.flush();
        self.total
    }
}

/// Recompute the stats of user keys in `[start, end)` as of `now`.
pub fn compute_stats<R: Reader + ?Sized>(
    reader: &R,
    start: &[u8],
    end: &[u8],
    now: i64,
) -> Result<MvccStats> {
    let (lower, upper) = engine_span(start, end);
    let mut builder = StatsBuilder::new(now);
    let mut err = None;
    reader.iterate(&lower, &upper, &mut |k, v| {
        if let Err(e) = builder.push(k, v) {
            err = Some(e);
            return Ok(false);
        }
        Ok(true)
    })?;
    if let Some(e) = err {
        return Err(e);
    }
    Ok(builder.finish())
}

/// Stats of the single user key `key` as of `now`.
pub fn key_stats<R: Reader + ?Sized>(reader: &R, key: &[u8], now: i64) -> Result<MvccStats> {
    let lower = crate::mvcc::key::encode_mvcc_key(key, Timestamp::ZERO);
    let upper = key_upper_bound(key);
    let mut builder = StatsBuilder::new(now);
    for (k, v) in reader.scan(&lower, &upper)? {
        builder.push(&k, &v)?;
    }
    Ok(builder.finish())
}

/// Runs `write` against `rw` and folds the resulting change of `key`'s stats
/// into `ms`. Without `ms` the write runs unaccounted.
pub(crate) fn with_key_stats<R, T>(
    rw: &mut R,
    ms: Option<&mut MvccStats>,
    key: &[u8],
    now: i64,
    write: impl FnOnce(&mut R) -> Result<T>,
) -> Result<T>
where
    R: Reader + ?Sized,
{
    let Some(ms) = ms else {
        return write(rw);
    };
    let now = now.max(ms.last_update_nanos);
    let before = key_stats(&*rw, key, now)?;
    let out = write(rw)?;
    let after = key_stats(&*rw, key, now)?;
    ms.age_to(now);
    ms.add(&after);
    ms.subtract(&before);
    Ok(out)
}
