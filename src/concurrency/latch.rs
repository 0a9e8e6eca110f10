//! Latch manager
//!
//! Latches are acquired in arrival order: a request waits only for earlier
//! requests whose declared spans conflict with its own. Releasing a latch
//! (dropping its [`LatchGuard`]) wakes every waiter to re-check.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::api::Span;
use crate::hlc::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanAccess {
    ReadOnly,
    ReadWrite,
}

/// One declared span. `timestamp` is `None` for non-MVCC access, which
/// conflicts with any overlapping MVCC write and with MVCC reads when it
/// writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatchSpan {
    pub span: Span,
    pub access: SpanAccess,
    pub timestamp: Option<Timestamp>,
}

impl LatchSpan {
    fn is_write(&self) -> bool {
        self.access == SpanAccess::ReadWrite
    }

    fn conflicts_with(&self, other: &LatchSpan) -> bool {
        if !self.span.overlaps(&other.span) {
            return false;
        }
        if !self.is_write() && !other.is_write() {
            return false;
        }
        match (self.timestamp, other.timestamp) {
            (Some(a), Some(b)) => {
                if self.is_write() && other.is_write() {
                    return true;
                }
                // A read at `r` only waits on writes at or below `r`.
                let (read_ts, write_ts) = if self.is_write() { (b, a) } else { (a, b) };
                write_ts <= read_ts
            }
            _ => true,
        }
    }
}

/// The spans a command reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpanSet {
    spans: Vec<LatchSpan>,
}

impl SpanSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare MVCC access to `span` at `ts`.
    pub fn add_mvcc(&mut self, access: SpanAccess, span: Span, ts: Timestamp) {
        self.spans.push(LatchSpan {
            span,
            access,
            timestamp: Some(ts),
        });
    }

    /// Declare access to `span` that is not tied to a timestamp.
    pub fn add_non_mvcc(&mut self, access: SpanAccess, span: Span) {
        self.spans.push(LatchSpan {
            span,
            access,
            timestamp: None,
        });
    }

    pub fn read_only(&mut self, span: Span, ts: Timestamp) {
        self.add_mvcc(SpanAccess::ReadOnly, span, ts);
    }

    pub fn read_write(&mut self, span: Span, ts: Timestamp) {
        self.add_mvcc(SpanAccess::ReadWrite, span, ts);
    }

    pub fn non_mvcc_read(&mut self, span: Span) {
        self.add_non_mvcc(SpanAccess::ReadOnly, span);
    }

    pub fn non_mvcc_write(&mut self, span: Span) {
        self.add_non_mvcc(SpanAccess::ReadWrite, span);
    }

    pub fn extend(&mut self, other: SpanSet) {
        self.spans.extend(other.spans);
    }

    pub fn spans(&self) -> &[LatchSpan] {
        &self.spans
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// True if `key` was declared with at least `access`.
    pub fn covers(&self, access: SpanAccess, key: &[u8]) -> bool {
        self.spans.iter().any(|s| {
            (access == SpanAccess::ReadOnly || s.is_write()) && s.span.as_range().contains_key(key)
        })
    }

    fn conflicts_with(&self, other: &SpanSet) -> bool {
        self.spans
            .iter()
            .any(|a| other.spans.iter().any(|b| a.conflicts_with(b)))
    }
}

impl fmt::Display for SpanSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, s) in self.spans.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            let access = match s.access {
                SpanAccess::ReadOnly => "r",
                SpanAccess::ReadWrite => "w",
            };
            match s.timestamp {
                Some(ts) => write!(f, "{}:{}@{}", access, s.span, ts)?,
                None => write!(f, "{}:{}", access, s.span)?,
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct LatchState {
    next_id: u64,
    latches: BTreeMap<u64, SpanSet>,
}

/// Per-range table of held and pending latches.
#[derive(Default)]
pub struct LatchManager {
    state: Mutex<LatchState>,
    released: Notify,
}

impl LatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no earlier conflicting latch remains, then returns a guard
    /// holding `spans`. Dropping the future before it resolves withdraws the
    /// request.
    pub async fn acquire(self: &Arc<Self>, spans: SpanSet) -> LatchGuard {
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.latches.insert(id, spans);
            id
        };
        let guard = LatchGuard {
            manager: Arc::clone(self),
            id,
        };
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.has_earlier_conflict(id) {
                return guard;
            }
            notified.await;
        }
    }

    fn has_earlier_conflict(&self, id: u64) -> bool {
        let state = self.state.lock();
        let Some(mine) = state.latches.get(&id) else {
            return false;
        };
        state
            .latches
            .range(..id)
            .any(|(_, earlier)| earlier.conflicts_with(mine))
    }

    fn release(&self, id: u64) {
        self.state.lock().latches.remove(&id);
        self.released.notify_waiters();
    }

    /// Number of held or pending latch sets.
    pub fn len(&self) -> usize {
        self.state.lock().latches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held latches; released on drop.
pub struct LatchGuard {
    manager: Arc<LatchManager>,
    id: u64,
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        self.manager.release(self.id);
    }
}

impl fmt::Debug for LatchGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatchGuard").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ts(n: u64) -> Timestamp {
        Timestamp::from_wall(n)
    }

    fn write(key: &str, at: u64) -> SpanSet {
        let mut s = SpanSet::new();
        s.read_write(Span::point(key.as_bytes()), ts(at));
        s
    }

    fn read(key: &str, at: u64) -> SpanSet {
        let mut s = SpanSet::new();
        s.read_only(Span::point(key.as_bytes()), ts(at));
        s
    }

    #[test]
    fn test_conflict_rules() {
        assert!(write("a", 10).conflicts_with(&write("a", 20)));
        assert!(!write("a", 10).conflicts_with(&write("b", 10)));
        assert!(!read("a", 10).conflicts_with(&read("a", 10)));
        // Read below the write does not see it.
        assert!(!read("a", 5).conflicts_with(&write("a", 10)));
        assert!(read("a", 10).conflicts_with(&write("a", 10)));
        assert!(write("a", 10).conflicts_with(&read("a", 15)));

        let mut non_mvcc = SpanSet::new();
        non_mvcc.non_mvcc_write(Span::new(b"a".to_vec(), b"c".to_vec()));
        assert!(non_mvcc.conflicts_with(&read("b", 1)));
        assert!(non_mvcc.conflicts_with(&write("b", 1000)));

        let mut non_mvcc_read = SpanSet::new();
        non_mvcc_read.non_mvcc_read(Span::point(b"a".to_vec()));
        assert!(non_mvcc_read.conflicts_with(&write("a", 1)));
        assert!(!non_mvcc_read.conflicts_with(&read("a", 1)));
    }

    #[test]
    fn test_covers() {
        let mut s = SpanSet::new();
        s.read_only(Span::new(b"a".to_vec(), b"c".to_vec()), ts(1));
        s.read_write(Span::point(b"x".to_vec()), ts(1));
        assert!(s.covers(SpanAccess::ReadOnly, b"b"));
        assert!(!s.covers(SpanAccess::ReadWrite, b"b"));
        assert!(s.covers(SpanAccess::ReadWrite, b"x"));
        assert!(!s.covers(SpanAccess::ReadOnly, b"c"));
    }

    #[tokio::test]
    async fn test_conflicting_latch_waits_for_release() {
        let lm = Arc::new(LatchManager::new());
        let first = lm.acquire(write("k", 10)).await;

        let lm2 = Arc::clone(&lm);
        let waiter = tokio::spawn(async move {
            let _g = lm2.acquire(write("k", 20)).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // Non-conflicting requests proceed while the writer waits.
        let other = lm.acquire(write("j", 10)).await;
        drop(other);

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(lm.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_acquire_withdraws() {
        let lm = Arc::new(LatchManager::new());
        let held = lm.acquire(write("k", 10)).await;
        let pending = tokio::time::timeout(Duration::from_millis(10), lm.acquire(write("k", 10))).await;
        assert!(pending.is_err());
        assert_eq!(lm.len(), 1);
        drop(held);
        let _again = lm.acquire(write("k", 10)).await;
    }
}
