//! Request concurrency control
//!
//! Commands declare the spans they touch as a [`SpanSet`] and hold latches
//! over them for the duration of evaluation. The [`TimestampCache`] remembers
//! the highest timestamp at which each span was read so later writes can be
//! pushed above it.

mod latch;
mod tscache;

pub use latch::{LatchGuard, LatchManager, LatchSpan, SpanAccess, SpanSet};
pub use tscache::{TimestampCache, DEFAULT_TSCACHE_CAPACITY};
