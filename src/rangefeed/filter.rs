//! Operation filter
//!
//! A point-in-time summary of what the registrations of a processor want,
//! consulted by the apply loop before doing work on their behalf: reading
//! previous values for diffs and forwarding committed values.

use crate::api::Span;
use crate::hlc::Timestamp;

#[derive(Debug, Clone, Default)]
struct Interest {
    span: Span,
    start_ts: Timestamp,
    with_diff: bool,
}

/// Snapshot of registered spans with their start timestamps.
#[derive(Debug, Clone, Default)]
pub struct OpFilter {
    interests: Vec<Interest>,
}

impl OpFilter {
    pub(crate) fn push(&mut self, span: &Span, start_ts: Timestamp, with_diff: bool) {
        self.interests.push(Interest {
            span: span.as_range(),
            start_ts,
            with_diff,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.interests.is_empty()
    }

    /// True if a registration would be sent a value written at `ts` on `key`.
    pub fn needs_value(&self, key: &[u8], ts: Timestamp) -> bool {
        self.interests
            .iter()
            .any(|i| i.span.contains_key(key) && (ts.is_empty() || i.start_ts < ts))
    }

    /// True if a registration covering `key` asked for previous values.
    pub fn needs_prev_value(&self, key: &[u8]) -> bool {
        self.interests
            .iter()
            .any(|i| i.with_diff && i.span.contains_key(key))
    }
}
