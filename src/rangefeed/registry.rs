//! Registration registry
//!
//! Registrations ordered by span start key. Lookups of the registrations
//! overlapping a span walk the starts below the span's end.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::api::Span;
use crate::error::Error;
use crate::hlc::Timestamp;
use crate::rangefeed::filter::OpFilter;
use crate::rangefeed::registration::Registration;
use crate::rangefeed::RangeFeedEvent;

#[derive(Default)]
pub struct Registry {
    regs: BTreeMap<(Vec<u8>, u64), Arc<Registration>>,
    id_alloc: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        self.id_alloc += 1;
        self.id_alloc
    }

    pub(crate) fn register(&mut self, reg: Arc<Registration>) {
        self.regs.insert((reg.span().key.clone(), reg.id()), reg);
    }

    /// Drops a registration that has already been disconnected.
    pub(crate) fn unregister(&mut self, id: u64) {
        self.regs.retain(|(_, reg_id), _| *reg_id != id);
    }

    fn overlapping<'a>(&'a self, span: &'a Span) -> impl Iterator<Item = &'a Arc<Registration>> + 'a {
        let end = span.exclusive_end();
        self.regs
            .iter()
            .take_while(move |((start, _), _)| start.as_slice() < end.as_slice())
            .map(|(_, reg)| reg)
            .filter(move |reg| reg.span().overlaps(span))
    }

    /// Publishes `event` to every registration overlapping `span`. Values go
    /// only to registrations that started below the value's timestamp.
    pub(crate) fn publish_to_overlapping(&self, span: &Span, event: &RangeFeedEvent) {
        let min_ts = match event {
            RangeFeedEvent::Value(v) if !v.value.timestamp.is_empty() => v.value.timestamp,
            _ => Timestamp::MAX,
        };
        for reg in self.overlapping(span) {
            if reg.catchup_ts() < min_ts {
                reg.publish(event);
            }
        }
    }

    /// Disconnects and removes every registration overlapping `span`.
    pub(crate) fn disconnect_span(&mut self, span: &Span, err: Error) {
        let ids: Vec<(Vec<u8>, u64)> = self
            .overlapping(span)
            .map(|reg| (reg.span().key.clone(), reg.id()))
            .collect();
        for id in ids {
            if let Some(reg) = self.regs.remove(&id) {
                reg.disconnect(err.clone());
            }
        }
    }

    /// Disconnects and removes every registration.
    pub(crate) fn disconnect_all(&mut self, err: Error) {
        for (_, reg) in std::mem::take(&mut self.regs) {
            reg.disconnect(err.clone());
        }
    }

    /// What the current registrations want from the apply loop.
    pub fn new_filter(&self) -> OpFilter {
        let mut filter = OpFilter::default();
        for reg in self.regs.values() {
            filter.push(reg.span(), reg.catchup_ts(), reg.with_diff());
        }
        filter
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;
    use crate::error::RangeFeedRetryReason;
    use crate::mvcc::Value;

    fn reg(
        registry: &mut Registry,
        span: Span,
        start: u64,
    ) -> (Arc<Registration>, oneshot::Receiver<Error>) {
        let (tx, rx) = oneshot::channel();
        let r = Arc::new(Registration::new(
            registry.next_id(),
            span,
            Timestamp::from_wall(start),
            None,
            false,
            16,
            tx,
        ));
        registry.register(r.clone());
        (r, rx)
    }

    #[test]
    fn test_overlap_and_disconnect() {
        let mut registry = Registry::new();
        let (_ab, mut ab_done) = reg(&mut registry, Span::new("a", "b"), 0);
        let (_bd, mut bd_done) = reg(&mut registry, Span::new("b", "d"), 0);
        let (_x, mut x_done) = reg(&mut registry, Span::point("x"), 0);
        assert_eq!(registry.len(), 3);

        let hits: Vec<_> = registry
            .overlapping(&Span::new("a\x00", "c"))
            .map(|r| r.id())
            .collect();
        assert_eq!(hits, vec![1, 2]);
        assert_eq!(registry.overlapping(&Span::point("x")).count(), 1);
        assert_eq!(registry.overlapping(&Span::new("d", "x")).count(), 0);

        registry.disconnect_span(
            &Span::new("c", "z"),
            Error::RangefeedRetry {
                reason: RangeFeedRetryReason::RangeSplit,
            },
        );
        assert_eq!(registry.len(), 1);
        assert!(bd_done.try_recv().is_ok());
        assert!(x_done.try_recv().is_ok());
        assert!(ab_done.try_recv().is_err());

        registry.disconnect_all(Error::RangefeedRetry {
            reason: RangeFeedRetryReason::ReplicaRemoved,
        });
        assert!(registry.is_empty());
        assert!(ab_done.try_recv().is_ok());
    }

    #[test]
    fn test_filter_reflects_registrations() {
        let mut registry = Registry::new();
        reg(&mut registry, Span::new("a", "c"), 50);
        let filter = registry.new_filter();
        assert!(filter.needs_value(b"b", Timestamp::from_wall(51)));
        assert!(!filter.needs_value(b"b", Timestamp::from_wall(50)));
        assert!(!filter.needs_value(b"d", Timestamp::from_wall(51)));
    }

    #[test]
    fn test_publish_respects_start_ts() {
        let mut registry = Registry::new();
        let (early, _) = reg(&mut registry, Span::new("a", "z"), 10);
        let (late, _) = reg(&mut registry, Span::new("a", "z"), 100);
        let mut value = Value::from_string("v");
        value.timestamp = Timestamp::from_wall(50);
        registry.publish_to_overlapping(
            &Span::point("k"),
            &RangeFeedEvent::value(b"k".to_vec(), value, None),
        );
        registry.publish_to_overlapping(
            &Span::new("a", "z"),
            &RangeFeedEvent::checkpoint(Span::new("a", "z"), Timestamp::from_wall(40)),
        );
        let drained = |r: &Registration| {
            let mut rx = r.take_receiver_for_test();
            let mut n = 0;
            while rx.try_recv().is_ok() {
                n += 1;
            }
            n
        };
        assert_eq!(drained(&early), 2);
        assert_eq!(drained(&late), 1);
    }
}
