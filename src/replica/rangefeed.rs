//! Rangefeed attachment
//!
//! A replica starts its processor on the first registration and stops it
//! when the range splits, merges or goes away. Registration happens under
//! the apply lock so the catch-up snapshot and the live stream meet exactly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::api::{RangeId, Span};
use crate::error::{Error, RangeFeedRetryReason, Result};
use crate::hlc::{Clock, Timestamp};
use crate::keys;
use crate::rangefeed::{EventSink, Processor, ProcessorConfig};
use crate::replica::Replica;

/// Supplies the closed timestamp of each range.
pub trait ClosedTimestampSource: Send + Sync {
    /// Highest timestamp at which `range_id` accepts no more writes. Never
    /// regresses for a given range.
    fn closed_timestamp(&self, range_id: RangeId) -> Timestamp;
}

/// Closes every range a fixed lag behind the clock.
pub struct ClockClosedTimestamps {
    clock: Arc<dyn Clock>,
    lag: Duration,
}

impl ClockClosedTimestamps {
    pub fn new(clock: Arc<dyn Clock>, lag: Duration) -> Self {
        Self { clock, lag }
    }
}

impl ClosedTimestampSource for ClockClosedTimestamps {
    fn closed_timestamp(&self, _range_id: RangeId) -> Timestamp {
        let now = self.clock.now();
        Timestamp::from_wall(now.wall_time.saturating_sub(self.lag.as_nanos() as u64))
    }
}

impl Replica {
    /// Subscribes `sink` to committed values in `span` newer than
    /// `start_ts`, replaying history above `start_ts` first. The receiver
    /// yields the error that ends the subscription.
    pub async fn range_feed(
        self: &Arc<Self>,
        span: Span,
        start_ts: Timestamp,
        with_diff: bool,
        sink: Arc<dyn EventSink>,
    ) -> Result<oneshot::Receiver<Error>> {
        if self.is_destroyed() {
            return Err(Error::MergedRange {
                range_id: self.range_id,
            });
        }
        {
            let state = self.state.read();
            let addr = keys::addr_span(&span)?;
            if !state.desc.contains_key_range(&addr.key, &addr.end_key) {
                return Err(Error::RangeKeyMismatch {
                    requested_start: addr.key,
                    requested_end: addr.end_key,
                    desc: Some(Box::new(state.desc.clone())),
                });
            }
            if !state.gc_threshold.is_empty() && start_ts < state.gc_threshold {
                return Err(Error::BelowGcThreshold {
                    timestamp: start_ts,
                    threshold: state.gc_threshold,
                });
            }
        }

        let done = {
            let _apply = self.apply_lock.lock().await;
            let processor = self.get_or_start_processor()?;
            let catchup = self.engine.new_snapshot()?;
            processor
                .register(span.clone(), start_ts, Some(catchup), with_diff, sink)
                .await?
        };
        tracing::debug!(range_id = self.range_id, %span, %start_ts, with_diff, "rangefeed registered");
        self.handle_closed_timestamp_update().await;
        Ok(done)
    }

    /// Forwards the current closed timestamp to the processor, if any.
    pub async fn handle_closed_timestamp_update(&self) {
        let Some(processor) = self.processor() else {
            return;
        };
        let closed = self.closed_timestamp();
        if closed.is_empty() {
            return;
        }
        if !processor.forward_closed_ts(closed).await {
            self.stop_processor_if(
                &processor,
                Error::RangefeedRetry {
                    reason: RangeFeedRetryReason::SlowProcessor,
                },
            );
        }
    }

    /// The running processor, if any.
    pub fn processor(&self) -> Option<Arc<Processor>> {
        self.processor
            .lock()
            .as_ref()
            .filter(|p| !p.is_stopped())
            .cloned()
    }

    /// Callers hold the apply lock, so the initial scan sees exactly the
    /// commands applied before any op the processor receives.
    fn get_or_start_processor(&self) -> Result<Arc<Processor>> {
        let mut slot = self.processor.lock();
        if let Some(p) = slot.as_ref().filter(|p| !p.is_stopped()) {
            return Ok(p.clone());
        }
        let desc = self.state.read().desc.clone();
        let span = keys::user_data_span(&desc.start_key, &desc.end_key);
        let config = ProcessorConfig::new(span.clone(), self.clock.clone(), &self.config)
            .with_txn_pusher(self.store()?.rangefeed_txn_pusher());
        let processor = Processor::start(config, self.engine.new_snapshot()?);
        tracing::info!(range_id = self.range_id, %span, "rangefeed processor started");
        *slot = Some(processor.clone());
        Ok(processor)
    }

    pub(super) fn stop_processor(&self, err: Error) {
        if let Some(p) = self.processor.lock().take() {
            tracing::info!(range_id = self.range_id, reason = %err, "rangefeed processor stopped");
            p.stop_with_err(err);
        }
    }

    /// Stops `processor` if it is still the attached one.
    pub(super) fn stop_processor_if(&self, processor: &Arc<Processor>, err: Error) {
        let mut slot = self.processor.lock();
        if slot.as_ref().is_some_and(|p| Arc::ptr_eq(p, processor)) {
            *slot = None;
        }
        drop(slot);
        tracing::info!(range_id = self.range_id, reason = %err, "rangefeed processor stopped");
        processor.stop_with_err(err);
    }
}
