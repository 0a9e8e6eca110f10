//! Rangefeed registrations
//!
//! A registration is one subscriber. The processor publishes into its
//! bounded buffer without ever blocking; a separate output task runs the
//! catch-up scan and then moves buffered events to the subscriber's sink.
//! A full buffer marks the registration overflowed: events already buffered
//! are still delivered, then it is disconnected so the subscriber can
//! reconnect with a catch-up scan.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::api::Span;
use crate::error::{Error, RangeFeedRetryReason, Result};
use crate::hlc::Timestamp;
use crate::rangefeed::catchup::catch_up_scan;
use crate::rangefeed::registry::Registry;
use crate::rangefeed::{EventSink, RangeFeedEvent};
use crate::storage::Snapshot;

pub struct Registration {
    id: u64,
    span: Span,
    /// Exclusive start timestamp.
    catchup_ts: Timestamp,
    with_diff: bool,
    catchup: Mutex<Option<Snapshot>>,
    buf_tx: mpsc::Sender<RangeFeedEvent>,
    buf_rx: Mutex<Option<mpsc::Receiver<RangeFeedEvent>>>,
    overflowed: AtomicBool,
    cancel: CancellationToken,
    done: Mutex<Option<oneshot::Sender<Error>>>,
}

impl Registration {
    pub(crate) fn new(
        id: u64,
        span: Span,
        catchup_ts: Timestamp,
        catchup: Option<Snapshot>,
        with_diff: bool,
        buffer_size: usize,
        done: oneshot::Sender<Error>,
    ) -> Self {
        let (buf_tx, buf_rx) = mpsc::channel(buffer_size.max(1));
        Self {
            id,
            span,
            catchup_ts,
            with_diff,
            catchup: Mutex::new(catchup),
            buf_tx,
            buf_rx: Mutex::new(Some(buf_rx)),
            overflowed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            done: Mutex::new(Some(done)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn catchup_ts(&self) -> Timestamp {
        self.catchup_ts
    }

    pub fn with_diff(&self) -> bool {
        self.with_diff
    }

    pub fn is_disconnected(&self) -> bool {
        self.done.lock().is_none()
    }

    /// Buffers `event` for the output task. Never blocks.
    pub(crate) fn publish(&self, event: &RangeFeedEvent) {
        if self.overflowed.load(Ordering::Acquire) {
            return;
        }
        let event = match event {
            RangeFeedEvent::Value(v) if !self.with_diff && v.prev_value.is_some() => {
                let mut v = v.clone();
                v.prev_value = None;
                RangeFeedEvent::Value(v)
            }
            RangeFeedEvent::Checkpoint { span, resolved_ts } => {
                let Some(span) = span.intersect(&self.span) else {
                    return;
                };
                RangeFeedEvent::checkpoint(span, *resolved_ts)
            }
            other => other.clone(),
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = self.buf_tx.try_send(event) {
            tracing::debug!(registration = %self, "rangefeed buffer overflowed");
            self.overflowed.store(true, Ordering::Release);
        }
    }

    /// Ends the registration with `err`. Only the first call has an effect.
    pub(crate) fn disconnect(&self, err: Error) {
        let Some(done) = self.done.lock().take() else {
            return;
        };
        self.cancel.cancel();
        tracing::debug!(registration = %self, error = %err, "rangefeed registration disconnected");
        let _ = done.send(err);
    }

    #[cfg(test)]
    pub(crate) fn take_receiver_for_test(&self) -> mpsc::Receiver<RangeFeedEvent> {
        self.buf_rx.lock().take().unwrap()
    }

    /// Runs the catch-up scan, then forwards buffered events to `sink` until
    /// the registration ends.
    pub(crate) async fn run_output_loop(
        self: Arc<Self>,
        sink: Arc<dyn EventSink>,
        catch_up_batch: usize,
        registry: Weak<Mutex<Registry>>,
    ) {
        let err = match self.output_loop(sink.as_ref(), catch_up_batch).await {
            Ok(()) => Error::Cancelled,
            Err(e) => e,
        };
        self.disconnect(err);
        if let Some(registry) = registry.upgrade() {
            registry.lock().unregister(self.id);
        }
    }

    async fn output_loop(&self, sink: &dyn EventSink, catch_up_batch: usize) -> Result<()> {
        let catchup = self.catchup.lock().take();
        if let Some(snapshot) = catchup {
            catch_up_scan(
                snapshot,
                &self.span,
                self.catchup_ts,
                self.with_diff,
                catch_up_batch,
                &self.cancel,
                sink,
            )
            .await
            .map_err(|e| {
                tracing::error!(registration = %self, error = %e, "catch-up scan failed");
                e.context("catch-up scan failed")
            })?;
        }

        let Some(mut rx) = self.buf_rx.lock().take() else {
            return Err(Error::assertion("registration output loop started twice"));
        };
        loop {
            if self.overflowed.load(Ordering::Acquire) {
                while let Ok(event) = rx.try_recv() {
                    sink.send(event).await?;
                }
                return Err(Error::RangefeedRetry {
                    reason: RangeFeedRetryReason::BufferCapacityExceeded,
                });
            }
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => sink.send(event).await?,
                    None => return Err(Error::Cancelled),
                },
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = sink.closed() => return Err(Error::Cancelled),
            }
        }
    }
}

impl fmt::Display for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} @ {}+]", self.span, self.catchup_ts)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mvcc::Value;

    fn value_event(key: &str, wall: u64) -> RangeFeedEvent {
        let mut value = Value::from_string("v");
        value.timestamp = Timestamp::from_wall(wall);
        RangeFeedEvent::value(key.as_bytes().to_vec(), value, Some(Value::from_string("p")))
    }

    #[tokio::test]
    async fn test_publish_and_deliver() {
        let (done_tx, done_rx) = oneshot::channel();
        let reg = Arc::new(Registration::new(
            1,
            Span::new("a", "m"),
            Timestamp::from_wall(10),
            None,
            false,
            8,
            done_tx,
        ));
        let (tx, mut rx) = mpsc::channel(8);
        let sink: Arc<dyn EventSink> = Arc::new(tx);
        let task = tokio::spawn(reg.clone().run_output_loop(sink, 10, Weak::new()));

        reg.publish(&value_event("b", 20));
        reg.publish(&RangeFeedEvent::checkpoint(
            Span::new("a", "z"),
            Timestamp::from_wall(15),
        ));

        match rx.recv().await.unwrap() {
            RangeFeedEvent::Value(v) => assert!(v.prev_value.is_none()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            rx.recv().await.unwrap(),
            RangeFeedEvent::checkpoint(Span::new("a", "m"), Timestamp::from_wall(15))
        );

        reg.disconnect(Error::RangefeedRetry {
            reason: RangeFeedRetryReason::RangeSplit,
        });
        task.await.unwrap();
        assert!(matches!(
            done_rx.await.unwrap(),
            Error::RangefeedRetry {
                reason: RangeFeedRetryReason::RangeSplit
            }
        ));
    }

    #[tokio::test]
    async fn test_overflow_drains_then_disconnects() {
        let (done_tx, done_rx) = oneshot::channel();
        let reg = Arc::new(Registration::new(
            1,
            Span::new("a", "z"),
            Timestamp::ZERO,
            None,
            true,
            2,
            done_tx,
        ));
        for wall in 1..=3 {
            reg.publish(&value_event("k", wall));
        }

        let (tx, mut rx) = mpsc::channel(8);
        let sink: Arc<dyn EventSink> = Arc::new(tx);
        tokio::spawn(reg.clone().run_output_loop(sink, 10, Weak::new()));

        let err = tokio::time::timeout(Duration::from_secs(5), done_rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            err,
            Error::RangefeedRetry {
                reason: RangeFeedRetryReason::BufferCapacityExceeded
            }
        ));
        let mut delivered = 0;
        while rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, 2);
    }

    #[tokio::test]
    async fn test_closed_sink_disconnects() {
        let (done_tx, done_rx) = oneshot::channel();
        let reg = Arc::new(Registration::new(
            1,
            Span::new("a", "z"),
            Timestamp::ZERO,
            None,
            false,
            4,
            done_tx,
        ));
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink: Arc<dyn EventSink> = Arc::new(tx);
        reg.clone().run_output_loop(sink, 10, Weak::new()).await;
        assert!(matches!(done_rx.await.unwrap(), Error::Cancelled));
        assert!(reg.is_disconnected());
    }
}
