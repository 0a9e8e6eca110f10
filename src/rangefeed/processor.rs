//! Rangefeed processor
//!
//! One task per processor consumes the event channel: logical ops from the
//! apply loop, closed timestamp updates and the results of its own
//! background tasks. It alone mutates the resolved timestamp, so every
//! checkpoint it publishes is ordered after the values it covers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::api::Span;
use crate::config::StoreConfig;
use crate::error::{Error, RangeFeedRetryReason, Result};
use crate::hlc::{Clock, Timestamp};
use crate::mvcc::LogicalOp;
use crate::rangefeed::filter::OpFilter;
use crate::rangefeed::registration::Registration;
use crate::rangefeed::registry::Registry;
use crate::rangefeed::resolved_ts::ResolvedTimestamp;
use crate::rangefeed::task::{init_resolved_ts_scan, txn_push_attempt, TxnPusher};
use crate::rangefeed::{EventSink, RangeFeedEvent};
use crate::storage::{Reader, Snapshot};
use crate::txn::TxnMeta;

pub struct ProcessorConfig {
    /// User key span of the range.
    pub span: Span,
    pub clock: Arc<dyn Clock>,
    /// Without a pusher, old intents are never pushed.
    pub txn_pusher: Option<Arc<dyn TxnPusher>>,
    pub push_interval: Duration,
    pub push_txns_age: Duration,
    pub event_chan_cap: usize,
    /// Zero blocks without limit.
    pub event_chan_timeout: Duration,
    pub buffer_size: usize,
    pub catch_up_scan_batch: usize,
}

impl ProcessorConfig {
    pub fn new(span: Span, clock: Arc<dyn Clock>, config: &StoreConfig) -> Self {
        Self {
            span,
            clock,
            txn_pusher: None,
            push_interval: config.push_interval,
            push_txns_age: config.push_txns_age,
            event_chan_cap: config.rangefeed_event_chan_cap,
            event_chan_timeout: config.rangefeed_event_chan_timeout,
            buffer_size: config.rangefeed_buffer_size,
            catch_up_scan_batch: config.catch_up_scan_batch,
        }
    }

    pub fn with_txn_pusher(mut self, pusher: Arc<dyn TxnPusher>) -> Self {
        self.txn_pusher = Some(pusher);
        self
    }
}

pub(crate) enum Event {
    Ops(Vec<LogicalOp>),
    ClosedTs(Timestamp),
    /// The initial intent scan is complete.
    InitRts,
    /// A registration was added; send it the current checkpoint.
    Register(Arc<Registration>),
    Sync(oneshot::Sender<()>),
    Stop(Error),
}

/// Handle to a running processor.
pub struct Processor {
    span: Span,
    event_tx: mpsc::Sender<Event>,
    event_chan_timeout: Duration,
    buffer_size: usize,
    catch_up_scan_batch: usize,
    registry: Arc<Mutex<Registry>>,
    stopper: CancellationToken,
}

impl Processor {
    /// Starts the processor task and its initial intent scan over `reader`,
    /// which must be consistent with every op later passed to
    /// [`consume_logical_ops`](Self::consume_logical_ops).
    pub fn start<R: Reader + Send + 'static>(config: ProcessorConfig, reader: R) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(config.event_chan_cap.max(1));
        let registry = Arc::new(Mutex::new(Registry::new()));
        let stopper = CancellationToken::new();

        let processor = Arc::new(Processor {
            span: config.span.clone(),
            event_tx: event_tx.clone(),
            event_chan_timeout: config.event_chan_timeout,
            buffer_size: config.buffer_size,
            catch_up_scan_batch: config.catch_up_scan_batch,
            registry: registry.clone(),
            stopper: stopper.clone(),
        });

        let task = ProcessorTask {
            span: config.span.clone(),
            rts: ResolvedTimestamp::new(),
            registry,
            stopper: stopper.clone(),
            clock: config.clock,
            txn_pusher: config.txn_pusher,
            push_interval: config.push_interval,
            push_txns_age: config.push_txns_age,
            push_in_flight: Arc::new(AtomicBool::new(false)),
            event_tx: event_tx.clone(),
        };
        tracing::info!(span = %config.span, "rangefeed processor started");
        tokio::spawn(task.run(event_rx));

        let span = config.span;
        tokio::spawn(async move {
            let result = tokio::select! {
                r = init_resolved_ts_scan(reader, &span, &event_tx) => r,
                _ = stopper.cancelled() => return,
            };
            let event = match result {
                Ok(()) => Event::InitRts,
                Err(e) => {
                    tracing::error!(%span, error = %e, "initial resolved timestamp scan failed");
                    Event::Stop(e.context("initial resolved timestamp scan failed"))
                }
            };
            let _ = event_tx.send(event).await;
        });

        processor
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn is_stopped(&self) -> bool {
        self.stopper.is_cancelled()
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a registration over `span` streaming values newer than
    /// `start_ts` to `sink`, after replaying `catchup` if given. The caller
    /// must hold off applying commands between taking the `catchup`
    /// snapshot and this call returning. The receiver yields the error that
    /// ends the registration.
    pub async fn register(
        &self,
        span: Span,
        start_ts: Timestamp,
        catchup: Option<Snapshot>,
        with_diff: bool,
        sink: Arc<dyn EventSink>,
    ) -> Result<oneshot::Receiver<Error>> {
        // Events queued before this point are covered by the catch-up scan.
        self.sync().await?;

        let (done_tx, done_rx) = oneshot::channel();
        let reg = {
            let mut registry = self.registry.lock();
            if self.is_stopped() {
                return Err(Error::Cancelled);
            }
            let id = registry.next_id();
            let reg = Arc::new(Registration::new(
                id,
                span,
                start_ts,
                catchup,
                with_diff,
                self.buffer_size,
                done_tx,
            ));
            registry.register(reg.clone());
            reg
        };
        tracing::debug!(registration = %reg, "rangefeed registration added");
        tokio::spawn(reg.clone().run_output_loop(
            sink,
            self.catch_up_scan_batch,
            Arc::downgrade(&self.registry),
        ));
        self.send_event(Event::Register(reg), Duration::ZERO).await?;
        Ok(done_rx)
    }

    /// Hands the logical ops of an applied command to the processor. Returns
    /// false if the processor did not accept them in time; the caller must
    /// then stop it.
    pub async fn consume_logical_ops(&self, ops: Vec<LogicalOp>) -> bool {
        if ops.is_empty() {
            return true;
        }
        self.send_event(Event::Ops(ops), self.event_chan_timeout)
            .await
            .is_ok()
    }

    /// Informs the processor of a new closed timestamp.
    pub async fn forward_closed_ts(&self, ts: Timestamp) -> bool {
        self.send_event(Event::ClosedTs(ts), self.event_chan_timeout)
            .await
            .is_ok()
    }

    /// Waits until every event sent so far has been processed.
    pub async fn sync(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_event(Event::Sync(tx), Duration::ZERO).await?;
        rx.await.map_err(|_| Error::Cancelled)
    }

    /// What the registrations want from the apply loop.
    pub fn filter(&self) -> OpFilter {
        self.registry.lock().new_filter()
    }

    /// Disconnects the registrations overlapping `span` with `err`.
    pub fn disconnect_span_with_err(&self, span: &Span, err: Error) {
        self.registry.lock().disconnect_span(span, err);
    }

    /// Stops the processor, disconnecting every registration with `err`.
    pub fn stop_with_err(&self, err: Error) {
        stop(&self.stopper, &self.registry, &self.span, err);
    }

    /// Stops the processor because its replica went away.
    pub fn stop(&self) {
        self.stop_with_err(Error::RangefeedRetry {
            reason: RangeFeedRetryReason::ReplicaRemoved,
        });
    }

    async fn send_event(&self, event: Event, timeout: Duration) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::Cancelled);
        }
        if timeout.is_zero() {
            return self
                .event_tx
                .send(event)
                .await
                .map_err(|_| Error::Cancelled);
        }
        match tokio::time::timeout(timeout, self.event_tx.send(event)).await {
            Ok(sent) => sent.map_err(|_| Error::Cancelled),
            Err(_) => {
                tracing::warn!(span = %self.span, ?timeout, "rangefeed processor event channel full");
                Err(Error::RangefeedRetry {
                    reason: RangeFeedRetryReason::SlowProcessor,
                })
            }
        }
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        self.stopper.cancel();
    }
}

fn stop(stopper: &CancellationToken, registry: &Mutex<Registry>, span: &Span, err: Error) {
    if stopper.is_cancelled() {
        return;
    }
    // Cancel before disconnecting so no registration can slip in between.
    stopper.cancel();
    tracing::info!(%span, error = %err, "rangefeed processor stopping");
    registry.lock().disconnect_all(err);
}

struct ProcessorTask {
    span: Span,
    rts: ResolvedTimestamp,
    registry: Arc<Mutex<Registry>>,
    stopper: CancellationToken,
    clock: Arc<dyn Clock>,
    txn_pusher: Option<Arc<dyn TxnPusher>>,
    push_interval: Duration,
    push_txns_age: Duration,
    push_in_flight: Arc<AtomicBool>,
    event_tx: mpsc::Sender<Event>,
}

impl ProcessorTask {
    async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        let period = self.push_interval.max(Duration::from_millis(1));
        let mut push_ticker = tokio::time::interval_at(Instant::now() + period, period);
        push_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let can_push = self.txn_pusher.is_some() && !self.push_interval.is_zero();

        loop {
            tokio::select! {
                _ = self.stopper.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if let Err(err) = self.handle(event) {
                        tracing::error!(span = %self.span, error = %err, "rangefeed processor failed");
                        stop(&self.stopper, &self.registry, &self.span, err);
                        break;
                    }
                }
                _ = push_ticker.tick(), if can_push => self.maybe_push_txns(),
            }
        }
        tracing::info!(span = %self.span, "rangefeed processor stopped");
    }

    fn handle(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Ops(ops) => {
                let mut advanced = false;
                for op in &ops {
                    advanced |= self.rts.consume_op(op)?;
                    self.publish_value(op)?;
                }
                if advanced {
                    self.publish_checkpoint();
                }
            }
            Event::ClosedTs(ts) => {
                if self.rts.forward_closed_ts(ts) {
                    self.publish_checkpoint();
                }
            }
            Event::InitRts => {
                tracing::debug!(
                    span = %self.span,
                    intents = self.rts.intent_queue().len(),
                    "resolved timestamp initialized"
                );
                if self.rts.init() {
                    self.publish_checkpoint();
                }
            }
            Event::Register(reg) => {
                if let Some(event) = self.checkpoint_event() {
                    reg.publish(&event);
                }
            }
            Event::Sync(done) => {
                let _ = done.send(());
            }
            Event::Stop(err) => return Err(err),
        }
        Ok(())
    }

    fn publish_value(&self, op: &LogicalOp) -> Result<()> {
        let (key, timestamp, value, prev_value) = match op {
            LogicalOp::WriteValue {
                key,
                timestamp,
                value,
                prev_value,
            }
            | LogicalOp::CommitIntent {
                key,
                timestamp,
                value,
                prev_value,
                ..
            } => (key, *timestamp, value, prev_value),
            _ => return Ok(()),
        };
        if !self.span.contains_key(key) {
            return Err(Error::assertion(format!(
                "value on {} outside rangefeed span {}",
                crate::keys::pretty(key),
                self.span
            )));
        }
        let mut value = value.clone();
        value.timestamp = timestamp;
        let event = RangeFeedEvent::value(key.clone(), value, prev_value.clone());
        self.registry
            .lock()
            .publish_to_overlapping(&Span::point(key.clone()), &event);
        Ok(())
    }

    fn checkpoint_event(&self) -> Option<RangeFeedEvent> {
        let resolved = self.rts.get().filter(|ts| !ts.is_empty())?;
        Some(RangeFeedEvent::checkpoint(self.span.clone(), resolved))
    }

    fn publish_checkpoint(&self) {
        if let Some(event) = self.checkpoint_event() {
            self.registry
                .lock()
                .publish_to_overlapping(&self.span, &event);
        }
    }

    fn maybe_push_txns(&self) {
        if !self.rts.is_init() || self.push_in_flight.load(Ordering::Acquire) {
            return;
        }
        let Some(pusher) = self.txn_pusher.clone() else {
            return;
        };
        let now = self.clock.now();
        let age = u64::try_from(self.push_txns_age.as_nanos()).unwrap_or(u64::MAX);
        let cutoff = Timestamp::from_wall(now.wall_time.saturating_sub(age));
        let txns: Vec<TxnMeta> = self
            .rts
            .intent_queue()
            .before(cutoff)
            .into_iter()
            .map(|t| TxnMeta {
                id: t.txn_id,
                key: t.txn_key,
                write_timestamp: t.timestamp,
                min_timestamp: t.txn_min_timestamp,
                ..Default::default()
            })
            .collect();
        if txns.is_empty() {
            return;
        }

        tracing::debug!(span = %self.span, txns = txns.len(), push_ts = %now, "pushing old intents");
        self.push_in_flight.store(true, Ordering::Release);
        let in_flight = self.push_in_flight.clone();
        let stopper = self.stopper.clone();
        let events = self.event_tx.clone();
        let span = self.span.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = txn_push_attempt(pusher, txns, now, &events) => {
                    if let Err(e) = result {
                        tracing::warn!(%span, error = %e, "pushing old intents failed");
                    }
                }
                _ = stopper.cancelled() => {}
            }
            in_flight.store(false, Ordering::Release);
        });
    }
}
