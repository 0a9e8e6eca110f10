//! Rangefeeds
//!
//! A [`Processor`] attaches to one replica and streams the logical MVCC
//! operations of applied commands to registrations overlapping the written
//! keys. Alongside values it publishes checkpoints carrying the range's
//! resolved timestamp: the highest timestamp below which no further value
//! will ever be emitted.
//!
//! ```text
//! apply loop ──ops──▶ event channel ──▶ processor task ──▶ registry
//!                                        │  resolved ts       │ publish
//!                                        │  intent queue      ▼
//!                                        └─ push ticker   registration buf ──▶ output task ──▶ sink
//! ```

mod catchup;
mod filter;
mod processor;
mod registration;
mod registry;
mod resolved_ts;
mod task;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::api::Span;
use crate::error::{Error, Result};
use crate::hlc::Timestamp;
use crate::mvcc::Value;

pub use catchup::catch_up_scan;
pub use filter::OpFilter;
pub use processor::{Processor, ProcessorConfig};
pub use registration::Registration;
pub use registry::Registry;
pub use resolved_ts::{ResolvedTimestamp, UnresolvedIntentQueue, UnresolvedTxn};
pub use task::TxnPusher;

/// A committed value, optionally with the value it replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeFeedValue {
    pub key: Vec<u8>,
    /// The new value; its timestamp is the commit timestamp, or zero for
    /// inline values.
    pub value: Value,
    /// The previous value of the key, if requested and one existed.
    pub prev_value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeFeedEvent {
    Value(RangeFeedValue),
    /// Every value in `span` at or below `resolved_ts` has been delivered.
    Checkpoint { span: Span, resolved_ts: Timestamp },
}

impl RangeFeedEvent {
    pub fn value(key: Vec<u8>, value: Value, prev_value: Option<Value>) -> Self {
        RangeFeedEvent::Value(RangeFeedValue {
            key,
            value,
            prev_value,
        })
    }

    pub fn checkpoint(span: Span, resolved_ts: Timestamp) -> Self {
        RangeFeedEvent::Checkpoint { span, resolved_ts }
    }
}

/// Consumer end of a registration.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers one event. An error disconnects the registration.
    async fn send(&self, event: RangeFeedEvent) -> Result<()>;

    /// Resolves once the consumer has gone away.
    async fn closed(&self);
}

#[async_trait]
impl EventSink for mpsc::Sender<RangeFeedEvent> {
    async fn send(&self, event: RangeFeedEvent) -> Result<()> {
        mpsc::Sender::send(self, event)
            .await
            .map_err(|_| Error::Cancelled)
    }

    async fn closed(&self) {
        mpsc::Sender::closed(self).await
    }
}
