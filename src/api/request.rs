//! Request and response taxonomy
//!
//! A [`BatchRequest`] carries a [`Header`] and a list of [`Request`]s that
//! evaluate together against one range. Each request variant has a matching
//! [`Response`] variant.

use serde::{Deserialize, Serialize};

use crate::api::{
    ChangeReplicasTrigger, CommitTrigger, Lease, MergeTrigger, NodeId, RangeDescriptor, RangeId,
    ReplicaType, Span, SplitTrigger, StoreId,
};
use crate::hlc::Timestamp;
use crate::mvcc::{GcKey, Value};
use crate::txn::{Intent, SequencedWrite, Transaction, TxnMeta, TxnStatus};

/// How a read treats conflicting intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReadConsistency {
    #[default]
    Consistent,
    /// Return intents alongside committed values instead of failing.
    Inconsistent,
}

/// Shared parameters of a batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Header {
    pub timestamp: Timestamp,
    pub txn: Option<Transaction>,
    pub range_id: RangeId,
    pub read_consistency: ReadConsistency,
    /// Key limit across all span requests of the batch; zero is unlimited.
    pub max_span_request_keys: i64,
}

impl Header {
    pub fn txn_id(&self) -> Option<uuid::Uuid> {
        self.txn.as_ref().map(|t| t.id())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchRequest {
    pub header: Header,
    pub requests: Vec<Request>,
}

impl BatchRequest {
    pub fn new(range_id: RangeId, timestamp: Timestamp) -> Self {
        Self {
            header: Header {
                range_id,
                timestamp,
                ..Default::default()
            },
            requests: Vec::new(),
        }
    }

    pub fn with_txn(mut self, txn: Transaction) -> Self {
        self.header.timestamp = txn.read_timestamp;
        self.header.txn = Some(txn);
        self
    }

    pub fn add(mut self, request: Request) -> Self {
        self.requests.push(request);
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.requests.iter().all(Request::is_read_only)
    }

    pub fn is_admin(&self) -> bool {
        self.requests.len() == 1 && self.requests[0].is_admin()
    }

    pub fn is_single_request(&self) -> bool {
        self.requests.len() == 1
    }

    /// Smallest span covering every request.
    pub fn span(&self) -> Option<Span> {
        self.requests
            .iter()
            .map(|r| r.span().as_range())
            .reduce(|a, b| a.combine(&b))
    }

    /// Method names, for logging.
    pub fn summary(&self) -> String {
        let names: Vec<&str> = self.requests.iter().map(Request::method).collect();
        names.join(", ")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResponse {
    /// The transaction as updated by evaluation.
    pub txn: Option<Transaction>,
    pub timestamp: Timestamp,
    pub responses: Vec<Response>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushTxnType {
    /// Move the pushee's write timestamp to the push timestamp.
    Timestamp,
    /// Abort the pushee.
    Abort,
    /// Only check whether the pushee is finalized or expired.
    Touch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaChangeType {
    AddVoter,
    RemoveVoter,
    AddNonVoter,
    RemoveNonVoter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationChange {
    pub change_type: ReplicaChangeType,
    pub node_id: NodeId,
    pub store_id: StoreId,
}

impl ReplicationChange {
    pub fn replica_type(&self) -> ReplicaType {
        match self.change_type {
            ReplicaChangeType::AddVoter | ReplicaChangeType::RemoveVoter => ReplicaType::VoterFull,
            ReplicaChangeType::AddNonVoter | ReplicaChangeType::RemoveNonVoter => {
                ReplicaType::NonVoter
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: Vec<u8>,
    pub value: Value,
    /// Write at the zero timestamp with no history.
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalPutRequest {
    pub key: Vec<u8>,
    pub value: Value,
    pub exp_value: Option<Value>,
    pub allow_if_does_not_exist: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementRequest {
    pub key: Vec<u8>,
    pub increment: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRangeRequest {
    pub span: Span,
    pub return_keys: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearRangeRequest {
    pub span: Span,
}

/// Revert the listed intents in `span` regardless of their transactions'
/// status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearIntentRequest {
    pub span: Span,
    pub intents: Vec<Intent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveIntentRequest {
    pub key: Vec<u8>,
    pub intent_txn: TxnMeta,
    pub status: TxnStatus,
    /// Record an abort span entry when the transaction is aborted.
    pub poison: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveIntentRangeRequest {
    pub span: Span,
    pub intent_txn: TxnMeta,
    pub status: TxnStatus,
    pub poison: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryIntentRequest {
    pub key: Vec<u8>,
    pub txn: TxnMeta,
    pub error_if_missing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatTxnRequest {
    /// Anchor key of the transaction.
    pub key: Vec<u8>,
    pub now: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndTxnRequest {
    pub key: Vec<u8>,
    pub commit: bool,
    pub deadline: Option<Timestamp>,
    pub lock_spans: Vec<Span>,
    /// Non-empty for a parallel commit.
    pub in_flight_writes: Vec<SequencedWrite>,
    pub poison: bool,
    pub commit_trigger: Option<CommitTrigger>,
}

impl EndTxnRequest {
    pub fn commit(key: impl Into<Vec<u8>>, lock_spans: Vec<Span>) -> Self {
        Self {
            key: key.into(),
            commit: true,
            deadline: None,
            lock_spans,
            in_flight_writes: Vec::new(),
            poison: false,
            commit_trigger: None,
        }
    }

    pub fn abort(key: impl Into<Vec<u8>>, lock_spans: Vec<Span>) -> Self {
        Self {
            commit: false,
            ..Self::commit(key, lock_spans)
        }
    }

    pub fn split_trigger(&self) -> Option<&SplitTrigger> {
        match &self.commit_trigger {
            Some(CommitTrigger::Split(t)) => Some(t),
            _ => None,
        }
    }

    pub fn merge_trigger(&self) -> Option<&MergeTrigger> {
        match &self.commit_trigger {
            Some(CommitTrigger::Merge(t)) => Some(t),
            _ => None,
        }
    }

    pub fn change_replicas_trigger(&self) -> Option<&ChangeReplicasTrigger> {
        match &self.commit_trigger {
            Some(CommitTrigger::ChangeReplicas(t)) => Some(t),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushTxnRequest {
    /// Anchor key of the pushee.
    pub key: Vec<u8>,
    pub pusher_txn: Transaction,
    pub pushee_txn: TxnMeta,
    pub push_to: Timestamp,
    pub push_type: PushTxnType,
    /// Push regardless of priority and liveness.
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverTxnRequest {
    pub key: Vec<u8>,
    pub txn: TxnMeta,
    pub implicitly_committed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcRequest {
    pub span: Span,
    pub keys: Vec<GcKey>,
    pub threshold: Timestamp,
    pub txn_span_gc_threshold: Timestamp,
    /// Keys of finalized transaction records to delete.
    pub txn_records: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    pub key: Vec<u8>,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseInfoRequest {
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLeaseRequest {
    pub key: Vec<u8>,
    pub lease: Lease,
    pub prev_lease: Lease,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferLeaseRequest {
    pub key: Vec<u8>,
    pub lease: Lease,
    pub prev_lease: Lease,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminSplitRequest {
    /// Any key of the range to split.
    pub key: Vec<u8>,
    /// Explicit split key; found by size when absent.
    pub split_key: Option<Vec<u8>>,
    /// Range ID allocated for the right-hand side.
    pub new_range_id: RangeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminMergeRequest {
    /// Any key of the left-hand range.
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminChangeReplicasRequest {
    pub key: Vec<u8>,
    pub changes: Vec<ReplicationChange>,
    /// The descriptor the change was planned against.
    pub exp_desc: RangeDescriptor,
}

/// Ingest a pre-encoded batch into `data_span`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBatchRequest {
    pub span: Span,
    pub data_span: Span,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Get(GetRequest),
    Scan(ScanRequest),
    ReverseScan(ScanRequest),
    Put(PutRequest),
    ConditionalPut(ConditionalPutRequest),
    Increment(IncrementRequest),
    Delete(DeleteRequest),
    DeleteRange(DeleteRangeRequest),
    ClearRange(ClearRangeRequest),
    ClearIntent(ClearIntentRequest),
    ResolveIntent(ResolveIntentRequest),
    ResolveIntentRange(ResolveIntentRangeRequest),
    QueryIntent(QueryIntentRequest),
    HeartbeatTxn(HeartbeatTxnRequest),
    EndTxn(EndTxnRequest),
    PushTxn(PushTxnRequest),
    RecoverTxn(RecoverTxnRequest),
    Gc(GcRequest),
    Merge(MergeRequest),
    LeaseInfo(LeaseInfoRequest),
    RequestLease(RequestLeaseRequest),
    TransferLease(TransferLeaseRequest),
    AdminSplit(AdminSplitRequest),
    AdminMerge(AdminMergeRequest),
    AdminChangeReplicas(AdminChangeReplicasRequest),
    WriteBatch(WriteBatchRequest),
}

impl Request {
    pub fn get(key: impl Into<Vec<u8>>) -> Self {
        Request::Get(GetRequest { key: key.into() })
    }

    pub fn scan(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Request::Scan(ScanRequest {
            span: Span::new(start, end),
        })
    }

    pub fn reverse_scan(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Request::ReverseScan(ScanRequest {
            span: Span::new(start, end),
        })
    }

    pub fn put(key: impl Into<Vec<u8>>, value: Value) -> Self {
        Request::Put(PutRequest {
            key: key.into(),
            value,
            inline: false,
        })
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Request::Delete(DeleteRequest { key: key.into() })
    }

    pub fn method(&self) -> &'static str {
        match self {
            Request::Get(_) => "Get",
            Request::Scan(_) => "Scan",
            Request::ReverseScan(_) => "ReverseScan",
            Request::Put(_) => "Put",
            Request::ConditionalPut(_) => "ConditionalPut",
            Request::Increment(_) => "Increment",
            Request::Delete(_) => "Delete",
            Request::DeleteRange(_) => "DeleteRange",
            Request::ClearRange(_) => "ClearRange",
            Request::ClearIntent(_) => "ClearIntent",
            Request::ResolveIntent(_) => "ResolveIntent",
            Request::ResolveIntentRange(_) => "ResolveIntentRange",
            Request::QueryIntent(_) => "QueryIntent",
            Request::HeartbeatTxn(_) => "HeartbeatTxn",
            Request::EndTxn(_) => "EndTxn",
            Request::PushTxn(_) => "PushTxn",
            Request::RecoverTxn(_) => "RecoverTxn",
            Request::Gc(_) => "GC",
            Request::Merge(_) => "Merge",
            Request::LeaseInfo(_) => "LeaseInfo",
            Request::RequestLease(_) => "RequestLease",
            Request::TransferLease(_) => "TransferLease",
            Request::AdminSplit(_) => "AdminSplit",
            Request::AdminMerge(_) => "AdminMerge",
            Request::AdminChangeReplicas(_) => "AdminChangeReplicas",
            Request::WriteBatch(_) => "WriteBatch",
        }
    }

    /// The span the request addresses.
    pub fn span(&self) -> Span {
        match self {
            Request::Get(r) => Span::point(r.key.clone()),
            Request::Scan(r) | Request::ReverseScan(r) => r.span.clone(),
            Request::Put(r) => Span::point(r.key.clone()),
            Request::ConditionalPut(r) => Span::point(r.key.clone()),
            Request::Increment(r) => Span::point(r.key.clone()),
            Request::Delete(r) => Span::point(r.key.clone()),
            Request::DeleteRange(r) => r.span.clone(),
            Request::ClearRange(r) => r.span.clone(),
            Request::ClearIntent(r) => r.span.clone(),
            Request::ResolveIntent(r) => Span::point(r.key.clone()),
            Request::ResolveIntentRange(r) => r.span.clone(),
            Request::QueryIntent(r) => Span::point(r.key.clone()),
            Request::HeartbeatTxn(r) => Span::point(r.key.clone()),
            Request::EndTxn(r) => Span::point(r.key.clone()),
            Request::PushTxn(r) => Span::point(r.key.clone()),
            Request::RecoverTxn(r) => Span::point(r.key.clone()),
            Request::Gc(r) => r.span.clone(),
            Request::Merge(r) => Span::point(r.key.clone()),
            Request::LeaseInfo(r) => Span::point(r.key.clone()),
            Request::RequestLease(r) => Span::point(r.key.clone()),
            Request::TransferLease(r) => Span::point(r.key.clone()),
            Request::AdminSplit(r) => Span::point(r.key.clone()),
            Request::AdminMerge(r) => Span::point(r.key.clone()),
            Request::AdminChangeReplicas(r) => Span::point(r.key.clone()),
            Request::WriteBatch(r) => r.span.clone(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Request::Get(_)
                | Request::Scan(_)
                | Request::ReverseScan(_)
                | Request::QueryIntent(_)
                | Request::LeaseInfo(_)
        )
    }

    pub fn is_admin(&self) -> bool {
        matches!(
            self,
            Request::AdminSplit(_) | Request::AdminMerge(_) | Request::AdminChangeReplicas(_)
        )
    }

    /// Requests that operate on a transaction record or its intents on
    /// behalf of another party, and so ignore the batch transaction.
    pub fn is_intent_write(&self) -> bool {
        matches!(
            self,
            Request::ResolveIntent(_)
                | Request::ResolveIntentRange(_)
                | Request::ClearIntent(_)
                | Request::PushTxn(_)
                | Request::RecoverTxn(_)
        )
    }

    /// Reads that record their span in the timestamp cache.
    pub fn updates_read_cache(&self) -> bool {
        matches!(
            self,
            Request::Get(_)
                | Request::Scan(_)
                | Request::ReverseScan(_)
                | Request::ConditionalPut(_)
                | Request::Increment(_)
                | Request::DeleteRange(_)
                | Request::QueryIntent(_)
        )
    }

    /// Writes whose timestamp must be pushed above prior reads.
    pub fn applies_timestamp_cache(&self) -> bool {
        matches!(
            self,
            Request::Put(_)
                | Request::ConditionalPut(_)
                | Request::Increment(_)
                | Request::Delete(_)
                | Request::DeleteRange(_)
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanResponse {
    pub rows: Vec<(Vec<u8>, Value)>,
    /// Intents returned by an inconsistent read.
    pub intents: Vec<Intent>,
    pub resume_span: Option<Span>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndTxnResponse {
    pub txn: Option<Transaction>,
    /// Committed in one round trip with no intents left behind.
    pub one_phase_commit: bool,
    /// Lock spans still to resolve asynchronously.
    pub external_lock_spans: Vec<Span>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Get {
        value: Option<Value>,
        intent: Option<Intent>,
    },
    Scan(ScanResponse),
    ReverseScan(ScanResponse),
    Put,
    ConditionalPut,
    Increment {
        new_value: i64,
    },
    Delete,
    DeleteRange {
        keys: Vec<Vec<u8>>,
        resume_span: Option<Span>,
    },
    ClearRange,
    ClearIntent {
        reverted: i64,
        /// Listed intents not found on their keys.
        unknown_intents: Vec<Intent>,
        resume_span: Option<Span>,
    },
    ResolveIntent,
    ResolveIntentRange {
        resume_span: Option<Span>,
    },
    QueryIntent {
        found_intent: bool,
    },
    HeartbeatTxn {
        txn: Transaction,
    },
    EndTxn(EndTxnResponse),
    PushTxn {
        pushee_txn: Transaction,
    },
    RecoverTxn {
        recovered_txn: Transaction,
    },
    Gc,
    Merge,
    LeaseInfo {
        lease: Lease,
    },
    RequestLease,
    TransferLease,
    AdminSplit {
        left_desc: RangeDescriptor,
        right_desc: RangeDescriptor,
    },
    AdminMerge {
        desc: RangeDescriptor,
    },
    AdminChangeReplicas {
        desc: RangeDescriptor,
    },
    WriteBatch,
}

impl Response {
    pub fn method(&self) -> &'static str {
        match self {
            Response::Get { .. } => "Get",
            Response::Scan(_) => "Scan",
            Response::ReverseScan(_) => "ReverseScan",
            Response::Put => "Put",
            Response::ConditionalPut => "ConditionalPut",
            Response::Increment { .. } => "Increment",
            Response::Delete => "Delete",
            Response::DeleteRange { .. } => "DeleteRange",
            Response::ClearRange => "ClearRange",
            Response::ClearIntent { .. } => "ClearIntent",
            Response::ResolveIntent => "ResolveIntent",
            Response::ResolveIntentRange { .. } => "ResolveIntentRange",
            Response::QueryIntent { .. } => "QueryIntent",
            Response::HeartbeatTxn { .. } => "HeartbeatTxn",
            Response::EndTxn(_) => "EndTxn",
            Response::PushTxn { .. } => "PushTxn",
            Response::RecoverTxn { .. } => "RecoverTxn",
            Response::Gc => "GC",
            Response::Merge => "Merge",
            Response::LeaseInfo { .. } => "LeaseInfo",
            Response::RequestLease => "RequestLease",
            Response::TransferLease => "TransferLease",
            Response::AdminSplit { .. } => "AdminSplit",
            Response::AdminMerge { .. } => "AdminMerge",
            Response::AdminChangeReplicas { .. } => "AdminChangeReplicas",
            Response::WriteBatch => "WriteBatch",
        }
    }
}
