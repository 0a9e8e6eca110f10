//! Records and requests exchanged with a range
//!
//! Defines the key span type, the replicated range records (descriptor,
//! lease, Raft state, commit triggers) and the batch request/response
//! taxonomy evaluated by the batch evaluator.

mod data;
mod request;
mod span;

pub use data::{
    ChangeReplicasTrigger, CommitTrigger, HardState, Lease, MergeTrigger, RaftTombstone,
    RaftTruncatedState, RangeAppliedState, RangeDescriptor, ReplicaDescriptor, ReplicaType,
    SplitTrigger, TruncatedStateType,
};
pub use request::{
    AdminChangeReplicasRequest, AdminMergeRequest, AdminSplitRequest, BatchRequest, BatchResponse,
    ClearIntentRequest, ClearRangeRequest, ConditionalPutRequest, DeleteRangeRequest,
    DeleteRequest, EndTxnRequest, EndTxnResponse, GcRequest, GetRequest, Header,
    HeartbeatTxnRequest, IncrementRequest, LeaseInfoRequest, MergeRequest, PushTxnRequest,
    PushTxnType, PutRequest, QueryIntentRequest, ReadConsistency, RecoverTxnRequest,
    ReplicaChangeType, ReplicationChange, Request, RequestLeaseRequest, ResolveIntentRangeRequest,
    ResolveIntentRequest, Response, ScanRequest, ScanResponse, TransferLeaseRequest,
    WriteBatchRequest,
};
pub use span::{key_next, merge_spans, Span};

/// Range identifier
pub type RangeId = u64;

/// Node identifier
pub type NodeId = u64;

/// Store identifier
pub type StoreId = u64;

/// Replica identifier within a range
pub type ReplicaId = u64;
