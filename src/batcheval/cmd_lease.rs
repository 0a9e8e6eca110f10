//! Lease acquisition and transfer

use crate::api::{Lease, RequestLeaseRequest, Response, TransferLeaseRequest};
use crate::batcheval::{CommandArgs, EvalResult};
use crate::error::{Error, Result};
use crate::mvcc::MvccStats;
use crate::stateloader::StateLoader;
use crate::storage::ReadWriter;

fn rejected(message: impl Into<String>, requested: &Lease, existing: &Lease) -> Error {
    Error::LeaseRejected {
        message: message.into(),
        requested: Box::new(requested.clone()),
        existing: Box::new(existing.clone()),
    }
}

/// Acquires or extends the lease. A different holder may only take over
/// once the previous lease no longer covers the new lease's start.
pub(super) fn request_lease<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    args: &CommandArgs<'_>,
    req: &RequestLeaseRequest,
    ms: &mut MvccStats,
) -> Result<(Response, EvalResult)> {
    let prev = &args.ctx.state.lease;
    let mut lease = req.lease.clone();
    let is_extension = !prev.is_empty() && prev.replica.store_id == lease.replica.store_id;
    if is_extension {
        // An extension keeps the original start so the holder's timestamp
        // cache floor stays put.
        lease.start = prev.start;
    } else if prev.covers(lease.start) {
        return Err(rejected(
            "requested lease overlaps previous lease",
            &req.lease,
            prev,
        ));
    }
    eval_new_lease(rw, args, ms, lease, false)
}

/// Hands the lease to another replica. The current holder has already
/// stopped serving at the transfer's start.
pub(super) fn transfer_lease<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    args: &CommandArgs<'_>,
    req: &TransferLeaseRequest,
    ms: &mut MvccStats,
) -> Result<(Response, EvalResult)> {
    let prev = &args.ctx.state.lease;
    if !req.prev_lease.equivalent(prev) {
        return Err(rejected("lease was updated concurrently", &req.lease, prev));
    }
    eval_new_lease(rw, args, ms, req.lease.clone(), true)
}

fn eval_new_lease<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    args: &CommandArgs<'_>,
    ms: &mut MvccStats,
    mut lease: Lease,
    is_transfer: bool,
) -> Result<(Response, EvalResult)> {
    if args.txn().is_some() {
        return Err(Error::InvalidArgument(
            "lease commands cannot be transactional".to_string(),
        ));
    }
    let prev = &args.ctx.state.lease;
    if let Some(exp) = lease.expiration {
        if exp <= lease.start {
            return Err(rejected("lease expiration is not after its start", &lease, prev));
        }
    }
    let desc = args.ctx.desc();
    match desc.replica_for_store(lease.replica.store_id) {
        Some(r) if r.replica_id == lease.replica.replica_id && r.replica_type.is_voter() => {}
        Some(_) => {
            return Err(rejected(
                "replica cannot hold the lease",
                &lease,
                prev,
            ));
        }
        None => {
            return Err(rejected(
                format!("replica {} not found in {}", lease.replica, desc),
                &lease,
                prev,
            ));
        }
    }

    lease.sequence = if prev.equivalent(&lease) {
        prev.sequence
    } else {
        prev.sequence + 1
    };
    StateLoader::new(desc.range_id).set_lease(rw, Some(&mut *ms), &lease)?;

    if lease.sequence != prev.sequence {
        tracing::info!(
            range_id = desc.range_id,
            prev = %prev,
            lease = %lease,
            is_transfer,
            "new lease"
        );
    }
    let mut res = EvalResult::default();
    res.replicated.lease = Some(lease);
    let resp = if is_transfer {
        Response::TransferLease
    } else {
        Response::RequestLease
    };
    Ok((resp, res))
}

#[cfg(test)]
mod tests {
    use crate::api::{Lease, ReplicaDescriptor, ReplicaType, Request, RequestLeaseRequest, Response, TransferLeaseRequest};
    use crate::batcheval::testutil::*;
    use crate::error::Error;
    use crate::stateloader::StateLoader;

    fn lease_for(replica: ReplicaDescriptor, start: u64, expiration: Option<u64>) -> Lease {
        Lease {
            start: ts(start),
            expiration: expiration.map(ts),
            replica,
            ..Default::default()
        }
    }

    fn two_replica_range() -> (TestRange, ReplicaDescriptor) {
        let mut r = TestRange::new(b"a", b"z");
        let second = r.state.desc.add_replica(2, 2, ReplicaType::VoterFull);
        (r, second)
    }

    #[test]
    fn test_request_lease_rejects_overlap_and_extends() {
        let (mut r, second) = two_replica_range();
        let prev = r.state.lease.clone();

        let err = r
            .send_one(
                header(10),
                Request::RequestLease(RequestLeaseRequest {
                    key: b"a".to_vec(),
                    lease: lease_for(second, 10, Some(100)),
                    prev_lease: prev.clone(),
                }),
            )
            .unwrap_err();
        assert!(matches!(err.root(), Error::LeaseRejected { .. }));

        r.send_one(
            header(10),
            Request::RequestLease(RequestLeaseRequest {
                key: b"a".to_vec(),
                lease: lease_for(prev.replica.clone(), 10, None),
                prev_lease: prev.clone(),
            }),
        )
        .unwrap();
        assert_eq!(r.state.lease.sequence, prev.sequence);
        assert_eq!(r.state.lease.start, prev.start);
    }

    #[test]
    fn test_transfer_lease_bumps_sequence() {
        let (mut r, second) = two_replica_range();
        let prev = r.state.lease.clone();
        r.send_one(
            header(20),
            Request::TransferLease(TransferLeaseRequest {
                key: b"a".to_vec(),
                lease: lease_for(second.clone(), 20, None),
                prev_lease: prev.clone(),
            }),
        )
        .unwrap();
        assert_eq!(r.state.lease.sequence, prev.sequence + 1);
        assert_eq!(r.state.lease.replica, second);
        let persisted = StateLoader::new(1).load_lease(r.engine.as_ref()).unwrap();
        assert_eq!(persisted, r.state.lease);

        match r
            .send_one(header(21), Request::LeaseInfo(crate::api::LeaseInfoRequest { key: b"a".to_vec() }))
            .unwrap()
        {
            Response::LeaseInfo { lease } => assert_eq!(lease.replica, second),
            other => panic!("unexpected {other:?}"),
        }

        // A transfer planned against the old lease is refused.
        let err = r
            .send_one(
                header(22),
                Request::TransferLease(TransferLeaseRequest {
                    key: b"a".to_vec(),
                    lease: lease_for(prev.replica.clone(), 22, None),
                    prev_lease: prev,
                }),
            )
            .unwrap_err();
        assert!(matches!(err.root(), Error::LeaseRejected { .. }));
    }

    #[test]
    fn test_lease_for_unknown_replica() {
        let mut r = TestRange::new(b"a", b"z");
        let prev = r.state.lease.clone();
        let err = r
            .send_one(
                header(10),
                Request::TransferLease(TransferLeaseRequest {
                    key: b"a".to_vec(),
                    lease: lease_for(ReplicaDescriptor::new(9, 9, 9), 10, None),
                    prev_lease: prev,
                }),
            )
            .unwrap_err();
        assert!(matches!(err.root(), Error::LeaseRejected { .. }));
    }
}
