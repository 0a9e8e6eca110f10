//! Admin commands
//!
//! Admin commands do not write. They validate the request against the
//! replica's current state and return the descriptors the store then
//! installs through a transaction carrying the matching commit trigger.

use crate::api::{
    AdminChangeReplicasRequest, AdminMergeRequest, AdminSplitRequest, Lease, RangeDescriptor,
    ReplicaChangeType, ReplicationChange, Response,
};
use crate::batcheval::{CommandArgs, EvalResult};
use crate::error::{Error, Result};
use crate::keys;
use crate::mvcc::mvcc_find_split_key;
use crate::storage::Reader;

pub(super) fn admin_split<R: Reader + ?Sized>(
    reader: &R,
    args: &CommandArgs<'_>,
    req: &AdminSplitRequest,
) -> Result<(Response, EvalResult)> {
    let desc = args.ctx.desc();
    let split_key = match &req.split_key {
        Some(key) => key.clone(),
        None => match mvcc_find_split_key(reader, &desc.start_key, &desc.end_key)? {
            Some(key) => key,
            None => {
                return Err(Error::InvalidArgument(format!(
                    "cannot find a split key in {desc}"
                )));
            }
        },
    };
    if keys::is_local(&split_key) {
        return Err(Error::InvalidArgument(format!(
            "cannot split at local key {}",
            keys::pretty(&split_key)
        )));
    }
    if split_key == desc.start_key || !desc.contains_key(&split_key) {
        return Err(Error::InvalidArgument(format!(
            "split key {} is not strictly inside {}",
            keys::pretty(&split_key),
            desc
        )));
    }
    if req.new_range_id == 0 || req.new_range_id == desc.range_id {
        return Err(Error::InvalidArgument(format!(
            "invalid range ID {} for split",
            req.new_range_id
        )));
    }

    let mut left_desc = desc.clone();
    left_desc.end_key = split_key.clone();
    left_desc.generation += 1;
    let right_desc = RangeDescriptor {
        range_id: req.new_range_id,
        start_key: split_key,
        end_key: desc.end_key.clone(),
        internal_replicas: desc.internal_replicas.clone(),
        next_replica_id: desc.next_replica_id,
        generation: left_desc.generation,
    };
    tracing::debug!(range_id = desc.range_id, left = %left_desc, right = %right_desc, "planned split");
    Ok((
        Response::AdminSplit {
            left_desc,
            right_desc,
        },
        EvalResult::default(),
    ))
}

/// Checks that the range has a right-hand neighbor to absorb.
pub(super) fn admin_merge(
    args: &CommandArgs<'_>,
    _req: &AdminMergeRequest,
) -> Result<(Response, EvalResult)> {
    let desc = args.ctx.desc();
    if desc.end_key.as_slice() >= keys::KEY_MAX {
        return Err(Error::InvalidArgument(format!(
            "cannot merge final range {desc}"
        )));
    }
    Ok((
        Response::AdminMerge { desc: desc.clone() },
        EvalResult::default(),
    ))
}

pub(super) fn admin_change_replicas(
    args: &CommandArgs<'_>,
    req: &AdminChangeReplicasRequest,
) -> Result<(Response, EvalResult)> {
    let desc = args.ctx.desc();
    if &req.exp_desc != desc {
        return Err(Error::ConditionFailed {
            actual: Some(crate::codec::encode_record(desc)?),
        });
    }
    let desc = plan_change_replicas(desc, &args.ctx.state.lease, &req.changes)?;
    Ok((Response::AdminChangeReplicas { desc }, EvalResult::default()))
}

/// The descriptor resulting from applying `changes` to `desc`. The
/// leaseholder's replica cannot be removed.
pub fn plan_change_replicas(
    desc: &RangeDescriptor,
    lease: &Lease,
    changes: &[ReplicationChange],
) -> Result<RangeDescriptor> {
    if changes.is_empty() {
        return Err(Error::InvalidArgument("no replication changes".to_string()));
    }
    let mut next = desc.clone();
    for change in changes {
        let existing = next.replica_for_store(change.store_id).copied();
        match change.change_type {
            ReplicaChangeType::AddVoter | ReplicaChangeType::AddNonVoter => {
                if existing.is_some() {
                    return Err(Error::InvalidArgument(format!(
                        "unable to add replica (n{},s{}); already present in {}",
                        change.node_id, change.store_id, next
                    )));
                }
                next.add_replica(change.node_id, change.store_id, change.replica_type());
            }
            ReplicaChangeType::RemoveVoter | ReplicaChangeType::RemoveNonVoter => {
                let Some(existing) = existing else {
                    return Err(Error::InvalidArgument(format!(
                        "unable to remove replica (n{},s{}); not found in {}",
                        change.node_id, change.store_id, next
                    )));
                };
                if existing.replica_type.is_voter() != (change.replica_type().is_voter()) {
                    return Err(Error::InvalidArgument(format!(
                        "replica {existing} does not match {:?}",
                        change.change_type
                    )));
                }
                if lease.replica.replica_id == existing.replica_id {
                    return Err(Error::InvalidArgument(format!(
                        "cannot remove the leaseholder {existing}"
                    )));
                }
                next.remove_replica(change.node_id, change.store_id);
            }
        }
    }
    if !next.replicas().iter().any(|r| r.replica_type.is_voter()) {
        return Err(Error::InvalidArgument(format!(
            "change would leave {desc} without voters"
        )));
    }
    next.generation += 1;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ReplicaType, Request};
    use crate::batcheval::testutil::*;
    use crate::mvcc::Value;

    fn split_req(split_key: Option<&str>) -> Request {
        Request::AdminSplit(AdminSplitRequest {
            key: b"a".to_vec(),
            split_key: split_key.map(|k| k.as_bytes().to_vec()),
            new_range_id: 2,
        })
    }

    #[test]
    fn test_admin_split_finds_middle_key() {
        let mut r = TestRange::new(b"a", b"z");
        for k in ["b", "d", "f", "h", "j"] {
            r.send_one(header(10), Request::put(k.as_bytes().to_vec(), Value::from_bytes(&[0u8; 64])))
                .unwrap();
        }
        match r.send_one(header(20), split_req(None)).unwrap() {
            Response::AdminSplit {
                left_desc,
                right_desc,
            } => {
                assert!(left_desc.end_key > b"b".to_vec() && left_desc.end_key <= b"j".to_vec());
                assert_eq!(left_desc.end_key, right_desc.start_key);
                assert_eq!(right_desc.end_key, b"z".to_vec());
                assert_eq!(right_desc.range_id, 2);
                assert_eq!(left_desc.generation, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_admin_split_rejects_bounds() {
        let mut r = TestRange::new(b"a", b"z");
        assert!(r.send_one(header(20), split_req(Some("a"))).is_err());
        assert!(r.send_one(header(20), split_req(Some("z"))).is_err());
        // An empty range has nothing to split by size.
        assert!(r.send_one(header(20), split_req(None)).is_err());
    }

    #[test]
    fn test_plan_change_replicas() {
        let r = TestRange::new(b"a", b"z");
        let add = ReplicationChange {
            change_type: ReplicaChangeType::AddVoter,
            node_id: 2,
            store_id: 2,
        };
        let desc = plan_change_replicas(&r.state.desc, &r.state.lease, &[add]).unwrap();
        assert_eq!(desc.replicas().len(), 2);
        assert_eq!(desc.replica_for_store(2).unwrap().replica_type, ReplicaType::VoterFull);
        assert_eq!(desc.generation, r.state.desc.generation + 1);

        assert!(plan_change_replicas(&desc, &r.state.lease, &[add]).is_err());
        let remove_leaseholder = ReplicationChange {
            change_type: ReplicaChangeType::RemoveVoter,
            node_id: 1,
            store_id: 1,
        };
        assert!(plan_change_replicas(&desc, &r.state.lease, &[remove_leaseholder]).is_err());
    }

    #[test]
    fn test_change_replicas_checks_expected_descriptor() {
        let mut r = TestRange::new(b"a", b"z");
        let mut stale = r.state.desc.clone();
        stale.generation += 7;
        let err = r
            .send_one(
                header(10),
                Request::AdminChangeReplicas(AdminChangeReplicasRequest {
                    key: b"a".to_vec(),
                    changes: vec![ReplicationChange {
                        change_type: ReplicaChangeType::AddVoter,
                        node_id: 2,
                        store_id: 2,
                    }],
                    exp_desc: stale,
                }),
            )
            .unwrap_err();
        assert!(matches!(err.root(), Error::ConditionFailed { .. }));
    }
}
