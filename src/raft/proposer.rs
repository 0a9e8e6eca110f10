//! Proposal and application seams
//!
//! Replicas hand commands to a [`Proposer`] and learn the outcome when the
//! command comes back through a [`CommandApplier`]. The store implements the
//! applier; the proposer is either a [`RaftNode`](crate::raft::RaftNode) or,
//! for a store that does not replicate, a [`LocalProposer`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::api::RangeId;
use crate::error::{Error, Result};
use crate::raft::command::{Command, CommandId, CommandResponse, RaftCommand};

/// Applies committed commands in log order.
#[async_trait]
pub trait CommandApplier: Send + Sync {
    /// Applies one replicated command of `range_id`. Rejections are reported
    /// to the proposer and returned as [`CommandResponse::Rejected`]; an
    /// error means the state machine cannot continue.
    async fn apply_command(
        &self,
        range_id: RangeId,
        cmd_id: CommandId,
        cmd: &RaftCommand,
    ) -> Result<CommandResponse>;

    /// The engine contents were replaced by a snapshot.
    async fn reload(&self) -> Result<()>;
}

/// Submits commands for replication.
#[async_trait]
pub trait Proposer: Send + Sync {
    /// Appends `cmd` to the log. Returns once the command is committed; the
    /// proposing replica learns the apply outcome separately.
    async fn propose(&self, cmd: Command) -> Result<()>;
}

/// Applies proposals directly in submission order, without a log.
pub struct LocalProposer {
    applier: Weak<dyn CommandApplier>,
    /// Serializes application, standing in for log order.
    order: Mutex<()>,
    index: AtomicU64,
}

impl LocalProposer {
    pub fn new(applier: Weak<dyn CommandApplier>) -> Self {
        Self {
            applier,
            order: Mutex::new(()),
            index: AtomicU64::new(0),
        }
    }

    /// Number of commands applied so far
    pub fn applied(&self) -> u64 {
        self.index.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Proposer for LocalProposer {
    async fn propose(&self, cmd: Command) -> Result<()> {
        let applier = self
            .applier
            .upgrade()
            .ok_or_else(|| Error::AmbiguousResult("store is shutting down".to_string()))?;
        let _order = self.order.lock().await;
        // Round-trip through the codec so local application sees exactly what
        // a follower would decode.
        let cmd: Command = crate::codec::decode_record(&crate::codec::encode_record(&cmd)?)?;
        let index = self.index.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some((range_id, cmd_id, raft_cmd)) = cmd.raft_command() {
            let resp = applier.apply_command(range_id, cmd_id, raft_cmd).await?;
            tracing::trace!(index, range_id, cmd_id, ?resp, "applied local proposal");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex as SyncMutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        applied: SyncMutex<Vec<(RangeId, CommandId)>>,
    }

    #[async_trait]
    impl CommandApplier for Recorder {
        async fn apply_command(
            &self,
            range_id: RangeId,
            cmd_id: CommandId,
            _cmd: &RaftCommand,
        ) -> Result<CommandResponse> {
            self.applied.lock().push((range_id, cmd_id));
            Ok(CommandResponse::Ok)
        }

        async fn reload(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_local_proposer_applies_in_order() {
        let recorder = Arc::new(Recorder::default());
        let applier: Arc<dyn CommandApplier> = recorder.clone();
        let proposer = LocalProposer::new(Arc::downgrade(&applier));
        for cmd_id in 1..=3 {
            proposer
                .propose(Command::Range {
                    range_id: 1,
                    cmd_id,
                    command: RaftCommand::default(),
                })
                .await
                .unwrap();
        }
        proposer.propose(Command::Noop).await.unwrap();
        assert_eq!(*recorder.applied.lock(), vec![(1, 1), (1, 2), (1, 3)]);
        assert_eq!(proposer.applied(), 4);
    }

    #[tokio::test]
    async fn test_local_proposer_without_applier() {
        let proposer = {
            let applier: Arc<dyn CommandApplier> = Arc::new(Recorder::default());
            LocalProposer::new(Arc::downgrade(&applier))
        };
        let err = proposer.propose(Command::Noop).await.unwrap_err();
        assert!(matches!(err, Error::AmbiguousResult(_)));
    }
}
