//! Raft node management

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use openraft::Config;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::raft::command::Command;
use crate::raft::network::{serve_connection, RaftNetworkFactoryImpl};
use crate::raft::proposer::{CommandApplier, Proposer};
use crate::raft::storage::EngineRaftStorage;
use crate::raft::types::{Node, NodeId, Raft};
use crate::storage::Engine;

#[derive(Error, Debug)]
pub enum RaftNodeError {
    #[error("Raft error: {0}")]
    Raft(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Not leader")]
    NotLeader,
}

impl From<RaftNodeError> for crate::error::Error {
    fn from(e: RaftNodeError) -> Self {
        // The command may or may not have been appended.
        crate::error::Error::AmbiguousResult(e.to_string())
    }
}

/// The store's member of the Raft group replicating all its ranges.
pub struct RaftNode {
    id: NodeId,
    addr: SocketAddr,
    raft: Raft,
    network: RaftNetworkFactoryImpl,
    shutdown_tx: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
}

impl RaftNode {
    /// Create a Raft node whose log and state machine live in `engine`.
    pub async fn new(
        id: NodeId,
        addr: SocketAddr,
        engine: Arc<Engine>,
        applier: Weak<dyn CommandApplier>,
    ) -> Result<Self, RaftNodeError> {
        let config = Config {
            cluster_name: "rangedb".to_string(),
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            ..Default::default()
        };
        let config = Arc::new(
            config
                .validate()
                .map_err(|e| RaftNodeError::Raft(e.to_string()))?,
        );

        let storage = EngineRaftStorage::new(engine, applier)
            .map_err(|e| RaftNodeError::Raft(e.to_string()))?;
        let network = RaftNetworkFactoryImpl::new();

        let raft = Raft::new(id, config, network.clone(), storage.clone(), storage)
            .await
            .map_err(|e| RaftNodeError::Raft(e.to_string()))?;

        Ok(Self {
            id,
            addr,
            raft,
            network,
            shutdown_tx: parking_lot::Mutex::new(None),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    pub fn add_peer(&self, id: NodeId, addr: SocketAddr) {
        self.network.add_node(id, addr);
    }

    /// Bootstrap as a single-node cluster (auto-elect as leader). A node that
    /// already has a log is left alone.
    pub async fn bootstrap_single_node(&self) -> Result<(), RaftNodeError> {
        if self
            .raft
            .is_initialized()
            .await
            .map_err(|e| RaftNodeError::Raft(e.to_string()))?
        {
            tracing::info!(node_id = self.id, "Raft group already initialized");
            return Ok(());
        }
        let mut members = BTreeMap::new();
        members.insert(self.id, Node::new(self.addr.to_string()));

        self.raft
            .initialize(members)
            .await
            .map_err(|e| RaftNodeError::Raft(e.to_string()))?;

        tracing::info!(node_id = self.id, "Bootstrapped as single-node cluster");
        Ok(())
    }

    /// Start the Raft RPC server
    pub async fn start_rpc_server(&self) -> Result<SocketAddr, RaftNodeError> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        let raft = self.raft.clone();

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        tracing::info!(addr = %local_addr, "Raft RPC server listening");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let raft = raft.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = serve_connection(stream, raft).await {
                                        tracing::warn!(%peer_addr, error = %e, "RPC connection error");
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "Accept error");
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        tracing::info!("Raft RPC server shutting down");
                        break;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Append a command to the Raft log and wait for it to apply.
    pub async fn write(&self, cmd: Command) -> Result<(), RaftNodeError> {
        self.raft.client_write(cmd).await.map_err(|e| {
            if e.forward_to_leader().is_some() {
                RaftNodeError::NotLeader
            } else {
                RaftNodeError::Raft(e.to_string())
            }
        })?;
        Ok(())
    }

    /// Check if this node is the leader
    pub async fn is_leader(&self) -> bool {
        self.raft.ensure_linearizable().await.is_ok()
    }

    pub async fn shutdown(&self) -> Result<(), RaftNodeError> {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        self.raft
            .shutdown()
            .await
            .map_err(|e| RaftNodeError::Raft(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Proposer for RaftNode {
    async fn propose(&self, cmd: Command) -> crate::error::Result<()> {
        Ok(self.write(cmd).await?)
    }
}
