//! Raft transport over TCP
//!
//! One RPC per connection. Both directions use the same frame,
//! `[len: u32][bincode body]`: the request body is a [`RaftRpc`], the reply
//! body a `Result<RaftReply, String>` so that a peer's Raft error reaches the
//! caller instead of a dropped connection.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::raft::types::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    Node, NodeId, Raft, TypeConfig, VoteRequest, VoteResponse,
};

/// Frames above this are rejected before allocating.
const MAX_FRAME_LEN: usize = 64 << 20;

#[derive(Debug, Serialize, Deserialize)]
enum RaftRpc {
    Vote(VoteRequest),
    AppendEntries(AppendEntriesRequest),
    InstallSnapshot(InstallSnapshotRequest),
}

#[derive(Debug, Serialize, Deserialize)]
enum RaftReply {
    Vote(VoteResponse),
    AppendEntries(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotResponse),
}

fn invalid_data(e: impl ToString) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

async fn write_frame<W, T>(w: &mut W, msg: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(msg).map_err(invalid_data)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(invalid_data(format!("frame of {} bytes too large", body.len())));
    }
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    w.write_all(&buf).await?;
    w.flush().await
}

async fn read_frame<R, T>(r: &mut R) -> io::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = r.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(invalid_data(format!("frame of {len} bytes too large")));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    bincode::deserialize(&body).map_err(invalid_data)
}

/// Resolves peer addresses for outgoing connections.
#[derive(Clone, Default)]
pub struct RaftNetworkFactoryImpl {
    peers: Arc<RwLock<HashMap<NodeId, SocketAddr>>>,
}

impl RaftNetworkFactoryImpl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, id: NodeId, addr: SocketAddr) {
        self.peers.write().insert(id, addr);
    }

    pub fn remove_node(&self, id: NodeId) {
        self.peers.write().remove(&id);
    }
}

impl RaftNetworkFactory<TypeConfig> for RaftNetworkFactoryImpl {
    type Network = RaftNetworkConnection;

    async fn new_client(&mut self, target: NodeId, node: &Node) -> Self::Network {
        // Explicitly registered peers win over the membership address.
        let addr = self
            .peers
            .read()
            .get(&target)
            .copied()
            .or_else(|| node.addr.parse().ok());
        RaftNetworkConnection { target, addr }
    }
}

/// Client side of the RPCs to one peer.
pub struct RaftNetworkConnection {
    target: NodeId,
    addr: Option<SocketAddr>,
}

type RpcResult<T, E> = Result<T, RPCError<NodeId, Node, RaftError<NodeId, E>>>;

fn unreachable<E: std::error::Error>(e: io::Error) -> RPCError<NodeId, Node, RaftError<NodeId, E>> {
    RPCError::Unreachable(Unreachable::new(&e))
}

fn network_error<E: std::error::Error>(e: io::Error) -> RPCError<NodeId, Node, RaftError<NodeId, E>> {
    RPCError::Network(NetworkError::new(&e))
}

impl RaftNetworkConnection {
    async fn call<T, E>(&self, rpc: RaftRpc, extract: fn(RaftReply) -> Option<T>) -> RpcResult<T, E>
    where
        E: std::error::Error,
    {
        let addr = self.addr.ok_or_else(|| {
            unreachable::<E>(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address for node {}", self.target),
            ))
        })?;
        let mut stream = TcpStream::connect(addr).await.map_err(unreachable::<E>)?;
        stream.set_nodelay(true).map_err(unreachable::<E>)?;

        write_frame(&mut stream, &rpc).await.map_err(network_error::<E>)?;
        let reply: Result<RaftReply, String> =
            read_frame(&mut stream).await.map_err(network_error::<E>)?;
        let reply = reply.map_err(|msg| network_error::<E>(io::Error::other(msg)))?;
        extract(reply).ok_or_else(|| network_error::<E>(invalid_data("reply does not match request")))
    }
}

impl RaftNetwork<TypeConfig> for RaftNetworkConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse, RPCError<NodeId, Node, RaftError<NodeId>>> {
        self.call(RaftRpc::AppendEntries(req), |r| match r {
            RaftReply::AppendEntries(resp) => Some(resp),
            _ => None,
        })
        .await
    }

    async fn vote(
        &mut self,
        req: VoteRequest,
        _option: RPCOption,
    ) -> Result<VoteResponse, RPCError<NodeId, Node, RaftError<NodeId>>> {
        self.call(RaftRpc::Vote(req), |r| match r {
            RaftReply::Vote(resp) => Some(resp),
            _ => None,
        })
        .await
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
        _option: RPCOption,
    ) -> RpcResult<InstallSnapshotResponse, InstallSnapshotError> {
        self.call(RaftRpc::InstallSnapshot(req), |r| match r {
            RaftReply::InstallSnapshot(resp) => Some(resp),
            _ => None,
        })
        .await
    }
}

async fn dispatch(raft: &Raft, rpc: RaftRpc) -> Result<RaftReply, String> {
    match rpc {
        RaftRpc::Vote(req) => raft
            .vote(req)
            .await
            .map(RaftReply::Vote)
            .map_err(|e| e.to_string()),
        RaftRpc::AppendEntries(req) => raft
            .append_entries(req)
            .await
            .map(RaftReply::AppendEntries)
            .map_err(|e| e.to_string()),
        RaftRpc::InstallSnapshot(req) => raft
            .install_snapshot(req)
            .await
            .map(RaftReply::InstallSnapshot)
            .map_err(|e| e.to_string()),
    }
}

/// Serves the single RPC carried by an accepted connection.
pub async fn serve_connection(mut stream: TcpStream, raft: Raft) -> io::Result<()> {
    let rpc: RaftRpc = read_frame(&mut stream).await?;
    let reply = dispatch(&raft, rpc).await;
    if let Err(e) = &reply {
        tracing::debug!(error = %e, "raft rpc failed");
    }
    write_frame(&mut stream, &reply).await
}
