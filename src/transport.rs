//! Peer-addressable RPC abstraction.
//!
//! The consensus core never talks to a socket: it issues calls through
//! [`Transport`] and treats `None` as "not delivered": a timeout, a drop,
//! and a partition all look the same, and the timer-driven retry loop
//! absorbs them. [`LocalNetwork`] is an in-process implementation used by
//! the simulated cluster; hosts bring their own wire transport.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::peer::Peer;
use crate::types::{
    AppendEntries, AppendEntriesResponse, PeerId, RequestVote, RequestVoteResponse,
};

/// Outbound RPC surface of a peer. A call either yields the remote reply or
/// `None` on any transport failure. The transport never errors out-of-band.
#[async_trait]
pub trait Transport<Cmd>: Send + Sync {
    async fn request_vote(&self, to: PeerId, args: RequestVote) -> Option<RequestVoteResponse>;

    async fn append_entries(
        &self,
        to: PeerId,
        args: AppendEntries<Cmd>,
    ) -> Option<AppendEntriesResponse>;
}

/// In-memory network connecting the peers of one simulated cluster.
///
/// Peers register their handles after construction; calls are routed
/// straight into the target's RPC handlers. Either endpoint being
/// disconnected (or the target being dead or unregistered) loses the call,
/// which is how tests stage partitions and crashes.
pub struct LocalNetwork<Cmd> {
    peers: Mutex<Vec<Option<Peer<Cmd>>>>,
    connected: Mutex<Vec<bool>>,
}

impl<Cmd> LocalNetwork<Cmd>
where
    Cmd: Clone + Send + Serialize + DeserializeOwned + 'static,
{
    pub fn new(cluster_size: usize) -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new((0..cluster_size).map(|_| None).collect()),
            connected: Mutex::new(vec![true; cluster_size]),
        })
    }

    /// Attach (or replace, after a restart) the peer serving `id`.
    pub fn register(&self, id: PeerId, peer: Peer<Cmd>) {
        self.peers.lock().unwrap()[id.get()] = Some(peer);
    }

    /// Detach the peer serving `id`; its inbound calls are lost.
    pub fn deregister(&self, id: PeerId) {
        self.peers.lock().unwrap()[id.get()] = None;
    }

    /// Connect or partition a peer, in both directions.
    pub fn set_connected(&self, id: PeerId, up: bool) {
        self.connected.lock().unwrap()[id.get()] = up;
    }

    /// The calling endpoint handed to the peer at `from`.
    pub fn endpoint(self: &Arc<Self>, from: PeerId) -> Arc<dyn Transport<Cmd>> {
        Arc::new(LocalEndpoint {
            net: Arc::clone(self),
            from,
        })
    }

    fn route(&self, from: PeerId, to: PeerId) -> Option<Peer<Cmd>> {
        {
            let connected = self.connected.lock().unwrap();
            if !connected.get(from.get()).copied().unwrap_or(false)
                || !connected.get(to.get()).copied().unwrap_or(false)
            {
                return None;
            }
        }
        let target = self.peers.lock().unwrap().get(to.get())?.clone()?;
        // A dead server answers nothing.
        if target.is_killed() {
            return None;
        }
        Some(target)
    }
}

struct LocalEndpoint<Cmd> {
    net: Arc<LocalNetwork<Cmd>>,
    from: PeerId,
}

#[async_trait]
impl<Cmd> Transport<Cmd> for LocalEndpoint<Cmd>
where
    Cmd: Clone + Send + Serialize + DeserializeOwned + 'static,
{
    async fn request_vote(&self, to: PeerId, args: RequestVote) -> Option<RequestVoteResponse> {
        let target = self.net.route(self.from, to)?;
        tokio::task::yield_now().await;
        target.handle_request_vote(args).ok()
    }

    async fn append_entries(
        &self,
        to: PeerId,
        args: AppendEntries<Cmd>,
    ) -> Option<AppendEntriesResponse> {
        let target = self.net.route(self.from, to)?;
        tokio::task::yield_now().await;
        target.handle_append_entries(args).ok()
    }
}
