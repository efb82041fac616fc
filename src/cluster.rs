//! Simulated cluster for testing: real peers, real timers, an in-memory
//! network with partition and crash controls, and per-peer collectors for
//! the apply streams.

use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::peer::{Peer, TimerConfig};
use crate::persist::{MemoryPersister, PersistError};
use crate::transport::LocalNetwork;
use crate::types::{ApplyMsg, PeerId, Term};

/// A cluster of in-process peers wired through a [`LocalNetwork`].
///
/// Each peer keeps its [`MemoryPersister`] across [`Cluster::crash`] /
/// [`Cluster::restart`], so durability behaves like a real crash-restart:
/// the persisted term, vote, and log come back, the volatile commit state
/// does not.
pub struct Cluster<Cmd> {
    config: TimerConfig,
    network: Arc<LocalNetwork<Cmd>>,
    peers: Vec<Peer<Cmd>>,
    persisters: Vec<Arc<MemoryPersister>>,
    applied: Vec<Arc<Mutex<Vec<ApplyMsg<Cmd>>>>>,
    crashed: Vec<bool>,
    connected: Vec<bool>,
}

impl<Cmd> Cluster<Cmd>
where
    Cmd: Clone + Send + Serialize + DeserializeOwned + 'static,
{
    /// Boot `cluster_size` connected peers with fresh persisters and default
    /// timing. Must be called within a tokio runtime.
    pub fn start(cluster_size: usize) -> Result<Self, PersistError> {
        Self::with_config(cluster_size, TimerConfig::default())
    }

    pub fn with_config(cluster_size: usize, config: TimerConfig) -> Result<Self, PersistError> {
        let network = LocalNetwork::new(cluster_size);
        let mut cluster = Self {
            config,
            network,
            peers: Vec::new(),
            persisters: Vec::new(),
            applied: Vec::new(),
            crashed: vec![false; cluster_size],
            connected: vec![true; cluster_size],
        };
        for i in 0..cluster_size {
            let persister = Arc::new(MemoryPersister::new());
            let (peer, applied) = cluster.boot(i, Arc::clone(&persister))?;
            cluster.network.register(PeerId::new(i), peer.clone());
            cluster.peers.push(peer);
            cluster.persisters.push(persister);
            cluster.applied.push(applied);
        }
        Ok(cluster)
    }

    fn boot(
        &self,
        i: usize,
        persister: Arc<MemoryPersister>,
    ) -> Result<(Peer<Cmd>, Arc<Mutex<Vec<ApplyMsg<Cmd>>>>), PersistError> {
        let (tx, mut rx) = mpsc::channel(64);
        let applied = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&applied);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                sink.lock().unwrap().push(msg);
            }
        });
        let peer = Peer::start(
            self.network.endpoint(PeerId::new(i)),
            self.cluster_size(),
            PeerId::new(i),
            persister,
            tx,
            self.config.clone(),
        )?;
        Ok((peer, applied))
    }

    pub fn cluster_size(&self) -> usize {
        self.crashed.len()
    }

    pub fn peer(&self, i: usize) -> &Peer<Cmd> {
        &self.peers[i]
    }

    /// Everything the consumer at peer `i` has received so far, in delivery
    /// order (reset on restart: a fresh incarnation re-delivers from 1).
    pub fn applied(&self, i: usize) -> Vec<ApplyMsg<Cmd>> {
        self.applied[i].lock().unwrap().clone()
    }

    /// Kill peer `i` and take it off the network. Its persister survives.
    pub fn crash(&mut self, i: usize) {
        self.peers[i].kill();
        self.network.deregister(PeerId::new(i));
        self.crashed[i] = true;
    }

    /// Boot a replacement peer for `i` from its surviving persister.
    pub fn restart(&mut self, i: usize) -> Result<(), PersistError> {
        let (peer, applied) = self.boot(i, Arc::clone(&self.persisters[i]))?;
        self.network.register(PeerId::new(i), peer.clone());
        self.peers[i] = peer;
        self.applied[i] = applied;
        self.crashed[i] = false;
        Ok(())
    }

    /// Partition peer `i` from the cluster (both directions).
    pub fn disconnect(&mut self, i: usize) {
        self.network.set_connected(PeerId::new(i), false);
        self.connected[i] = false;
    }

    pub fn reconnect(&mut self, i: usize) {
        self.network.set_connected(PeerId::new(i), true);
        self.connected[i] = true;
    }

    /// Live, reachable peers currently claiming leadership, with their
    /// terms.
    pub fn live_leaders(&self) -> Vec<(usize, Term)> {
        self.peers
            .iter()
            .enumerate()
            .filter(|&(i, _)| !self.crashed[i] && self.connected[i])
            .filter_map(|(i, peer)| {
                let (term, is_leader) = peer.status();
                is_leader.then_some((i, term))
            })
            .collect()
    }

    /// The single live leader, if leadership has settled.
    pub fn leader(&self) -> Option<usize> {
        match self.live_leaders().as_slice() {
            [(i, _)] => Some(*i),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogIndex;
    use tokio::time::{self, Duration, Instant};

    /// Poll `cond` until it holds or `secs` elapse; return the final state.
    async fn eventually(secs: u64, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(secs);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            time::sleep(Duration::from_millis(25)).await;
        }
        cond()
    }

    /// Wait until exactly one live leader exists, checking Election Safety
    /// (never two leaders in one term) at every sample.
    async fn wait_for_leader(cluster: &Cluster<String>) -> usize {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let leaders = cluster.live_leaders();
            let mut terms: Vec<Term> = leaders.iter().map(|&(_, term)| term).collect();
            terms.sort();
            terms.dedup();
            assert_eq!(
                terms.len(),
                leaders.len(),
                "two peers lead in the same term: {leaders:?}"
            );
            if let [(i, _)] = leaders.as_slice() {
                return *i;
            }
            assert!(Instant::now() < deadline, "no leader elected in time");
            time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Drive `cmd` to commitment, retrying across leadership changes: a
    /// submission accepted by a leader that is deposed before replicating
    /// can be lost, so keep resubmitting until the command shows up in the
    /// submitter's apply stream. Duplicates are possible and legal.
    async fn commit_one(cluster: &Cluster<String>, cmd: &str) {
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            if let Some(i) = cluster.leader() {
                if cluster.peer(i).submit(cmd.to_string()).is_some() {
                    let landed =
                        eventually(2, || cluster.applied(i).iter().any(|m| m.command == cmd))
                            .await;
                    if landed {
                        return;
                    }
                }
            }
            assert!(Instant::now() < deadline, "could not commit {cmd:?}");
            time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Deliveries must be contiguous and 1-origin (apply monotonicity).
    fn assert_contiguous(msgs: &[ApplyMsg<String>]) {
        for (k, msg) in msgs.iter().enumerate() {
            assert_eq!(msg.index, LogIndex::new(k as u64 + 1));
            assert!(!msg.use_snapshot);
        }
    }

    fn commands(msgs: &[ApplyMsg<String>]) -> Vec<String> {
        msgs.iter().map(|m| m.command.clone()).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn elects_single_leader() {
        let cluster: Cluster<String> = Cluster::start(3).expect("start");

        let leader = wait_for_leader(&cluster).await;

        let (term, is_leader) = cluster.peer(leader).status();
        assert!(is_leader);
        assert!(term >= Term::new(1));
        for i in 0..3 {
            if i != leader {
                assert!(!cluster.peer(i).status().1);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn replicates_and_commits_everywhere() {
        let cluster: Cluster<String> = Cluster::start(3).expect("start");
        let leader = wait_for_leader(&cluster).await;

        let (index, term) = cluster
            .peer(leader)
            .submit("x".to_string())
            .expect("leader accepts");
        assert_eq!(index, LogIndex::new(1));
        assert!(term >= Term::new(1));

        assert!(
            eventually(10, || (0..3).all(|i| !cluster.applied(i).is_empty())).await,
            "command not applied everywhere"
        );
        for i in 0..3 {
            let applied = cluster.applied(i);
            assert_contiguous(&applied);
            assert_eq!(commands(&applied), vec!["x"]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn follower_catches_up_after_partition() {
        let mut cluster: Cluster<String> = Cluster::start(3).expect("start");
        let leader = wait_for_leader(&cluster).await;
        let follower = (0..3).find(|&i| i != leader).expect("follower");

        cluster.disconnect(follower);
        let sent: Vec<String> = (1..=5).map(|k| format!("c{k}")).collect();
        for cmd in &sent {
            cluster
                .peer(leader)
                .submit(cmd.clone())
                .expect("leader accepts");
        }

        // The connected majority commits without the partitioned follower.
        assert!(
            eventually(10, || (0..3)
                .filter(|&i| i != follower)
                .all(|i| cluster.applied(i).len() == 5))
            .await,
            "connected majority did not commit"
        );
        assert_eq!(cluster.applied(follower).len(), 0);

        cluster.reconnect(follower);
        assert!(
            eventually(15, || cluster.applied(follower).len() == 5).await,
            "rejoined follower did not catch up"
        );
        let applied = cluster.applied(follower);
        assert_contiguous(&applied);
        assert_eq!(commands(&applied), sent);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn leadership_converges_after_leader_partition() {
        let mut cluster: Cluster<String> = Cluster::start(3).expect("start");
        let old_leader = wait_for_leader(&cluster).await;

        cluster.disconnect(old_leader);
        let new_leader = wait_for_leader(&cluster).await;
        assert_ne!(new_leader, old_leader);

        cluster.reconnect(old_leader);
        assert!(
            eventually(15, || {
                cluster.live_leaders().len() == 1 && !cluster.peer(old_leader).status().1
            })
            .await,
            "deposed leader did not step down"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn no_commit_without_majority() {
        let mut cluster: Cluster<String> = Cluster::start(3).expect("start");
        let leader = wait_for_leader(&cluster).await;
        let others: Vec<usize> = (0..3).filter(|&i| i != leader).collect();

        for &i in &others {
            cluster.disconnect(i);
        }
        cluster
            .peer(leader)
            .submit("stuck".to_string())
            .expect("leader accepts");

        time::sleep(Duration::from_secs(1)).await;
        assert!(
            cluster.applied(leader).is_empty(),
            "entry committed without a majority"
        );

        for &i in &others {
            cluster.reconnect(i);
        }
        commit_one(&cluster, "after").await;

        // All peers converge on one apply history ending in "after".
        // (Whether "stuck" survived depends on which peer won the healing
        // election; either outcome is legal.)
        assert!(
            eventually(20, || {
                let reference = cluster.applied(0);
                reference.last().map(|m| m.command.as_str() == "after") == Some(true)
                    && (1..3).all(|i| cluster.applied(i) == reference)
            })
            .await,
            "cluster did not converge after healing"
        );
        assert_contiguous(&cluster.applied(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn five_peer_cluster_elects_one_leader() {
        let cluster: Cluster<String> = Cluster::start(5).expect("start");

        wait_for_leader(&cluster).await;

        let leaders = cluster.live_leaders();
        assert_eq!(leaders.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_node_commits_immediately() {
        let cluster: Cluster<String> = Cluster::start(1).expect("start");
        let leader = wait_for_leader(&cluster).await;
        assert_eq!(leader, 0);

        cluster
            .peer(0)
            .submit("only".to_string())
            .expect("leader accepts");

        assert!(
            eventually(5, || cluster.applied(0).len() == 1).await,
            "single-node cluster did not commit"
        );
        let applied = cluster.applied(0);
        assert_contiguous(&applied);
        assert_eq!(commands(&applied), vec!["only"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn restart_recovers_persistent_state() {
        let mut cluster: Cluster<String> = Cluster::start(1).expect("start");
        wait_for_leader(&cluster).await;

        for cmd in ["a", "b", "c"] {
            cluster
                .peer(0)
                .submit(cmd.to_string())
                .expect("leader accepts");
        }
        assert!(
            eventually(5, || cluster.applied(0).len() == 3).await,
            "commands not applied before crash"
        );
        let (term_before, _) = cluster.peer(0).status();

        cluster.crash(0);
        cluster.restart(0).expect("restart");

        // The replacement boots as a follower with the persisted term.
        let (term_after_boot, is_leader) = cluster.peer(0).status();
        assert!(!is_leader);
        assert_eq!(term_after_boot, term_before);

        wait_for_leader(&cluster).await;
        cluster
            .peer(0)
            .submit("d".to_string())
            .expect("leader accepts");

        // Committing at the new term re-delivers the restored log 1..3 and
        // then the new entry; the consumer is expected to deduplicate.
        assert!(
            eventually(10, || cluster.applied(0).len() == 4).await,
            "restored log not recommitted"
        );
        let applied = cluster.applied(0);
        assert_contiguous(&applied);
        assert_eq!(commands(&applied), vec!["a", "b", "c", "d"]);
        assert!(cluster.peer(0).status().0 > term_before);
    }
}
