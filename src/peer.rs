//! The consensus peer: leader election, log replication, commitment, and
//! crash-safe persistence of terms, votes, and log entries.
//!
//! A peer is a long-lived object in a fixed-size cluster. Four operations
//! are invoked externally ([`Peer::submit`], [`Peer::status`],
//! [`Peer::handle_request_vote`], [`Peer::handle_append_entries`]) and one
//! outbound effect publishes committed entries to the host's apply channel.
//!
//! All state lives behind a single peer-wide mutex. Blocking outbound RPCs
//! run off the critical section: the arguments are snapshotted under the
//! lock and the call itself happens on a spawned task, which reacquires the
//! lock to process the reply. Delivery to the consumer likewise runs on its
//! own task so a back-pressuring consumer can never deadlock the peer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Duration;

use crate::persist::{PersistError, PersistentState, Persister};
use crate::timer::ResettableTimer;
use crate::transport::Transport;
use crate::types::{
    AppendEntries, AppendEntriesResponse, ApplyMsg, Entry, LogIndex, PeerId, RequestVote,
    RequestVoteResponse, Term,
};

/// Timer configuration.
///
/// Leaders tick at the fixed heartbeat interval; followers and candidates
/// draw a fresh uniform timeout from `[election_timeout_min,
/// election_timeout_max)` at every reset, so simultaneous candidacies
/// quickly drift apart (§5.2).
#[derive(Clone, Debug)]
pub struct TimerConfig {
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
        }
    }
}

/// Server role, with role-specific bookkeeping confined to the variant.
#[derive(Debug)]
pub(crate) enum Role {
    Follower,
    Candidate { votes_granted: usize },
    Leader(LeaderState),
}

/// Leader-only replication bookkeeping, reinitialized at every election win.
/// The slots at the leader's own position are unused.
#[derive(Debug)]
pub(crate) struct LeaderState {
    /// For each peer, index of the next log entry to send.
    pub(crate) next_index: Vec<LogIndex>,
    /// For each peer, highest log index known to be replicated there.
    pub(crate) match_index: Vec<LogIndex>,
}

impl LeaderState {
    fn new(cluster_size: usize, last_log_index: LogIndex) -> Self {
        Self {
            next_index: vec![last_log_index.next(); cluster_size],
            match_index: vec![LogIndex::ZERO; cluster_size],
        }
    }
}

/// The mutable state of a peer, guarded by the peer-wide mutex.
#[derive(Debug)]
pub(crate) struct PeerState<Cmd> {
    // Persistent fields (flushed via the persister before any dependent
    // reply or action).
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<PeerId>,
    pub(crate) log: Vec<Entry<Cmd>>,

    // Volatile fields.
    pub(crate) commit_index: LogIndex,
    pub(crate) last_applied: LogIndex,
    pub(crate) role: Role,
}

impl<Cmd> PeerState<Cmd> {
    fn new() -> Self {
        Self {
            current_term: Term::ZERO,
            voted_for: None,
            log: Vec::new(),
            commit_index: LogIndex::ZERO,
            last_applied: LogIndex::ZERO,
            role: Role::Follower,
        }
    }

    pub(crate) fn last_log_index(&self) -> LogIndex {
        LogIndex::from_length(self.log.len())
    }

    pub(crate) fn last_log_term(&self) -> Term {
        self.log.last().map_or(Term::ZERO, |e| e.term)
    }

    /// Term of the entry at `index`. `ZERO` is the "before the log" anchor
    /// with term 0; indices past the end return `None`.
    fn term_at(&self, index: LogIndex) -> Option<Term> {
        match index.to_array_index() {
            None => Some(Term::ZERO),
            Some(i) => self.log.get(i).map(|e| e.term),
        }
    }

    /// §5.4.1: the candidate's log is at least as up-to-date as ours iff its
    /// last term is newer, or terms are equal and its log is no shorter.
    fn candidate_up_to_date(&self, last_log_term: Term, last_log_index: LogIndex) -> bool {
        last_log_term > self.last_log_term()
            || (last_log_term == self.last_log_term() && last_log_index >= self.last_log_index())
    }

    /// Fast-backoff hint after a failed log-match check: the latest index at
    /// which our log still carries `prev_log_term`, scanning backwards from
    /// `min(last, prev_log_index)`. `ZERO` when no such entry exists.
    fn conflict_hint(&self, prev_log_index: LogIndex, prev_log_term: Term) -> LogIndex {
        let mut hint = self.last_log_index().min(prev_log_index);
        while hint.is_entry() && self.term_at(hint) != Some(prev_log_term) {
            hint = hint.prev();
        }
        hint
    }

    /// Largest index eligible for commitment under the majority rule,
    /// counting the leader itself, or `None` if the commit index cannot
    /// advance. Only entries of the current term qualify directly (§5.4.2,
    /// the Figure 8 clause); earlier entries commit transitively.
    fn commit_candidate(
        &self,
        leader: &LeaderState,
        me: PeerId,
        cluster_size: usize,
    ) -> Option<LogIndex> {
        let majority = cluster_size / 2 + 1;
        let mut index = self.last_log_index();
        while index > self.commit_index {
            if self.term_at(index) == Some(self.current_term) {
                let replicated = 1 + leader
                    .match_index
                    .iter()
                    .enumerate()
                    .filter(|&(peer, &matched)| peer != me.get() && matched >= index)
                    .count();
                if replicated >= majority {
                    return Some(index);
                }
            }
            index = index.prev();
        }
        None
    }
}

struct PeerCore<Cmd> {
    me: PeerId,
    cluster_size: usize,
    transport: Arc<dyn Transport<Cmd>>,
    persister: Arc<dyn Persister>,
    state: Mutex<PeerState<Cmd>>,
    timer: ResettableTimer,
    apply_notify: Notify,
    apply_tx: mpsc::Sender<ApplyMsg<Cmd>>,
    shutdown: watch::Sender<bool>,
    killed: AtomicBool,
    config: TimerConfig,
}

/// Handle to a running consensus peer. Clones are cheap and address the
/// same peer.
pub struct Peer<Cmd> {
    core: Arc<PeerCore<Cmd>>,
}

impl<Cmd> Clone for Peer<Cmd> {
    fn clone(&self) -> Self {
        Peer {
            core: Arc::clone(&self.core),
        }
    }
}

impl<Cmd> Peer<Cmd>
where
    Cmd: Clone + Send + Serialize + DeserializeOwned + 'static,
{
    /// Create a peer, restore any previously persisted state, and launch the
    /// timer and apply-pump tasks. Returns promptly; must be called within a
    /// tokio runtime.
    ///
    /// `me` is this peer's position in the cluster's shared peer table of
    /// `cluster_size` members. Committed entries are delivered on `apply_tx`
    /// in index order, exactly once per entry per incarnation.
    pub fn start(
        transport: Arc<dyn Transport<Cmd>>,
        cluster_size: usize,
        me: PeerId,
        persister: Arc<dyn Persister>,
        apply_tx: mpsc::Sender<ApplyMsg<Cmd>>,
        config: TimerConfig,
    ) -> Result<Self, PersistError> {
        let mut state = PeerState::new();
        if let Some(blob) = persister.load()? {
            let (current_term, voted_for, log) = PersistentState::decode(&blob)?.unpack();
            info!(
                "{me}: restored {current_term}, voted_for {voted_for:?}, {} log entries",
                log.len()
            );
            state.current_term = current_term;
            state.voted_for = voted_for;
            state.log = log;
        }

        let (shutdown, _) = watch::channel(false);
        let core = Arc::new(PeerCore {
            me,
            cluster_size,
            transport,
            persister,
            state: Mutex::new(state),
            timer: ResettableTimer::new(),
            apply_notify: Notify::new(),
            apply_tx,
            shutdown,
            killed: AtomicBool::new(false),
            config,
        });
        let peer = Peer { core };

        let timer_peer = peer.clone();
        tokio::spawn(async move { timer_peer.timer_loop().await });
        let pump_peer = peer.clone();
        tokio::spawn(async move { pump_peer.apply_loop().await });

        peer.core.timer.arm(peer.election_timeout());
        Ok(peer)
    }

    /// Start agreement on a new command. Returns the 1-origin index the
    /// entry will occupy if committed, and the current term; `None` when
    /// this peer is not the leader. Replication itself rides the next
    /// heartbeat tick.
    pub fn submit(&self, command: Cmd) -> Option<(LogIndex, Term)> {
        let mut guard = self.core.state.lock().unwrap();
        let state = &mut *guard;
        if self.is_killed() || !matches!(state.role, Role::Leader(_)) {
            return None;
        }

        state.log.push(Entry {
            term: state.current_term,
            command,
        });
        if let Err(err) = self.persist(state) {
            self.fatal(err);
            return None;
        }
        let index = state.last_log_index();
        let term = state.current_term;
        debug!("{}: new entry {index} at {term}", self.core.me);

        // A lone peer is its own majority; with company this is a no-op
        // until replies arrive.
        self.try_advance_commit(state);
        Some((index, term))
    }

    /// Point-in-time snapshot of `(current_term, is_leader)`.
    pub fn status(&self) -> (Term, bool) {
        let state = self.core.state.lock().unwrap();
        (state.current_term, matches!(state.role, Role::Leader(_)))
    }

    /// Idempotent shutdown hint: stops the timer and the apply pump.
    /// Further RPCs are answered negatively and submissions refused.
    pub fn kill(&self) {
        if self.core.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("{}: shutting down", self.core.me);
        self.core.timer.cancel();
        let _ = self.core.shutdown.send(true);
    }

    pub fn is_killed(&self) -> bool {
        self.core.killed.load(Ordering::SeqCst)
    }

    /// RequestVote RPC handler.
    ///
    /// Grants at most one vote per term, and only to candidates whose log is
    /// at least as up-to-date as ours. The vote is durable before the reply;
    /// an `Err` means the reply must not be sent.
    pub fn handle_request_vote(
        &self,
        args: RequestVote,
    ) -> Result<RequestVoteResponse, PersistError> {
        let mut guard = self.core.state.lock().unwrap();
        let state = &mut *guard;

        if self.is_killed() || args.term < state.current_term {
            return Ok(RequestVoteResponse {
                term: state.current_term,
                vote_granted: false,
            });
        }

        let mut mutated = false;
        if args.term > state.current_term {
            state.current_term = args.term;
            state.voted_for = None;
            state.role = Role::Follower;
            mutated = true;
        }

        let free_to_vote = match state.voted_for {
            None => true,
            Some(candidate) => candidate == args.candidate_id,
        };
        let grant = free_to_vote
            && state.candidate_up_to_date(args.last_log_term, args.last_log_index);

        if grant {
            if state.voted_for != Some(args.candidate_id) {
                mutated = true;
            }
            state.voted_for = Some(args.candidate_id);
            info!(
                "{}: voting for {} at {}",
                self.core.me, args.candidate_id, state.current_term
            );
            // Granting a vote is the only activity here that resets the
            // election timer.
            self.core.timer.arm(self.election_timeout());
        }

        if mutated {
            self.persist(state)?;
        }
        Ok(RequestVoteResponse {
            term: state.current_term,
            vote_granted: grant,
        })
    }

    /// AppendEntries RPC handler (§5.3): the log-match check, conflict
    /// truncation, and commit advance. Heartbeats are the empty-entries
    /// case of the same flow. An `Err` means the reply must not be sent.
    pub fn handle_append_entries(
        &self,
        args: AppendEntries<Cmd>,
    ) -> Result<AppendEntriesResponse, PersistError> {
        let mut guard = self.core.state.lock().unwrap();
        let state = &mut *guard;

        if self.is_killed() || args.term < state.current_term {
            return Ok(AppendEntriesResponse {
                term: state.current_term,
                success: false,
                match_index: LogIndex::ZERO,
            });
        }

        // A current-or-newer-term AppendEntries is the only valid-leader
        // signal: fall in line and push back the election timer.
        let mut mutated = false;
        if state.current_term != args.term {
            state.current_term = args.term;
            mutated = true;
        }
        if state.voted_for.is_some() {
            state.voted_for = None;
            mutated = true;
        }
        if !matches!(state.role, Role::Follower) {
            info!(
                "{}: yielding to leader {} at {}",
                self.core.me, args.leader_id, args.term
            );
            state.role = Role::Follower;
        }
        self.core.timer.arm(self.election_timeout());

        // Log-match check: our entry at prev_log_index must carry
        // prev_log_term. ZERO anchors before the log and always matches.
        let prev_matches = match args.prev_log_index.to_array_index() {
            None => true,
            Some(i) => state.log.get(i).map(|e| e.term) == Some(args.prev_log_term),
        };
        if !prev_matches {
            let hint = state.conflict_hint(args.prev_log_index, args.prev_log_term);
            debug!(
                "{}: log mismatch at {} {}, hinting {hint}",
                self.core.me, args.prev_log_index, args.prev_log_term
            );
            if mutated {
                self.persist(state)?;
            }
            return Ok(AppendEntriesResponse {
                term: state.current_term,
                success: false,
                match_index: hint,
            });
        }

        let appended = !args.entries.is_empty();
        if appended {
            // Drop everything past the matching prefix and splice in the
            // leader's entries.
            state.log.truncate(args.prev_log_index.get() as usize);
            state.log.extend(args.entries);
            mutated = true;
        }

        let mut commit_advanced = false;
        if args.leader_commit > state.commit_index {
            state.commit_index = args.leader_commit.min(state.last_log_index());
            commit_advanced = true;
        }

        if mutated {
            self.persist(state)?;
        }
        if commit_advanced {
            self.core.apply_notify.notify_one();
        }
        Ok(AppendEntriesResponse {
            term: state.current_term,
            success: true,
            match_index: if appended {
                state.last_log_index()
            } else {
                args.prev_log_index
            },
        })
    }

    // -- election engine --

    async fn timer_loop(self) {
        let mut shutdown = self.core.shutdown.subscribe();
        loop {
            if self.is_killed() {
                return;
            }
            tokio::select! {
                () = self.core.timer.fired() => {
                    if self.is_killed() {
                        return;
                    }
                    self.on_timer();
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Timer fired: leaders fan out heartbeats, everyone else campaigns.
    fn on_timer(&self) {
        let mut guard = self.core.state.lock().unwrap();
        let state = &mut *guard;
        match state.role {
            Role::Leader(_) => {
                self.broadcast_append_entries(state);
                self.core.timer.arm(self.core.config.heartbeat_interval);
            }
            Role::Follower | Role::Candidate { .. } => self.start_election(state),
        }
    }

    /// §5.2: convert to candidate, bump the term, vote for ourselves, and
    /// solicit votes from every other peer.
    fn start_election(&self, state: &mut PeerState<Cmd>) {
        state.current_term = state.current_term.next();
        state.voted_for = Some(self.core.me);
        state.role = Role::Candidate { votes_granted: 1 };
        info!(
            "{}: starting election at {}",
            self.core.me, state.current_term
        );
        if let Err(err) = self.persist(state) {
            self.fatal(err);
            return;
        }

        // A single-peer cluster's own vote is already a majority.
        if 1 >= self.majority() {
            self.become_leader(state);
            return;
        }

        let args = RequestVote {
            term: state.current_term,
            candidate_id: self.core.me,
            last_log_index: state.last_log_index(),
            last_log_term: state.last_log_term(),
        };
        for to in self.other_peers() {
            let peer = self.clone();
            let args = args.clone();
            tokio::spawn(async move {
                if let Some(reply) = peer.core.transport.request_vote(to, args).await {
                    peer.on_vote_reply(reply);
                }
            });
        }
        self.core.timer.arm(self.election_timeout());
    }

    fn on_vote_reply(&self, reply: RequestVoteResponse) {
        let mut guard = self.core.state.lock().unwrap();
        let state = &mut *guard;
        if self.is_killed() {
            return;
        }
        if reply.term > state.current_term {
            self.step_down(state, reply.term);
            return;
        }
        if reply.term < state.current_term || !reply.vote_granted {
            return;
        }
        let votes = match &mut state.role {
            Role::Candidate { votes_granted } => {
                *votes_granted += 1;
                *votes_granted
            }
            _ => return,
        };
        if votes >= self.majority() {
            self.become_leader(state);
        }
    }

    /// Promotion: initialize the replication bookkeeping and send an
    /// immediate heartbeat volley so followers learn of the new reign
    /// before their timers expire.
    fn become_leader(&self, state: &mut PeerState<Cmd>) {
        info!(
            "{}: elected leader at {} with {} log entries",
            self.core.me,
            state.current_term,
            state.log.len()
        );
        state.role = Role::Leader(LeaderState::new(
            self.core.cluster_size,
            state.last_log_index(),
        ));
        self.broadcast_append_entries(state);
        self.core.timer.arm(self.core.config.heartbeat_interval);
    }

    /// Observed a higher term: adopt it, clear the vote, fall back to
    /// follower.
    fn step_down(&self, state: &mut PeerState<Cmd>, term: Term) {
        info!("{}: stepping down, observed {}", self.core.me, term);
        state.current_term = term;
        state.voted_for = None;
        state.role = Role::Follower;
        if let Err(err) = self.persist(state) {
            self.fatal(err);
            return;
        }
        self.core.timer.arm(self.election_timeout());
    }

    // -- replication engine --

    fn broadcast_append_entries(&self, state: &PeerState<Cmd>) {
        let Role::Leader(leader) = &state.role else {
            return;
        };
        for to in self.other_peers() {
            self.send_append_entries(state, leader, to);
        }
    }

    /// Snapshot the arguments for one follower under the lock and dispatch
    /// the call on a background task; the RPC itself runs with the lock
    /// released.
    fn send_append_entries(&self, state: &PeerState<Cmd>, leader: &LeaderState, to: PeerId) {
        let next = leader.next_index[to.get()];
        let prev_log_index = next.prev();
        let prev_log_term = state.term_at(prev_log_index).unwrap_or(Term::ZERO);
        let from = next.to_array_index().unwrap_or(0);
        let entries: Vec<Entry<Cmd>> = state.log.get(from..).unwrap_or(&[]).to_vec();
        let args = AppendEntries {
            term: state.current_term,
            leader_id: self.core.me,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: state.commit_index,
        };

        let peer = self.clone();
        tokio::spawn(async move {
            if let Some(reply) = peer.core.transport.append_entries(to, args).await {
                peer.on_append_reply(to, reply);
            }
        });
    }

    fn on_append_reply(&self, from: PeerId, reply: AppendEntriesResponse) {
        let mut guard = self.core.state.lock().unwrap();
        let state = &mut *guard;
        if self.is_killed() {
            return;
        }
        if reply.term > state.current_term {
            self.step_down(state, reply.term);
            return;
        }
        {
            let Role::Leader(leader) = &mut state.role else {
                return;
            };
            if reply.term < state.current_term {
                return;
            }
            if reply.success {
                leader.match_index[from.get()] = reply.match_index;
            } else {
                debug!(
                    "{}: {from} rejected entries, backing off to {}",
                    self.core.me,
                    reply.match_index.next()
                );
            }
            leader.next_index[from.get()] = reply.match_index.next();
        }

        if reply.success {
            self.try_advance_commit(state);
        } else {
            // Retry immediately with the regressed next index rather than
            // waiting out a heartbeat interval.
            let Role::Leader(leader) = &state.role else {
                return;
            };
            self.send_append_entries(state, leader, from);
        }
    }

    /// Advance the commit index as far as the majority rule allows and wake
    /// the apply pump.
    fn try_advance_commit(&self, state: &mut PeerState<Cmd>) {
        let Role::Leader(leader) = &state.role else {
            return;
        };
        if let Some(index) = state.commit_candidate(leader, self.core.me, self.core.cluster_size)
        {
            debug!("{}: commit index -> {index}", self.core.me);
            state.commit_index = index;
            self.core.apply_notify.notify_one();
        }
    }

    // -- apply pump --

    /// Deliver committed entries to the consumer in index order, exactly
    /// once, without holding the peer lock across the channel send.
    async fn apply_loop(self) {
        let mut shutdown = self.core.shutdown.subscribe();
        loop {
            if self.is_killed() {
                return;
            }
            tokio::select! {
                () = self.core.apply_notify.notified() => {}
                _ = shutdown.changed() => return,
            }
            loop {
                let batch = self.take_committed();
                if batch.is_empty() {
                    break;
                }
                for msg in batch {
                    if self.core.apply_tx.send(msg).await.is_err() {
                        // Consumer went away; nothing left to deliver to.
                        return;
                    }
                }
            }
        }
    }

    /// Advance `last_applied` up to the (clamped) commit index and hand back
    /// the corresponding envelopes.
    fn take_committed(&self) -> Vec<ApplyMsg<Cmd>> {
        let mut guard = self.core.state.lock().unwrap();
        let state = &mut *guard;
        if state.commit_index > state.last_log_index() {
            state.commit_index = state.last_log_index();
        }
        let mut batch = Vec::new();
        while state.last_applied < state.commit_index {
            state.last_applied = state.last_applied.next();
            let entry = state
                .last_applied
                .to_array_index()
                .and_then(|i| state.log.get(i));
            match entry {
                Some(entry) => batch.push(ApplyMsg {
                    index: state.last_applied,
                    command: entry.command.clone(),
                    use_snapshot: false,
                    snapshot: Vec::new(),
                }),
                None => break,
            }
        }
        batch
    }

    // -- shared plumbing --

    /// Flush the durable fields. Every mutation of `current_term`,
    /// `voted_for`, or the log must hit stable storage before any reply or
    /// action that depends on it.
    fn persist(&self, state: &PeerState<Cmd>) -> Result<(), PersistError> {
        let blob =
            PersistentState::pack(state.current_term, state.voted_for, &state.log).encode()?;
        self.core.persister.save(&blob)
    }

    /// A failed save means the peer can no longer guarantee safety: halt.
    fn fatal(&self, err: PersistError) {
        error!("{}: persistence failure, halting: {err}", self.core.me);
        self.kill();
    }

    fn majority(&self) -> usize {
        self.core.cluster_size / 2 + 1
    }

    fn other_peers(&self) -> impl Iterator<Item = PeerId> {
        let me = self.core.me;
        (0..self.core.cluster_size)
            .map(PeerId::new)
            .filter(move |&p| p != me)
    }

    fn election_timeout(&self) -> Duration {
        let min = self.core.config.election_timeout_min;
        let span = self
            .core
            .config
            .election_timeout_max
            .saturating_sub(min)
            .as_millis() as u64;
        if span == 0 {
            min
        } else {
            min + Duration::from_millis(rand::rng().random_range(0..span))
        }
    }

    #[cfg(test)]
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&PeerState<Cmd>) -> R) -> R {
        f(&self.core.state.lock().unwrap())
    }
}
