use serde::{Deserialize, Serialize};

use super::log::Entry;
use super::primitives::{LogIndex, PeerId, Term};

/// RequestVote RPC arguments.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: PeerId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments. An empty `entries` vector is a heartbeat.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntries<Cmd> {
    pub term: Term,
    pub leader_id: PeerId,
    /// Index of the entry immediately preceding `entries`; `ZERO` is the
    /// always-matching "before the log" anchor.
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<Entry<Cmd>>,
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// On success, the follower's trailing log index, which becomes the
    /// leader's new `match_index` for it. On failure, the fast-backoff hint:
    /// the latest index at which the follower's log still carries
    /// `prev_log_term` (`ZERO` when no such entry exists), from which the
    /// leader regresses `next_index`.
    pub match_index: LogIndex,
}
