//! Raft consensus peer implementation.
//!
//! Based on:
//! - "In Search of an Understandable Consensus Algorithm" (Ongaro & Ousterhout)
//! - Diego Ongaro's PhD dissertation
//!
//! The crate provides the replicated-state-machine core of a peer: leader
//! election with randomized timeouts, log replication with the log-matching
//! check and fast conflict backoff, the majority-plus-current-term commit
//! rule, and crash-safe persistence of terms, votes, and log entries. The
//! RPC wire, the durable medium, and the application state machine are
//! collaborators behind the [`Transport`], [`Persister`], and apply-channel
//! seams.

pub mod cluster;
pub mod peer;
pub mod persist;
pub mod timer;
pub mod transport;
pub mod types;

pub use cluster::Cluster;
pub use peer::{Peer, TimerConfig};
pub use persist::{FilePersister, MemoryPersister, PersistError, PersistentState, Persister};
pub use timer::ResettableTimer;
pub use transport::{LocalNetwork, Transport};
pub use types::{
    AppendEntries, AppendEntriesResponse, ApplyMsg, Entry, LogIndex, PeerId, RequestVote,
    RequestVoteResponse, Term,
};
