mod log;
mod message;
mod primitives;

pub use self::log::{ApplyMsg, Entry};
pub use self::message::{AppendEntries, AppendEntriesResponse, RequestVote, RequestVoteResponse};
pub use self::primitives::{LogIndex, PeerId, Term};
