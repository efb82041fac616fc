use serde::{Deserialize, Serialize};

use super::primitives::{LogIndex, Term};

/// A single entry in the replicated log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry<Cmd> {
    pub term: Term,
    pub command: Cmd,
}

/// Envelope delivered to the host consumer for each committed entry, in
/// strictly ascending index order.
///
/// `use_snapshot` and `snapshot` are reserved for a future log-compaction
/// layer and are always `false`/empty here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyMsg<Cmd> {
    /// 1-origin index of the committed entry.
    pub index: LogIndex,
    pub command: Cmd,
    pub use_snapshot: bool,
    pub snapshot: Vec<u8>,
}
