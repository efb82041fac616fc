use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonically increasing term number.
///
/// Terms act as logical clocks in Raft and are used to detect stale
/// information. Term 0 represents the initial state before any election.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Term(u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub const fn new(value: u64) -> Term {
        Term(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Term {
        Term(self.0.saturating_add(1))
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl From<u64> for Term {
    fn from(value: u64) -> Self {
        Term(value)
    }
}

/// 1-based log index.
///
/// `LogIndex::ZERO` represents "no entries" or "before the first entry";
/// valid log entries start at index 1. This is also the externally reported
/// index space: the first committed entry is delivered as index 1.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogIndex(u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);
    pub const FIRST: LogIndex = LogIndex(1);

    pub const fn new(value: u64) -> LogIndex {
        LogIndex(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Create from array length (0-based length becomes the 1-based index of
    /// the last entry).
    pub const fn from_length(len: usize) -> LogIndex {
        LogIndex(len as u64)
    }

    pub const fn next(self) -> LogIndex {
        LogIndex(self.0.saturating_add(1))
    }

    /// Previous index, saturating at `ZERO`.
    pub const fn prev(self) -> LogIndex {
        LogIndex(self.0.saturating_sub(1))
    }

    /// True for indices that can name an actual entry (anything but `ZERO`).
    pub const fn is_entry(self) -> bool {
        self.0 > 0
    }

    /// Convert to a 0-based array index. Returns `None` for `ZERO`.
    pub const fn to_array_index(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some((self.0 - 1) as usize)
        }
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

impl From<u64> for LogIndex {
    fn from(value: u64) -> Self {
        LogIndex(value)
    }
}

/// Unique server identifier: the peer's position in the fixed, ordered peer
/// table shared by every member of the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(usize);

impl PeerId {
    pub const fn new(value: usize) -> PeerId {
        PeerId(value)
    }

    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

impl From<usize> for PeerId {
    fn from(value: usize) -> Self {
        PeerId(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_increments() {
        assert_eq!(Term::ZERO.next(), Term::new(1));
        assert!(Term::new(2) > Term::new(1));
    }

    #[test]
    fn log_index_array_conversion() {
        assert!(LogIndex::ZERO.to_array_index().is_none());
        assert_eq!(LogIndex::FIRST.to_array_index(), Some(0));
        assert_eq!(LogIndex::new(5).to_array_index(), Some(4));
    }

    #[test]
    fn log_index_prev_saturates() {
        assert_eq!(LogIndex::ZERO.prev(), LogIndex::ZERO);
        assert_eq!(LogIndex::new(3).prev(), LogIndex::new(2));
    }

    #[test]
    fn log_index_from_length_names_last_entry() {
        assert_eq!(LogIndex::from_length(0), LogIndex::ZERO);
        assert_eq!(LogIndex::from_length(4), LogIndex::new(4));
    }
}
