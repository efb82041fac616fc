use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{Entry, PeerId, Term};

/// Error type for persister operations.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt state blob: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("corrupt state blob: commands/terms length mismatch")]
    LengthMismatch,
}

/// Atomic blob store for a peer's durable state. §5.1, Figure 2 (Persistent
/// state on all servers): currentTerm, votedFor, and the log must survive
/// crashes. `save` must be synchronous and atomic: the peer replies to RPCs
/// only after the state they depend on is durable, and a save failure is
/// fatal to the peer.
pub trait Persister: Send + Sync {
    /// Atomically overwrite the stored blob. Durable before returning.
    fn save(&self, blob: &[u8]) -> Result<(), PersistError>;

    /// The last saved blob, or `None` if nothing was ever saved.
    fn load(&self) -> Result<Option<Vec<u8>>, PersistError>;
}

/// The durable fields in their encoded form: a four-field record in stable
/// order, with the log split into parallel command/term columns.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistentState<Cmd> {
    pub current_term: Term,
    pub voted_for: Option<PeerId>,
    pub commands: Vec<Cmd>,
    pub terms: Vec<Term>,
}

impl<Cmd> PersistentState<Cmd>
where
    Cmd: Clone + Serialize + DeserializeOwned,
{
    /// Snapshot the durable fields out of a live log.
    pub fn pack(current_term: Term, voted_for: Option<PeerId>, log: &[Entry<Cmd>]) -> Self {
        Self {
            current_term,
            voted_for,
            commands: log.iter().map(|e| e.command.clone()).collect(),
            terms: log.iter().map(|e| e.term).collect(),
        }
    }

    /// Rebuild `(current_term, voted_for, log)` from the columns.
    pub fn unpack(self) -> (Term, Option<PeerId>, Vec<Entry<Cmd>>) {
        let log = self
            .terms
            .into_iter()
            .zip(self.commands)
            .map(|(term, command)| Entry { term, command })
            .collect();
        (self.current_term, self.voted_for, log)
    }

    pub fn encode(&self) -> Result<Vec<u8>, PersistError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(blob: &[u8]) -> Result<Self, PersistError> {
        let state: Self = serde_json::from_slice(blob)?;
        if state.commands.len() != state.terms.len() {
            return Err(PersistError::LengthMismatch);
        }
        Ok(state)
    }
}

/// In-memory persister. The blob survives a simulated crash-restart for as
/// long as the `Arc` handed to the replacement peer does.
#[derive(Debug, Default)]
pub struct MemoryPersister {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persister for MemoryPersister {
    fn save(&self, blob: &[u8]) -> Result<(), PersistError> {
        *self.blob.lock().unwrap() = Some(blob.to_vec());
        Ok(())
    }

    fn load(&self) -> Result<Option<Vec<u8>>, PersistError> {
        Ok(self.blob.lock().unwrap().clone())
    }
}

/// Disk-backed persister. The blob lives in a single file inside `dir`,
/// overwritten atomically: write temp file → fsync → rename → fsync dir, so
/// a crash at any point leaves either the old blob or the new one.
#[derive(Debug)]
pub struct FilePersister {
    dir: PathBuf,
}

impl FilePersister {
    /// Open (or create) a persister rooted at `dir`.
    pub fn open(dir: &Path) -> Result<Self, PersistError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn blob_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }
}

impl Persister for FilePersister {
    fn save(&self, blob: &[u8]) -> Result<(), PersistError> {
        let tmp = self.dir.join("state.json.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(blob)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, self.blob_path())?;
        // Fsync the directory so the rename is visible after a crash.
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    fn load(&self) -> Result<Option<Vec<u8>>, PersistError> {
        let path = self.blob_path();
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(&path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogIndex;

    fn sample_state() -> PersistentState<String> {
        PersistentState::pack(
            Term::new(7),
            Some(PeerId::new(2)),
            &[
                Entry {
                    term: Term::new(3),
                    command: "a".to_string(),
                },
                Entry {
                    term: Term::new(7),
                    command: "b".to_string(),
                },
            ],
        )
    }

    #[test]
    fn encode_decode_round_trip() {
        let state = sample_state();
        let blob = state.encode().expect("encode");
        let decoded = PersistentState::<String>::decode(&blob).expect("decode");
        assert_eq!(decoded, state);
    }

    #[test]
    fn pack_unpack_preserves_log_order() {
        let (term, voted_for, log) = sample_state().unpack();
        assert_eq!(term, Term::new(7));
        assert_eq!(voted_for, Some(PeerId::new(2)));
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].command, "a");
        assert_eq!(log[1].term, Term::new(7));
        assert_eq!(LogIndex::from_length(log.len()), LogIndex::new(2));
    }

    #[test]
    fn decode_rejects_mismatched_columns() {
        let blob = br#"{"current_term":1,"voted_for":null,"commands":["a"],"terms":[]}"#;
        assert!(matches!(
            PersistentState::<String>::decode(blob),
            Err(PersistError::LengthMismatch)
        ));
    }

    #[test]
    fn memory_persister_round_trip() {
        let persister = MemoryPersister::new();
        assert!(persister.load().expect("load").is_none());

        persister.save(b"blob-1").expect("save");
        assert_eq!(persister.load().expect("load").as_deref(), Some(&b"blob-1"[..]));

        persister.save(b"blob-2").expect("save");
        assert_eq!(persister.load().expect("load").as_deref(), Some(&b"blob-2"[..]));
    }

    #[test]
    fn file_persister_survives_reopen() {
        let tmp = tempfile::tempdir().expect("tempdir");
        {
            let persister = FilePersister::open(tmp.path()).expect("open");
            persister.save(b"durable").expect("save");
        }
        let persister = FilePersister::open(tmp.path()).expect("reopen");
        assert_eq!(
            persister.load().expect("load").as_deref(),
            Some(&b"durable"[..])
        );
    }

    #[test]
    fn file_persister_overwrites_atomically() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let persister = FilePersister::open(tmp.path()).expect("open");
        persister.save(b"old").expect("save");
        persister.save(b"new").expect("save");
        assert_eq!(persister.load().expect("load").as_deref(), Some(&b"new"[..]));
        // No leftover temp file after a completed save.
        assert!(!tmp.path().join("state.json.tmp").exists());
    }

    #[test]
    fn file_persister_empty_dir_loads_none() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let persister = FilePersister::open(tmp.path()).expect("open");
        assert!(persister.load().expect("load").is_none());
    }
}
