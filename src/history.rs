//! Persistent execution history.
//!
//! The store remembers, for every task identity, what the task looked like the
//! last time it produced an outcome worth remembering: the fingerprints of its
//! inputs and outputs, the implementation that ran, and where the result came
//! from. The up-to-date check compares the current state against this record.
//!
//! ## Layout
//!
//! ```text
//! <root>/history.lock
//! <root>/records/<blake3(task id)>.cbor
//! ```
//!
//! Every record is written to a temporary file and renamed into place, so a
//! crash while storing leaves the previous record intact. The lock file is
//! locked only around a single load or store.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, ErrorKind};
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::{BuildId, Hash32, TaskId, unix_millis};
use crate::error::HistoryError;
use crate::fingerprint::{Fingerprint, InputFingerprints};
use crate::lock::{FileLock, LockMode, write_atomic};

/// Current schema version. Bump when the record format changes.
const RECORD_VERSION: u32 = 1;

const LOCK_FILE: &str = "history.lock";
const RECORDS_DIR: &str = "records";

/// How the recorded outputs came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordedOutcome {
    Succeeded,
    Failed,
    FromCache,
}

/// Where a recorded result originated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginMetadata {
    pub build_id: BuildId,
    /// How long the producing execution took.
    pub execution_time: Duration,
    /// Milliseconds since the Unix epoch.
    pub recorded_at: u64,
}

impl OriginMetadata {
    pub fn new(build_id: BuildId, execution_time: Duration) -> Self {
        Self {
            build_id,
            execution_time,
            recorded_at: unix_millis(SystemTime::now()),
        }
    }
}

/// What the store remembers about one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHistoryRecord {
    pub inputs: InputFingerprints,
    pub implementation: Hash32,
    pub outputs: BTreeMap<String, Fingerprint>,
    pub origin: OriginMetadata,
    pub outcome: RecordedOutcome,
}

/// On-disk envelope around a record.
#[derive(Serialize, Deserialize)]
struct StoredRecord {
    version: u32,
    task: TaskId,
    record: ExecutionHistoryRecord,
}

/// A file-backed execution history for one scope (e.g. one project).
#[derive(Debug, Clone)]
pub struct ExecutionHistoryStore {
    root: Utf8PathBuf,
}

impl ExecutionHistoryStore {
    /// Opens (creating if needed) the store rooted at `root`.
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, HistoryError> {
        let root = root.into();
        fs::create_dir_all(root.join(RECORDS_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn record_path(&self, task: &TaskId) -> Utf8PathBuf {
        let hash = Hash32::hash(task.as_str());
        self.root
            .join(RECORDS_DIR)
            .join(hash.to_hex())
            .with_extension("cbor")
    }

    fn lock(&self, mode: LockMode) -> Result<FileLock, HistoryError> {
        FileLock::acquire(&self.root.join(LOCK_FILE), mode)
            .map_err(|(path, source)| HistoryError::Lock { path, source })
    }

    /// Loads the record for `task`.
    ///
    /// A record that is missing, unreadable, from another schema version or
    /// that belongs to a different identity is reported as `None`: the task
    /// simply runs again.
    pub fn load(&self, task: &TaskId) -> Option<ExecutionHistoryRecord> {
        let _guard = match self.lock(LockMode::Shared) {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(task = %task, "history unavailable: {e}");
                return None;
            }
        };

        let path = self.record_path(task);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(task = %task, "couldn't read history record {path}: {e}");
                return None;
            }
        };

        match ciborium::from_reader::<StoredRecord, _>(BufReader::new(file)) {
            Ok(stored) if stored.version == RECORD_VERSION && &stored.task == task => {
                Some(stored.record)
            }
            Ok(stored) => {
                tracing::debug!(
                    task = %task,
                    version = stored.version,
                    "discarding history record from another schema or identity"
                );
                None
            }
            Err(e) => {
                tracing::warn!(task = %task, "discarding corrupt history record: {e}");
                None
            }
        }
    }

    /// Replaces the record for `task` atomically.
    pub fn store(&self, task: &TaskId, record: ExecutionHistoryRecord) -> Result<(), HistoryError> {
        let stored = StoredRecord {
            version: RECORD_VERSION,
            task: task.clone(),
            record,
        };

        let mut buffer = Vec::new();
        ciborium::into_writer(&stored, &mut buffer)
            .map_err(|e| HistoryError::Encode(e.to_string()))?;

        let _guard = self.lock(LockMode::Exclusive)?;
        write_atomic(&self.record_path(task), &buffer)?;

        tracing::debug!(task = %task, "stored history record");
        Ok(())
    }

    /// Forgets `task`, so that it runs on the next build.
    pub fn remove(&self, task: &TaskId) -> Result<(), HistoryError> {
        let _guard = self.lock(LockMode::Exclusive)?;
        match fs::remove_file(self.record_path(task)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Forgets every task.
    pub fn clear(&self) -> Result<(), HistoryError> {
        let _guard = self.lock(LockMode::Exclusive)?;
        let records = self.root.join(RECORDS_DIR);
        if records.exists() {
            fs::remove_dir_all(&records)?;
        }
        fs::create_dir_all(&records)?;
        Ok(())
    }
}
