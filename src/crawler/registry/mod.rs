// SPDX-License-Identifier: Apache-2.0

//! Durable mapping from file identity to the last acknowledged read offset.
//!
//! The map lives in memory behind a `RwLock` and is mirrored to disk with
//! [`Registry::persist`]. Offsets only move forward, except through
//! [`Registry::reset_offset`], which also bumps the identity's generation so
//! late acknowledgements for the truncated content are ignored.

mod json_file;
mod schema;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::crawler::error::{Error, Result};
use crate::crawler::event::Acknowledgement;
use crate::crawler::input::{FileId, Fingerprint};

pub use schema::{PersistedFileEntry, PersistedState, REGISTRY_VERSION, file_id_to_key};

/// Tracked state of one file identity
#[derive(Debug, Clone, PartialEq)]
pub struct FileState {
    pub file_id: FileId,
    /// Last known path
    pub path: PathBuf,
    /// Acknowledged offset
    pub offset: u64,
    /// Number of truncation resets seen for this identity
    pub generation: u64,
    /// Modification time of the file when last observed
    pub last_modified: DateTime<Utc>,
    /// Leading bytes of the content `offset` refers to
    pub fingerprint: Fingerprint,
}

impl FileState {
    fn to_entry(&self) -> PersistedFileEntry {
        PersistedFileEntry {
            path: self.path.display().to_string(),
            dev: self.file_id.dev(),
            ino: self.file_id.ino(),
            offset: self.offset,
            generation: self.generation,
            last_modified: self.last_modified,
            fingerprint: self.fingerprint.clone(),
        }
    }

    fn from_entry(entry: PersistedFileEntry) -> Self {
        Self {
            file_id: entry.file_id(),
            path: PathBuf::from(entry.path),
            offset: entry.offset,
            generation: entry.generation,
            last_modified: entry.last_modified,
            fingerprint: entry.fingerprint,
        }
    }
}

#[derive(Debug)]
pub struct Registry {
    /// Snapshot location, `None` for an in-memory registry
    path: Option<PathBuf>,
    files: RwLock<HashMap<FileId, FileState>>,
    /// Serializes snapshot writes so an older snapshot never replaces a newer one
    persist_lock: Mutex<()>,
}

impl Registry {
    /// Open the registry at `path`, seeding it from the snapshot if one exists.
    ///
    /// A snapshot that exists but cannot be parsed is an error: starting empty
    /// would silently re-read or skip data.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let state: PersistedState = json_file::read_json(&path)?.unwrap_or_default();
        if state.version > REGISTRY_VERSION {
            return Err(Error::Persistence(format!(
                "registry snapshot {:?} has version {}, newest supported is {}",
                path, state.version, REGISTRY_VERSION
            )));
        }

        let files: HashMap<FileId, FileState> = state
            .files
            .into_values()
            .map(FileState::from_entry)
            .map(|s| (s.file_id, s))
            .collect();

        info!(path = ?path, known_files = files.len(), "Registry loaded");

        Ok(Self {
            path: Some(path),
            files: RwLock::new(files),
            persist_lock: Mutex::new(()),
        })
    }

    /// Create a registry that is never written to disk (useful for testing)
    pub fn in_memory() -> Self {
        Self {
            path: None,
            files: RwLock::new(HashMap::new()),
            persist_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get_state(&self, file_id: FileId) -> Option<FileState> {
        self.read().get(&file_id).cloned()
    }

    /// Return the state for `file_id`, creating it at offset 0 on first sight
    pub fn get_or_create(
        &self,
        file_id: FileId,
        path: &Path,
        modified: Option<SystemTime>,
    ) -> FileState {
        if let Some(state) = self.get_state(file_id) {
            return state;
        }

        self.write()
            .entry(file_id)
            .or_insert_with(|| {
                debug!(file_id = %file_id, path = ?path, "Registry entry created");
                FileState {
                    file_id,
                    path: path.to_path_buf(),
                    offset: 0,
                    generation: 0,
                    last_modified: to_utc(modified),
                    fingerprint: Fingerprint::default(),
                }
            })
            .clone()
    }

    /// Refresh the informational fields of a known identity
    pub fn observe(&self, file_id: FileId, path: &Path, modified: Option<SystemTime>) {
        if let Some(state) = self.write().get_mut(&file_id) {
            if state.path != path {
                state.path = path.to_path_buf();
            }
            if modified.is_some() {
                state.last_modified = to_utc(modified);
            }
        }
    }

    /// Keep `fingerprint` for `file_id` when it covers more bytes than the
    /// stored one. Callers check that both agree first.
    pub fn record_fingerprint(&self, file_id: FileId, fingerprint: &Fingerprint) -> bool {
        match self.write().get_mut(&file_id) {
            Some(state) if fingerprint.len() > state.fingerprint.len() => {
                state.fingerprint = fingerprint.clone();
                true
            }
            _ => false,
        }
    }

    /// Record an acknowledged offset.
    ///
    /// Offsets never move backwards here; returns whether the stored offset
    /// changed. Unknown identities are ignored.
    pub fn set_offset(&self, file_id: FileId, offset: u64) -> bool {
        match self.write().get_mut(&file_id) {
            Some(state) if offset > state.offset => {
                state.offset = offset;
                true
            }
            _ => false,
        }
    }

    /// Apply an acknowledgement, ignoring it when it belongs to an older
    /// generation than the one currently tracked.
    pub fn acknowledge(&self, ack: &Acknowledgement) -> bool {
        let mut files = self.write();
        let Some(state) = files.get_mut(&ack.file_id) else {
            return false;
        };

        if ack.generation != state.generation {
            debug!(
                file_id = %ack.file_id,
                ack_generation = ack.generation,
                generation = state.generation,
                "Ignoring acknowledgement from a previous generation"
            );
            return false;
        }

        if ack.offset > state.offset {
            state.offset = ack.offset;
            true
        } else {
            false
        }
    }

    /// Reset the offset of `file_id` to 0 after a truncation or when its
    /// content turned out to belong to another file. The fingerprint is
    /// cleared with it.
    ///
    /// Returns the new generation.
    pub fn reset_offset(&self, file_id: FileId) -> u64 {
        let mut files = self.write();
        let state = files.entry(file_id).or_insert_with(|| FileState {
            file_id,
            path: PathBuf::new(),
            offset: 0,
            generation: 0,
            last_modified: Utc::now(),
            fingerprint: Fingerprint::default(),
        });

        state.offset = 0;
        state.fingerprint = Fingerprint::default();
        state.generation += 1;
        state.generation
    }

    /// Copy of every tracked state
    pub fn snapshot(&self) -> Vec<FileState> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Write the full state to disk atomically.
    ///
    /// On failure the in-memory state is untouched, so the next successful
    /// persist still contains every acknowledged offset.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let _guard = self
            .persist_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let state = PersistedState {
            version: REGISTRY_VERSION,
            files: self
                .read()
                .values()
                .map(|s| (file_id_to_key(s.file_id), s.to_entry()))
                .collect(),
        };

        json_file::atomic_write(path, &state)?;
        debug!("Registry persisted with {} files", state.files.len());
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<FileId, FileState>> {
        self.files.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<FileId, FileState>> {
        self.files.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_utc(time: Option<SystemTime>) -> DateTime<Utc> {
    time.map(DateTime::<Utc>::from).unwrap_or_else(Utc::now)
}
