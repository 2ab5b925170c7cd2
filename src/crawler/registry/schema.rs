// SPDX-License-Identifier: Apache-2.0

//! On-disk schema of the registry snapshot.
//!
//! ```json
//! {
//!   "version": 1,
//!   "files": {
//!     "2049:131": {
//!       "path": "/var/log/app.log",
//!       "dev": 2049,
//!       "ino": 131,
//!       "offset": 5120,
//!       "generation": 0,
//!       "last_modified": "2025-01-04T10:00:00Z",
//!       "fingerprint": "MjAyNS0wMS0wNFQxMDowMDowMFogc3RhcnRlZAo="
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crawler::input::{FileId, Fingerprint};

/// Current schema version for the persisted snapshot
pub const REGISTRY_VERSION: u8 = 1;

/// Persisted state for all known files
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedState {
    /// Schema version
    pub version: u8,
    /// Map from file key (dev:ino) to file entry
    pub files: BTreeMap<String, PersistedFileEntry>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            files: BTreeMap::new(),
        }
    }
}

/// Persisted state for a single file identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedFileEntry {
    /// Last known path (informational, identity is dev + ino)
    pub path: String,
    /// Device ID (Unix) or volume serial (Windows)
    pub dev: u64,
    /// Inode number (Unix) or file index (Windows)
    pub ino: u64,
    /// Acknowledged offset (byte position in file)
    pub offset: u64,
    /// Truncation generation the offset belongs to
    #[serde(default)]
    pub generation: u64,
    /// Modification time of the file when last observed
    pub last_modified: DateTime<Utc>,
    /// Leading bytes of the content the offset belongs to, base64
    #[serde(default, skip_serializing_if = "Fingerprint::is_empty")]
    pub fingerprint: Fingerprint,
}

impl PersistedFileEntry {
    pub fn file_id(&self) -> FileId {
        FileId::new(self.dev, self.ino)
    }

    /// Map key for this entry ("dev:ino" format)
    pub fn key(&self) -> String {
        file_id_to_key(self.file_id())
    }
}

/// Generate a map key from a file identity ("dev:ino" format)
pub fn file_id_to_key(file_id: FileId) -> String {
    file_id.to_string()
}
