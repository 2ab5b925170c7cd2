// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crawler::input::FileId;

/// Default number of leading bytes kept per file
pub const DEFAULT_FINGERPRINT_SIZE: usize = 1000;

/// The first bytes of a file's content.
///
/// An identity whose inode was freed and handed to a new file keeps its
/// FileId; the fingerprint tells the two contents apart. Persisted as base64.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    first_bytes: Vec<u8>,
}

impl Fingerprint {
    /// Read up to `size` bytes from the start of `file`
    pub fn from_file(file: &mut File, size: usize) -> io::Result<Self> {
        file.seek(SeekFrom::Start(0))?;

        let mut buf = Vec::with_capacity(size);
        file.by_ref().take(size as u64).read_to_end(&mut buf)?;

        Ok(Self { first_bytes: buf })
    }

    /// Fingerprint of the file at `path`, as long as it is still `expected`.
    ///
    /// Returns `Ok(None)` when the path now holds another identity.
    pub fn from_path(path: &Path, expected: FileId, size: usize) -> io::Result<Option<Self>> {
        let mut file = File::open(path)?;
        match FileId::from_file(&file) {
            Ok(id) if id != expected => return Ok(None),
            Ok(_) => {}
            // No handle based identity on this platform, trust the path
            Err(e) if e.kind() == io::ErrorKind::Unsupported => {}
            Err(e) => return Err(e),
        }
        Self::from_file(&mut file, size).map(Some)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { first_bytes: bytes }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.first_bytes
    }

    pub fn len(&self) -> usize {
        self.first_bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_bytes.is_empty()
    }

    /// Whether both fingerprints agree on the bytes they have in common.
    ///
    /// A file that only grew keeps matching its older, shorter fingerprint.
    /// An empty fingerprint matches anything.
    pub fn matches(&self, other: &Fingerprint) -> bool {
        let n = self.len().min(other.len());
        self.first_bytes[..n] == other.first_bytes[..n]
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.first_bytes))
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Self::from_bytes)
            .map_err(serde::de::Error::custom)
    }
}
