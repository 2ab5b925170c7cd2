// SPDX-License-Identifier: Apache-2.0

//! JSON file storage with atomic writes.
//!
//! A write goes to a uniquely named temp file next to the target, is flushed
//! and synced, then renamed over the target. Readers therefore see either the
//! previous complete snapshot or the new one.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::crawler::error::{Error, Result};

/// Read a JSON document, returning `None` when the file does not exist
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::Persistence(format!(
                "failed to open {:?}: {}",
                path, e
            )));
        }
    };

    serde_json::from_reader(BufReader::new(file))
        .map(Some)
        .map_err(|e| {
            Error::Persistence(format!(
                "{:?} is corrupted and cannot be loaded: {}. \
                 To start fresh, delete the file and restart.",
                path, e
            ))
        })
}

/// Write a JSON document atomically (write to temp, then rename)
pub(crate) fn atomic_write<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    use portable_atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Persistence(format!("failed to create parent directory: {}", e))
            })?;
        }
    }

    // Process ID plus a counter keeps concurrent writers off each other's temp file
    let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let temp_path = path.with_extension(format!("tmp.{}.{}", std::process::id(), unique_id));

    let result = write_temp(&temp_path, value).and_then(|()| {
        fs::rename(&temp_path, path)
            .map_err(|e| Error::Persistence(format!("failed to rename snapshot file: {}", e)))
    });

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }

    result
}

fn write_temp<T: Serialize>(temp_path: &Path, value: &T) -> Result<()> {
    let file = File::create(temp_path)
        .map_err(|e| Error::Persistence(format!("failed to create temp file: {}", e)))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .map_err(|e| Error::Persistence(format!("failed to write snapshot: {}", e)))?;

    writer
        .flush()
        .map_err(|e| Error::Persistence(format!("failed to flush snapshot: {}", e)))?;

    // Data must be on disk before the rename makes it visible
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| Error::Persistence(format!("failed to sync snapshot: {}", e)))?;

    Ok(())
}
