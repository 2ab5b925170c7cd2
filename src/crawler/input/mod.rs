// SPDX-License-Identifier: Apache-2.0

mod file_id;
mod finder;
mod fingerprint;

pub use file_id::{FALLBACK_DEV, FileId, get_path_from_file};
pub use finder::{FileFinder, ResolvedFile};
pub use fingerprint::{DEFAULT_FINGERPRINT_SIZE, Fingerprint};
