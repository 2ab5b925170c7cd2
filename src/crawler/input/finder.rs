// SPDX-License-Identifier: Apache-2.0

use glob::{Pattern, glob};
use std::collections::HashSet;
use std::fs::Metadata;
use std::path::PathBuf;
use std::time::SystemTime;

use tracing::debug;

use crate::crawler::error::{Error, Result};
use crate::crawler::input::FileId;

/// A file matched by the include patterns, with its identity at scan time
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    pub path: PathBuf,
    pub file_id: FileId,
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl ResolvedFile {
    fn new(path: PathBuf, file_id: FileId, metadata: &Metadata) -> Self {
        Self {
            path,
            file_id,
            len: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

/// FileFinder finds files matching include patterns while excluding others
#[derive(Debug, Clone)]
pub struct FileFinder {
    include: Vec<String>,
    exclude: Vec<Pattern>,
}

impl FileFinder {
    /// Create a new FileFinder, compiling every pattern up front
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Result<Self> {
        for pattern in &include {
            Pattern::new(pattern).map_err(|e| Error::InvalidGlob(format!("{}: {}", pattern, e)))?;
        }

        let exclude = exclude
            .iter()
            .map(|p| Pattern::new(p).map_err(|e| Error::InvalidGlob(format!("{}: {}", p, e))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { include, exclude })
    }

    /// The include patterns
    pub fn include(&self) -> &[String] {
        &self.include
    }

    fn is_excluded(&self, path: &std::path::Path) -> bool {
        self.exclude.iter().any(|p| p.matches_path(path))
    }

    /// Find all files matching the include patterns, excluding those matching exclude patterns
    pub fn find_files(&self) -> Result<Vec<PathBuf>> {
        let mut seen = HashSet::new();
        let mut paths = Vec::new();

        for pattern in &self.include {
            let matches = glob(pattern).map_err(|e| Error::InvalidGlob(e.to_string()))?;

            for entry in matches {
                let path = match entry {
                    Ok(path) => path,
                    Err(e) => {
                        // Unreadable directories are skipped, the rest of the glob still counts
                        debug!("Skipping unreadable glob entry: {}", e);
                        continue;
                    }
                };

                if path.is_dir() || self.is_excluded(&path) {
                    continue;
                }

                if seen.insert(path.clone()) {
                    paths.push(path);
                }
            }
        }

        Ok(paths)
    }

    /// Find matching files and stat each one.
    ///
    /// A path matched by the glob can disappear before it is stat'ed; such
    /// paths are left out. The same identity can be reached through several
    /// paths (hard links); only the first is kept.
    pub fn resolve(&self) -> Result<Vec<ResolvedFile>> {
        let mut seen_ids = HashSet::new();
        let mut resolved = Vec::new();

        for path in self.find_files()? {
            match FileId::from_path_with_metadata(&path) {
                Ok((file_id, metadata)) => {
                    if seen_ids.insert(file_id) {
                        resolved.push(ResolvedFile::new(path, file_id, &metadata));
                    }
                }
                Err(e) => {
                    debug!("Failed to stat {:?} during scan: {}", path, e);
                }
            }
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup_test_files(dir: &TempDir) {
        for name in ["test1.log", "test2.log", "other.txt", "ignored.log"] {
            fs::write(dir.path().join(name), format!("content of {}\n", name)).unwrap();
        }
    }

    fn finder(include: Vec<String>, exclude: Vec<String>) -> FileFinder {
        FileFinder::new(include, exclude).unwrap()
    }

    #[test]
    fn test_finder_basic() {
        let dir = TempDir::new().unwrap();
        setup_test_files(&dir);

        let pattern = format!("{}/*.log", dir.path().display());
        let files = finder(vec![pattern], vec![]).find_files().unwrap();
        assert_eq!(files.len(), 3); // test1.log, test2.log, ignored.log
    }

    #[test]
    fn test_finder_with_exclude() {
        let dir = TempDir::new().unwrap();
        setup_test_files(&dir);

        let include = format!("{}/*.log", dir.path().display());
        let exclude = format!("{}/ignored.*", dir.path().display());
        let files = finder(vec![include], vec![exclude]).find_files().unwrap();
        assert_eq!(files.len(), 2);
        assert!(!files.iter().any(|p| p.ends_with("ignored.log")));
    }

    #[test]
    fn test_finder_no_duplicates() {
        let dir = TempDir::new().unwrap();
        setup_test_files(&dir);

        let pattern = format!("{}/*.log", dir.path().display());
        let overlapping = format!("{}/test*", dir.path().display());
        let files = finder(vec![pattern, overlapping], vec![])
            .find_files()
            .unwrap();
        assert_eq!(files.len(), 3);
    }

    #[test]
    fn test_finder_rejects_bad_patterns() {
        assert!(matches!(
            FileFinder::new(vec!["/tmp/[".to_string()], vec![]),
            Err(Error::InvalidGlob(_))
        ));
        assert!(matches!(
            FileFinder::new(vec!["/tmp/*.log".to_string()], vec!["[".to_string()]),
            Err(Error::InvalidGlob(_))
        ));
    }

    #[test]
    fn test_finder_skips_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("nested.log")).unwrap();
        fs::write(dir.path().join("real.log"), "x\n").unwrap();

        let pattern = format!("{}/*.log", dir.path().display());
        let files = finder(vec![pattern], vec![]).find_files().unwrap();
        assert_eq!(files, vec![dir.path().join("real.log")]);
    }

    #[test]
    fn test_resolve_reports_identity_and_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "hello\n").unwrap();

        let pattern = format!("{}/*.log", dir.path().display());
        let resolved = finder(vec![pattern], vec![]).resolve().unwrap();

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].path, path);
        assert_eq!(resolved[0].len, 6);
        assert_eq!(resolved[0].file_id, FileId::from_path(&path).unwrap());
        assert!(resolved[0].modified.is_some());
    }

    #[test]
    fn test_finder_discovers_file_created_later() {
        let dir = TempDir::new().unwrap();
        let pattern = format!("{}/*.log", dir.path().display());
        let finder = finder(vec![pattern], vec![]);

        assert!(finder.resolve().unwrap().is_empty());

        fs::write(dir.path().join("first.log"), "first log entry\n").unwrap();
        assert_eq!(finder.resolve().unwrap().len(), 1);
    }
}
