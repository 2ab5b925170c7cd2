// SPDX-License-Identifier: Apache-2.0

//! Platform-independent file identity.
//!
//! Unix uses device + inode and Windows uses volume serial + file index; both
//! survive renames, which is what lets a rotated file keep its offset.
//! Other platforms fall back to a path + creation-time heuristic, see
//! [`FileId::fallback`].

use serde::{Deserialize, Serialize};
use std::fs::{File, Metadata};
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Device value marking a fallback (heuristic) identity.
pub const FALLBACK_DEV: u64 = u64::MAX;

/// A stable identifier for a physical file, independent of its current path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId {
    /// Device ID (Unix) or volume serial number (Windows)
    dev: u64,
    /// Inode number (Unix) or file index (Windows)
    ino: u64,
}

impl FileId {
    /// Create a FileId from raw device and inode values.
    /// Used for loading persisted state.
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }

    /// Identity of an already opened file.
    #[cfg(unix)]
    pub fn from_file(file: &File) -> io::Result<Self> {
        Ok(Self::from_metadata(&file.metadata()?))
    }

    #[cfg(unix)]
    fn from_metadata(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    /// Identity of an already opened file.
    #[cfg(windows)]
    pub fn from_file(file: &File) -> io::Result<Self> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::HANDLE;
        use windows_sys::Win32::Storage::FileSystem::{
            BY_HANDLE_FILE_INFORMATION, GetFileInformationByHandle,
        };

        let handle = file.as_raw_handle() as HANDLE;
        let mut info: BY_HANDLE_FILE_INFORMATION = unsafe { std::mem::zeroed() };

        let result = unsafe { GetFileInformationByHandle(handle, &mut info) };
        if result == 0 {
            return Err(io::Error::last_os_error());
        }

        let file_index = ((info.nFileIndexHigh as u64) << 32) | (info.nFileIndexLow as u64);

        Ok(Self {
            dev: info.dwVolumeSerialNumber as u64,
            ino: file_index,
        })
    }

    /// Identity of the file currently at `path`.
    ///
    /// On Unix this only stats the path; Windows has to open the file.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::from_path_with_metadata(path).map(|(id, _)| id)
    }

    /// Identity and metadata of the file currently at `path`.
    pub fn from_path_with_metadata(path: impl AsRef<Path>) -> io::Result<(Self, Metadata)> {
        let path = path.as_ref();

        #[cfg(unix)]
        {
            let metadata = std::fs::metadata(path)?;
            Ok((Self::from_metadata(&metadata), metadata))
        }

        #[cfg(windows)]
        {
            let file = File::open(path)?;
            let metadata = file.metadata()?;
            Ok((Self::from_file(&file)?, metadata))
        }

        #[cfg(not(any(unix, windows)))]
        {
            let metadata = std::fs::metadata(path)?;
            Ok((Self::fallback(path, &metadata), metadata))
        }
    }

    /// Heuristic identity for platforms without inode-like metadata.
    ///
    /// Built from the path and the creation time (modification time when the
    /// platform has no creation time). This is weaker than a real identity: a
    /// renamed file looks like a new one, and a file rotated and recreated
    /// within the timestamp resolution looks like the old one.
    pub fn fallback(path: &Path, metadata: &Metadata) -> Self {
        let stamp = metadata
            .created()
            .or_else(|_| metadata.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let path_hash = crc32fast::hash(path.to_string_lossy().as_bytes()) as u64;

        Self {
            dev: FALLBACK_DEV,
            ino: (path_hash << 32) | (stamp & 0xffff_ffff),
        }
    }

    /// Whether this identity came from the path heuristic.
    pub fn is_fallback(&self) -> bool {
        self.dev == FALLBACK_DEV
    }

    /// Get the device ID (Unix) or volume serial number (Windows).
    pub fn dev(&self) -> u64 {
        self.dev
    }

    /// Get the inode number (Unix) or file index (Windows).
    pub fn ino(&self) -> u64 {
        self.ino
    }
}

#[cfg(not(any(unix, windows)))]
impl FileId {
    /// Identity of an already opened file.
    ///
    /// Without a path there is nothing to build the heuristic from.
    pub fn from_file(_file: &File) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "file identity requires a path on this platform",
        ))
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

/// Get the current path of an open file handle.
///
/// Used to follow a file after it has been renamed away from its original path.
/// If the file was deleted but the handle is still open, this returns an error.
#[cfg(target_os = "linux")]
pub fn get_path_from_file<F: std::os::unix::io::AsRawFd>(file: &F) -> io::Result<std::path::PathBuf> {
    let link_path = format!("/proc/self/fd/{}", file.as_raw_fd());
    let path = std::fs::read_link(&link_path)?;

    // The kernel marks unlinked files rather than failing the readlink
    if path.to_string_lossy().ends_with(" (deleted)") {
        return Err(io::Error::new(io::ErrorKind::NotFound, "file was deleted"));
    }

    Ok(path)
}

/// Get the current path of an open file handle.
#[cfg(target_os = "macos")]
pub fn get_path_from_file<F: std::os::unix::io::AsRawFd>(file: &F) -> io::Result<std::path::PathBuf> {
    let fd = file.as_raw_fd();

    let mut buf = vec![0u8; libc::PATH_MAX as usize];
    let result = unsafe { libc::fcntl(fd, libc::F_GETPATH, buf.as_mut_ptr()) };

    if result == -1 {
        return Err(io::Error::last_os_error());
    }

    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let path_str = std::str::from_utf8(&buf[..len])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok(std::path::PathBuf::from(path_str))
}

/// Get the current path of an open file handle.
#[cfg(windows)]
pub fn get_path_from_file<F: std::os::windows::io::AsRawHandle>(
    file: &F,
) -> io::Result<std::path::PathBuf> {
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Storage::FileSystem::{
        FILE_NAME_NORMALIZED, GetFinalPathNameByHandleW,
    };

    let handle = file.as_raw_handle() as HANDLE;

    let size =
        unsafe { GetFinalPathNameByHandleW(handle, std::ptr::null_mut(), 0, FILE_NAME_NORMALIZED) };

    if size == 0 {
        return Err(io::Error::last_os_error());
    }

    let mut buf: Vec<u16> = vec![0; size as usize];
    let result = unsafe {
        GetFinalPathNameByHandleW(
            handle,
            buf.as_mut_ptr(),
            buf.len() as u32,
            FILE_NAME_NORMALIZED,
        )
    };

    if result == 0 {
        return Err(io::Error::last_os_error());
    }

    // Strip the \\?\ prefix
    let path = String::from_utf16_lossy(&buf[..result as usize]);
    let path = path.strip_prefix(r"\\?\").unwrap_or(&path);
    Ok(std::path::PathBuf::from(path))
}

/// Get the current path of an open file handle.
#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
pub fn get_path_from_file<F>(_file: &F) -> io::Result<std::path::PathBuf> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "resolving the path of an open file is not supported on this platform",
    ))
}
