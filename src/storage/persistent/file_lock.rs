//! Exclusive advisory locks on data directories.
//!
//! The WAL, the cursor file and bus logs each assume a single writer. A
//! named lock file inside the directory keeps a second relay process from
//! opening the same data. The lock is released when the [`FileLock`] is
//! dropped (the OS drops it with the file handle).

use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};

/// Exclusive lock held for the lifetime of the value.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Takes the lock file `name` inside `dir` without blocking.
    ///
    /// # Errors
    /// - `ErrorKind::WouldBlock` if another process holds the lock
    /// - any I/O error creating the lock file
    pub fn acquire(dir: &Path, name: &str) -> IoResult<Self> {
        let path = dir.join(name);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        Self::try_lock(&file).map_err(|e| {
            if e.kind() == ErrorKind::WouldBlock {
                IoError::new(
                    ErrorKind::WouldBlock,
                    format!("{} is held by another relay process", path.display()),
                )
            } else {
                e
            }
        })?;

        tracing::debug!(path = %path.display(), "acquired directory lock");
        Ok(Self { _file: file, path })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> IoResult<()> {
        use std::os::unix::io::AsRawFd;

        // SAFETY: the descriptor is owned by `file` and valid for this call.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(());
        }
        let err = IoError::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Err(IoError::new(ErrorKind::WouldBlock, err));
        }
        Err(err)
    }

    #[cfg(windows)]
    fn try_lock(file: &File) -> IoResult<()> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::HANDLE;
        use windows_sys::Win32::Storage::FileSystem::{
            LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
        };

        let handle = file.as_raw_handle() as HANDLE;
        // SAFETY: the handle is owned by `file`; OVERLAPPED is plain data.
        let result = unsafe {
            let mut overlapped = std::mem::zeroed::<windows_sys::Win32::System::IO::OVERLAPPED>();
            LockFileEx(
                handle,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                1,
                0,
                &mut overlapped,
            )
        };
        if result == 0 {
            return Err(IoError::new(ErrorKind::WouldBlock, IoError::last_os_error()));
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn try_lock(_file: &File) -> IoResult<()> {
        Err(IoError::new(
            ErrorKind::Unsupported,
            "file locking not supported on this platform",
        ))
    }
}
