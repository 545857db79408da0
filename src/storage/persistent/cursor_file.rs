//! Crash-safe cursor file.
//!
//! The cursor is written to a temporary file, fsynced, renamed over the
//! committed file and the directory is fsynced, so a crash leaves either the
//! previous or the new cursor on disk.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::cursor::{CursorError, CursorStore, WatchCursor};

use super::codec::{self, FileKind};
use super::file_lock::FileLock;

const CURSOR_FILE: &str = "watch.cursor";
const TEMP_FILE: &str = "watch.cursor.tmp";
const LOCK_FILE: &str = ".cursor.lock";

/// Cursor store backed by a single file in a directory.
#[derive(Debug)]
pub struct FileCursorStore {
    dir: PathBuf,
    _lock: FileLock,
    // serializes writers of the temp file
    write_guard: Mutex<()>,
}

impl FileCursorStore {
    /// Opens the cursor directory, creating it if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CursorError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let lock = FileLock::acquire(&dir, LOCK_FILE)?;

        // A leftover temp file is an interrupted save; the committed file
        // still holds the previous cursor.
        match fs::remove_file(dir.join(TEMP_FILE)) {
            Ok(()) => tracing::debug!(dir = %dir.display(), "removed interrupted cursor write"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            dir,
            _lock: lock,
            write_guard: Mutex::new(()),
        })
    }

    /// Path of the cursor file.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.dir.join(CURSOR_FILE)
    }

    #[cfg(unix)]
    fn sync_dir(&self) -> std::io::Result<()> {
        File::open(&self.dir)?.sync_all()
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> std::io::Result<()> {
        Ok(())
    }
}

impl CursorStore for FileCursorStore {
    fn load(&self) -> Result<Option<WatchCursor>, CursorError> {
        let file = match File::open(self.path()) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader, FileKind::Cursor).map_err(|e| CursorError::Corrupt(e.to_string()))?;
        match codec::read_frame::<WatchCursor>(&mut reader) {
            Ok(Some(cursor)) => Ok(Some(cursor)),
            Ok(None) => Err(CursorError::Corrupt("cursor file has no record".to_string())),
            Err(e) => Err(CursorError::Corrupt(e.to_string())),
        }
    }

    fn save(&self, cursor: &WatchCursor) -> Result<(), CursorError> {
        let _guard = self.write_guard.lock().map_err(|_| CursorError::Poisoned)?;

        let mut bytes = Vec::new();
        codec::write_header(&mut bytes, FileKind::Cursor)?;
        bytes.extend(codec::encode(cursor)?);

        let temp = self.dir.join(TEMP_FILE);
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, self.path())?;
        self.sync_dir()?;
        Ok(())
    }
}
