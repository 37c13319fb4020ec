//! Directory-backed persistence for data that must survive restarts.

use crate::error::StorageResult;
use crate::persistence::{validate_key, Persistence};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// A persistence backend storing one file per key.
///
/// Each `save` writes the blob to `<key>.tmp`, syncs it and renames it over
/// `<key>.bin`, so a crash mid-save leaves the previous blob intact.
///
/// # Thread Safety
///
/// Saves are serialized by an internal lock; loads read whatever file is
/// currently in place.
///
/// # Example
///
/// ```no_run
/// use tablesync_storage::{DirPersistence, Persistence};
/// use std::path::Path;
///
/// let store = DirPersistence::open(Path::new("sync-state")).unwrap();
/// store.save("pending", b"queued").unwrap();
/// ```
#[derive(Debug)]
pub struct DirPersistence {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl DirPersistence {
    /// Opens a directory, creating it and its parents if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(root: &Path) -> StorageResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.bin"))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.tmp"))
    }
}

impl Persistence for DirPersistence {
    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        match fs::read(self.blob_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        let _guard = self.write_lock.lock();

        let temp = self.temp_path(key);
        {
            let mut file: File = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, self.blob_path(key))?;
        Ok(())
    }
}
