use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;

/// Kind of advisory lock taken on a lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    Shared,
    Exclusive,
}

/// An advisory lock on `<dir>/<name>`, held until dropped.
///
/// Stores lock on demand: the guard is taken around a single logical
/// operation, so several processes sharing a store can interleave.
#[derive(Debug)]
pub(crate) struct FileLock {
    file: File,
    path: Utf8PathBuf,
}

impl FileLock {
    pub(crate) fn acquire(path: &Utf8Path, mode: LockMode) -> Result<Self, (Utf8PathBuf, io::Error)> {
        let open = || -> io::Result<File> {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(path)
        };

        let file = open().map_err(|e| (path.to_path_buf(), e))?;

        let locked = match mode {
            LockMode::Shared => FileExt::lock_shared(&file),
            LockMode::Exclusive => FileExt::lock_exclusive(&file),
        };
        locked.map_err(|e| (path.to_path_buf(), e))?;

        tracing::trace!(path = %path, ?mode, "acquired lock");

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::debug!(path = %self.path, "couldn't release lock: {e}");
        }
    }
}

/// Writes `data` next to `path` and renames it into place, so readers see
/// either the old or the new contents and never a partial write.
///
/// The data is synced before the rename; after a power loss `path` holds one
/// of the two versions, never an empty file.
pub(crate) fn write_atomic(path: &Utf8Path, data: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or(Utf8Path::new("."));
    fs::create_dir_all(dir)?;

    let name = path.file_name().unwrap_or("entry");
    let tmp = dir.join(format!(".{name}.{}.tmp", std::process::id()));

    let write = || -> io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };

    let result = write();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_replaces() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        let path = dir.join("nested/record.cbor");

        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"two");
        let leftovers = fs::read_dir(dir.join("nested")).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_shared_locks_coexist() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        let path = dir.join("store.lock");

        let a = FileLock::acquire(&path, LockMode::Shared).unwrap();
        let b = FileLock::acquire(&path, LockMode::Shared).unwrap();
        drop((a, b));

        let _c = FileLock::acquire(&path, LockMode::Exclusive).unwrap();
    }
}
