//! Loose blob files
//!
//! Each file-placed value is one file under `data/`. Writes go to a hidden
//! temp file first and are renamed into place, so a reader never observes a
//! half-written blob. Bulk deletion moves the whole `data/` directory into
//! `trash/` and empties the trash on a background thread.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{debug, warn};
use uuid::Uuid;

const DATA_DIR: &str = "data";
const TRASH_DIR: &str = "trash";
const TEMP_PREFIX: &str = ".tmp-";

/// Directory of blob files plus its trash
#[derive(Debug, Clone)]
pub struct BlobStore {
    data_dir: PathBuf,
    trash_dir: PathBuf,
}

impl BlobStore {
    /// Open the blob directories under `root`, creating them if needed
    pub fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref();
        let store = Self {
            data_dir: root.join(DATA_DIR),
            trash_dir: root.join(TRASH_DIR),
        };
        fs::create_dir_all(&store.data_dir)?;
        fs::create_dir_all(&store.trash_dir)?;
        Ok(store)
    }

    pub fn trash_dir(&self) -> &Path {
        &self.trash_dir
    }

    pub fn path_of(&self, filename: &str) -> PathBuf {
        self.data_dir.join(filename)
    }

    /// Write `value` to `filename`, replacing any existing file
    pub fn write(&self, filename: &str, value: &[u8]) -> io::Result<()> {
        let temp = self.stage(value)?;
        self.commit(&temp, filename)
    }

    /// Write `value` to a fresh temp file under `data/`
    ///
    /// The returned path is not a blob until passed to [`Self::commit`].
    /// Nothing is left on disk if the write fails.
    pub fn stage(&self, value: &[u8]) -> io::Result<PathBuf> {
        let temp_path = self
            .data_dir
            .join(format!("{TEMP_PREFIX}{}", Uuid::new_v4().simple()));

        let result = fs::File::create(&temp_path).and_then(|mut file| {
            file.write_all(value)?;
            file.flush()
        });
        match result {
            Ok(()) => Ok(temp_path),
            Err(e) => {
                self.discard(&temp_path);
                Err(e)
            }
        }
    }

    /// Rename a staged file over `filename`; the temp file is removed on failure
    pub fn commit(&self, temp_path: &Path, filename: &str) -> io::Result<()> {
        fs::rename(temp_path, self.path_of(filename)).inspect_err(|_| self.discard(temp_path))
    }

    /// Drop a staged file that will not be committed
    pub fn discard(&self, temp_path: &Path) {
        debug_assert!(temp_path.starts_with(&self.data_dir));
        match fs::remove_file(temp_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove temp file {:?}: {}", temp_path, e),
        }
    }

    pub fn read(&self, filename: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path_of(filename))
    }

    /// Delete a blob; a missing file is not an error
    pub fn delete(&self, filename: &str) -> io::Result<()> {
        match fs::remove_file(self.path_of(filename)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete several blobs, logging failures
    ///
    /// Returns the number of files that could not be deleted.
    pub fn delete_many<S: AsRef<str>>(&self, filenames: &[S]) -> usize {
        let mut failed = 0;
        for name in filenames {
            if let Err(e) = self.delete(name.as_ref()) {
                warn!("Failed to delete blob {}: {}", name.as_ref(), e);
                failed += 1;
            }
        }
        failed
    }

    pub fn exists(&self, filename: &str) -> bool {
        self.path_of(filename).is_file()
    }

    /// Names of every blob file, including leftover temp files
    pub fn list(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    /// Check if a listed name is an unfinished write
    pub fn is_temp_name(name: &str) -> bool {
        name.starts_with(TEMP_PREFIX)
    }

    /// Move every blob into the trash and start over with an empty `data/`
    pub fn delete_all(&self) -> io::Result<()> {
        let target = self.trash_dir.join(Uuid::new_v4().simple().to_string());
        fs::create_dir_all(&self.trash_dir)?;
        match fs::rename(&self.data_dir, &target) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::create_dir_all(&self.data_dir)
    }

    /// Remove everything under `trash/` on the calling thread
    pub fn empty_trash(&self) -> io::Result<()> {
        empty_dir(&self.trash_dir)
    }

    /// Remove everything under `trash/` on a detached thread
    pub fn empty_trash_in_background(&self) {
        let trash = self.trash_dir.clone();
        let spawned = thread::Builder::new()
            .name("tiercache-trash".to_string())
            .spawn(move || {
                if let Err(e) = empty_dir(&trash) {
                    warn!("Failed to empty trash {:?}: {}", trash, e);
                }
            });
        if let Err(e) = spawned {
            warn!("Failed to spawn trash thread: {}", e);
        }
    }
}

fn empty_dir(dir: &Path) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let mut removed = 0usize;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let result = if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    debug!("Emptied {} entries from {:?}", removed, dir);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_read_delete() {
        let dir = tempdir().unwrap();
        let blobs = BlobStore::open(dir.path()).unwrap();

        blobs.write("abc", b"payload").unwrap();
        assert!(blobs.exists("abc"));
        assert_eq!(blobs.read("abc").unwrap(), b"payload");

        blobs.write("abc", b"second").unwrap();
        assert_eq!(blobs.read("abc").unwrap(), b"second");

        blobs.delete("abc").unwrap();
        assert!(!blobs.exists("abc"));
        // Deleting again is fine
        blobs.delete("abc").unwrap();
        assert_eq!(blobs.read("abc").unwrap_err().kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_write_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let blobs = BlobStore::open(dir.path()).unwrap();

        for i in 0..5 {
            blobs.write(&format!("f{i}"), &[i; 64]).unwrap();
        }
        let mut names = blobs.list().unwrap();
        names.sort();
        assert_eq!(names, vec!["f0", "f1", "f2", "f3", "f4"]);
        assert!(names.iter().all(|n| !BlobStore::is_temp_name(n)));
    }

    #[test]
    fn test_failed_write_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let blobs = BlobStore::open(dir.path()).unwrap();

        // A directory in the way makes the final rename fail
        fs::create_dir(blobs.path_of("taken")).unwrap();
        assert!(blobs.write("taken", b"payload").is_err());

        let leftovers: Vec<_> = fs::read_dir(dir.path().join(DATA_DIR))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftovers, vec!["taken"]);
        assert!(blobs.list().unwrap().is_empty());
    }

    #[test]
    fn test_discarded_stage_is_removed() {
        let dir = tempdir().unwrap();
        let blobs = BlobStore::open(dir.path()).unwrap();

        let temp = blobs.stage(b"payload").unwrap();
        assert!(BlobStore::is_temp_name(
            temp.file_name().unwrap().to_str().unwrap()
        ));
        assert_eq!(fs::read(&temp).unwrap(), b"payload");

        blobs.discard(&temp);
        assert!(!temp.exists());
        assert!(blobs.list().unwrap().is_empty());
        // Discarding twice is quiet
        blobs.discard(&temp);
    }

    #[test]
    fn test_delete_many_counts_failures() {
        let dir = tempdir().unwrap();
        let blobs = BlobStore::open(dir.path()).unwrap();

        blobs.write("a", b"1").unwrap();
        assert_eq!(blobs.delete_many(&["a", "missing"]), 0);
        assert!(blobs.list().unwrap().is_empty());
    }

    #[test]
    fn test_delete_all_and_empty_trash() {
        let dir = tempdir().unwrap();
        let blobs = BlobStore::open(dir.path()).unwrap();

        blobs.write("a", b"1").unwrap();
        blobs.write("b", b"2").unwrap();
        blobs.delete_all().unwrap();

        assert!(blobs.list().unwrap().is_empty());
        assert_eq!(fs::read_dir(blobs.trash_dir()).unwrap().count(), 1);

        blobs.empty_trash().unwrap();
        assert_eq!(fs::read_dir(blobs.trash_dir()).unwrap().count(), 0);

        // Still usable afterwards
        blobs.write("c", b"3").unwrap();
        assert_eq!(blobs.read("c").unwrap(), b"3");
    }
}
