//! On-disk storage namespace.
//!
//! A flat directory treated as a `filename -> bytes` map. Filenames are
//! reduced to their final path segment before touching the filesystem, so a
//! request can never address anything outside the root. No locking is
//! imposed: two connections uploading the same name concurrently race, and
//! the last writer wins.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Flat file namespace rooted at a single directory.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Open a storage namespace, creating the root directory if missing.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!(root = %root.display(), "Storage namespace ready");
        Ok(Self { root })
    }

    /// Resolve a request filename to a path under the root.
    ///
    /// The base-name reduction here is the sole path-traversal defense.
    pub fn resolve(&self, filename: &str) -> PathBuf {
        self.root.join(sanitize_filename(filename))
    }

    /// Create (or truncate) the destination file for an upload.
    pub fn create(&self, filename: &str) -> io::Result<(PathBuf, File)> {
        let path = self.resolve(filename);
        let file = File::create(&path)?;
        debug!(path = %path.display(), "Created upload destination");
        Ok((path, file))
    }

    /// Open a stored file for download, returning its size.
    ///
    /// `Ok(None)` means the name is absent from the namespace.
    pub fn open_for_read(&self, filename: &str) -> io::Result<Option<(File, u64)>> {
        let path = self.resolve(filename);
        match File::open(&path) {
            Ok(file) => {
                let size = file.metadata()?.len();
                Ok(Some((file, size)))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Remove a stored file. `Ok(false)` means it did not exist.
    pub fn remove(&self, filename: &str) -> io::Result<bool> {
        let path = self.resolve(filename);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Removed file");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Best-effort removal of a partial upload; failures are ignored.
    pub fn discard_partial(&self, path: &Path) {
        let _ = fs::remove_file(path);
    }

    /// List regular-file names in the namespace, sorted.
    pub fn list(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Ok(name) = entry.file_name().into_string() {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Reduce a request filename to its final path segment.
///
/// Both separators are stripped regardless of platform so that a name like
/// `..\\secrets` cannot slip through on Unix.
fn sanitize_filename(filename: &str) -> &str {
    filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_sanitize_strips_directories() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("/etc/shadow"), "shadow");
        assert_eq!(sanitize_filename("..\\..\\boot.ini"), "boot.ini");
        assert_eq!(sanitize_filename("plain.txt"), "plain.txt");
    }

    #[test]
    fn test_resolve_stays_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let path = storage.resolve("../../etc/passwd");
        assert_eq!(path, dir.path().join("passwd"));
    }

    #[test]
    fn test_create_write_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let (_, mut file) = storage.create("hello.txt").unwrap();
        file.write_all(b"hello world").unwrap();
        drop(file);

        let (mut file, size) = storage.open_for_read("hello.txt").unwrap().unwrap();
        assert_eq!(size, 11);
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "hello world");
    }

    #[test]
    fn test_open_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        assert!(storage.open_for_read("nope.bin").unwrap().is_none());
    }

    #[test]
    fn test_remove_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        storage.create("b.txt").unwrap();
        storage.create("a.txt").unwrap();
        assert_eq!(storage.list().unwrap(), vec!["a.txt", "b.txt"]);

        assert!(storage.remove("a.txt").unwrap());
        assert!(!storage.remove("a.txt").unwrap());
        assert_eq!(storage.list().unwrap(), vec!["b.txt"]);
    }
}
