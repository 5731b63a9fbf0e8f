//! Temporary file management.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

use log;

/// Environment variable overriding the directory temporary files are placed in.
pub const TEMP_DIR_ENV: &str = "TPIE_TEMP_DIR";

static NEXT_TEMP_ID: AtomicU64 = AtomicU64::new(0);

/// Returns the directory temporary files are created in: the `TPIE_TEMP_DIR`
/// environment variable if set, the OS temporary directory otherwise.
pub fn temp_root() -> PathBuf {
    match env::var_os(TEMP_DIR_ENV) {
        Some(dir) => PathBuf::from(dir),
        None => env::temp_dir(),
    }
}

/// A uniquely named temporary file path. The backing file is removed when the
/// handle is dropped.
///
/// The handle only owns the path; opening, writing and closing the backing
/// file is up to the caller. The file does not need to exist.
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
}

impl TempFile {
    /// Creates a temp file handle under [`temp_root`].
    pub fn new() -> TempFile {
        Self::in_dir(&temp_root())
    }

    /// Creates a temp file handle under the given directory.
    pub fn in_dir(dir: &Path) -> TempFile {
        let id = NEXT_TEMP_ID.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("tpie_{}_{}.tmp", process::id(), id));
        TempFile { path }
    }

    /// The path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the backing file if it exists. Idempotent.
    pub fn free(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => log::warn!("could not remove temporary file {}: {}", self.path.display(), err),
        }
    }
}

impl Default for TempFile {
    fn default() -> Self {
        TempFile::new()
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use super::TempFile;

    #[test]
    fn test_unique_paths() {
        let dir = tempfile::tempdir().unwrap();
        let a = TempFile::in_dir(dir.path());
        let b = TempFile::in_dir(dir.path());
        assert_ne!(a.path(), b.path());
        assert!(a.path().file_name().unwrap().to_str().unwrap().starts_with("tpie_"));
    }

    #[test]
    fn test_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let tmp = TempFile::in_dir(dir.path());
            fs::write(tmp.path(), b"scratch").unwrap();
            assert!(tmp.path().exists());
            tmp.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_free_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let mut tmp = TempFile::in_dir(dir.path());
        tmp.free();
        tmp.free();
    }
}
