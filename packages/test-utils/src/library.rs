//! Temporary music library trees
//!
//! # Panics
//!
//! Fixture methods panic on I/O failure. They are meant for tests, where a
//! broken fixture should fail loudly at the point of setup.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A directory tree under a fresh temporary directory, removed on drop
///
/// The root is canonicalized, so paths built from [`TempLibrary::root`]
/// compare equal to symlink-resolved paths produced by the code under test.
pub struct TempLibrary {
    dir: TempDir,
    root: PathBuf,
}

impl TempLibrary {
    /// Create an empty library
    pub fn new() -> Self {
        let dir = tempfile::Builder::new()
            .prefix("resonance-library-")
            .tempdir()
            .expect("failed to create temporary library");
        let root = dir
            .path()
            .canonicalize()
            .expect("failed to resolve temporary library root");
        Self { dir, root }
    }

    /// Absolute, symlink-free root of the library
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `contents` to `relative`, creating parent directories
    pub fn add_file(&self, relative: &str, contents: &[u8]) -> PathBuf {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("failed to create parent directories");
        }
        fs::write(&path, contents).expect("failed to write library file");
        path
    }

    /// Create an empty directory at `relative`
    pub fn add_dir(&self, relative: &str) -> PathBuf {
        let path = self.root.join(relative);
        fs::create_dir_all(&path).expect("failed to create library directory");
        path
    }

    /// Lay out `count` audio files named `track_NNN.<extension>` in `relative`
    pub fn add_album(&self, relative: &str, count: usize, extension: &str) -> Vec<PathBuf> {
        (0..count)
            .map(|i| self.add_file(&format!("{}/track_{:03}.{}", relative, i, extension), b"audio"))
            .collect()
    }

    /// Path to the underlying temporary directory, as created
    pub fn temp_path(&self) -> &Path {
        self.dir.path()
    }
}

impl Default for TempLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TempLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempLibrary").field("root", &self.root).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_file_creates_parents() {
        let library = TempLibrary::new();
        let path = library.add_file("a/b/c.mp3", b"123");
        assert!(path.is_file());
        assert_eq!(fs::read(&path).unwrap(), b"123");
        assert!(path.starts_with(library.root()));
    }

    #[test]
    fn test_add_album() {
        let library = TempLibrary::new();
        let tracks = library.add_album("Artist/Album", 3, "flac");
        assert_eq!(tracks.len(), 3);
        assert!(tracks[2].ends_with("Artist/Album/track_002.flac"));
    }

    #[test]
    fn test_removed_on_drop() {
        let library = TempLibrary::new();
        library.add_dir("empty");
        let root = library.root().to_path_buf();
        drop(library);
        assert!(!root.exists());
    }
}
