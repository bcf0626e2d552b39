//! Bounded directory traversal
//!
//! [`DirectoryWalker`] is a lazy, finite iterator over the audio files below
//! a root directory. Traversal is iterative (walkdir keeps an explicit stack
//! of open directories), bounded by depth and by the number of files yielded.
//!
//! Failure policy:
//! - the root directory must open, otherwise [`DirectoryWalker::new`] fails
//! - an unreadable subdirectory or a failed `stat` on a file is reported to
//!   the error callback and the walk continues
//! - symlinks are neither followed nor indexed

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use walkdir::WalkDir;

use super::formats::{audio_extension, normalize_extension};

/// A discovered audio file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub mtime_ms: i64,
    /// Lower-cased, without the dot
    pub extension: String,
}

/// Traversal limits and filters
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Subdirectories are entered while their depth is at most this value;
    /// the root is depth 0
    pub max_depth: usize,
    /// Hard cap on yielded descriptors
    pub max_files: usize,
    /// Entry names skipped at any level
    pub ignore_names: HashSet<String>,
    /// Extensions skipped even when they are audio formats
    pub ignore_extensions: HashSet<String>,
}

impl WalkOptions {
    pub fn new(max_depth: usize, max_files: usize) -> Self {
        Self {
            max_depth,
            max_files,
            ignore_names: HashSet::new(),
            ignore_extensions: HashSet::new(),
        }
    }

    pub fn ignore_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_names.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn ignore_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.ignore_extensions
            .extend(extensions.into_iter().map(|e| normalize_extension(e.as_ref())));
        self
    }
}

/// Receives non-fatal traversal errors
pub type WalkErrorCallback = Box<dyn FnMut(&Path, &io::Error) + Send>;

type EntryFilter = Box<dyn FnMut(&walkdir::DirEntry) -> bool + Send>;

/// Lazy, non-restartable iterator over audio files below a root
pub struct DirectoryWalker {
    root: PathBuf,
    entries: walkdir::FilterEntry<walkdir::IntoIter, EntryFilter>,
    ignore_extensions: HashSet<String>,
    max_files: usize,
    yielded: usize,
    on_error: WalkErrorCallback,
}

impl DirectoryWalker {
    /// Open `root` for traversal. Fails if the root itself cannot be read.
    pub fn new<F>(root: impl Into<PathBuf>, options: WalkOptions, on_error: F) -> io::Result<Self>
    where
        F: FnMut(&Path, &io::Error) + Send + 'static,
    {
        let root = root.into();

        // Surface an unreadable root now rather than through the callback
        fs::read_dir(&root)?;

        let ignore_names = options.ignore_names;
        let filter: EntryFilter = Box::new(move |entry| {
            entry.depth() == 0
                || !ignore_names.contains(entry.file_name().to_string_lossy().as_ref())
        });
        let entries = WalkDir::new(&root)
            .follow_links(false)
            // Files sit one level below the directory that holds them
            .max_depth(options.max_depth.saturating_add(1))
            .into_iter()
            .filter_entry(filter);

        Ok(Self {
            root,
            entries,
            ignore_extensions: options.ignore_extensions,
            max_files: options.max_files,
            yielded: 0,
            on_error: Box::new(on_error),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of descriptors yielded so far
    pub fn yielded(&self) -> usize {
        self.yielded
    }

    fn report(&mut self, path: &Path, err: &io::Error) {
        (self.on_error)(path, err);
    }

    fn describe(&mut self, entry: walkdir::DirEntry) -> Option<FileDescriptor> {
        // Regular files only; a symlink may point outside the scan root
        if !entry.file_type().is_file() {
            return None;
        }

        let extension = audio_extension(entry.path())?;
        if self.ignore_extensions.contains(&extension) {
            return None;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                let err = io::Error::from(err);
                self.report(entry.path(), &err);
                return None;
            }
        };
        let path = entry.into_path();

        let mtime_ms = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0);

        Some(FileDescriptor {
            path,
            size_bytes: metadata.len(),
            mtime_ms,
            extension,
        })
    }
}

impl Iterator for DirectoryWalker {
    type Item = FileDescriptor;

    fn next(&mut self) -> Option<FileDescriptor> {
        while self.yielded < self.max_files {
            match self.entries.next()? {
                Ok(entry) => {
                    if let Some(descriptor) = self.describe(entry) {
                        self.yielded += 1;
                        return Some(descriptor);
                    }
                }
                Err(err) => {
                    let path = err
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| self.root.clone());
                    let err = io::Error::from(err);
                    self.report(&path, &err);
                }
            }
        }
        None
    }
}

impl std::fmt::Debug for DirectoryWalker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryWalker")
            .field("root", &self.root)
            .field("max_files", &self.max_files)
            .field("yielded", &self.yielded)
            .finish_non_exhaustive()
    }
}
