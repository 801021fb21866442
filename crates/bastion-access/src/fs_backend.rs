//! Filesystem backend seam.
//!
//! The controller performs all I/O through [`FileSystem`], so tests can
//! prove that a denied operation never reaches the disk.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Metadata the controller needs about an existing path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    /// Size in bytes.
    pub len: u64,
    /// Whether the path is a directory.
    pub is_dir: bool,
    /// Whether the path is a regular file.
    pub is_file: bool,
}

/// How a scoped file handle is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only.
    Read,
    /// Create or truncate, then write.
    Write,
    /// Create or append.
    Append,
}

/// Filesystem operations used by the access controller.
pub trait FileSystem: Send + Sync + std::fmt::Debug {
    /// Resolves symlinks. Fails if the path does not exist.
    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf>;
    /// Returns metadata, following symlinks.
    fn metadata(&self, path: &Path) -> io::Result<FileMeta>;
    /// Whether `path` itself is a symlink (dangling or not).
    fn is_symlink(&self, path: &Path) -> bool;
    /// Reads a whole file.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    /// Writes (or appends) `data`, creating parent directories.
    fn write(&self, path: &Path, data: &[u8], append: bool) -> io::Result<()>;
    /// Copies a file. Returns bytes copied.
    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64>;
    /// Renames, falling back to copy-then-remove across devices.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    /// Removes a file.
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    /// Removes a directory tree.
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
    /// Creates a directory and its parents.
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    /// Lists the direct children of a directory.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
    /// Lists every non-directory entry below `path`, without following
    /// symlinks.
    fn walk_files(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
    /// Opens a file handle.
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<File>;
    /// Creates a fresh directory under the system temp dir.
    fn create_temp_dir(&self, prefix: &str) -> io::Result<PathBuf>;
}

/// `EXDEV`: rename across mount points.
const EXDEV: i32 = 18;

/// The real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::canonicalize(path)
    }

    fn metadata(&self, path: &Path) -> io::Result<FileMeta> {
        let meta = std::fs::metadata(path)?;
        Ok(FileMeta {
            len: meta.len(),
            is_dir: meta.is_dir(),
            is_file: meta.is_file(),
        })
    }

    fn is_symlink(&self, path: &Path) -> bool {
        std::fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink())
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write(&self, path: &Path, data: &[u8], append: bool) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)?;
        file.write_all(data)?;
        file.flush()
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(from, to)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::rename(from, to) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(EXDEV) => {
                std::fs::copy(from, to)?;
                std::fs::remove_file(from)
            }
            Err(e) => Err(e),
        }
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir_all(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(path)? {
            out.push(entry?.path());
        }
        out.sort();
        Ok(out)
    }

    fn walk_files(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(path).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_dir() {
                out.push(entry.into_path());
            }
        }
        Ok(out)
    }

    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<File> {
        match mode {
            OpenMode::Read => File::open(path),
            OpenMode::Write | OpenMode::Append => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(mode == OpenMode::Append)
                    .truncate(mode == OpenMode::Write)
                    .open(path)
            }
        }
    }

    fn create_temp_dir(&self, prefix: &str) -> io::Result<PathBuf> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
        Ok(dir.into_path())
    }
}
