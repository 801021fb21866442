//! Filesystem access controller.
//!
//! Every call runs the same pipeline: lexical normalization and location
//! checks (no syscalls), symlink resolution with a containment re-check,
//! extension rules, then size and file-count limits. Only a call that passes
//! all of them reaches the [`FileSystem`] backend. Each decision is audited.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bastion_types::{
    AuditLogEntry, AuditOperation, AuditResult, Denial, DenialRule, FilesystemPolicy, SYSTEM_PATHS,
};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::audit::AuditLog;
use crate::error::AccessError;
use crate::fs_backend::{FileSystem, OpenMode, OsFileSystem};

/// Operation judged by [`FilesystemAccessController::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileOperation {
    Read,
    Write,
    Append,
    Delete,
    List,
}

impl FileOperation {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Append => "append",
            Self::Delete => "delete",
            Self::List => "list",
        }
    }

    fn targets_file(&self) -> bool {
        matches!(self, Self::Read | Self::Write | Self::Append)
    }
}

/// Outcome of an allowed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteReceipt {
    /// Resolved absolute path.
    pub path: PathBuf,
    /// Bytes written by this call.
    pub bytes: u64,
    /// Hex SHA-256 of the written bytes.
    pub sha256: String,
    /// Whether the call created the file.
    pub created: bool,
}

/// Counters for one controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FsStats {
    pub files_created: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub temp_dirs: usize,
}

/// A file handle opened through the controller.
///
/// Writes past the policy size limit fail with an I/O error. The handle is
/// closed when dropped.
#[derive(Debug)]
pub struct ScopedFile {
    file: File,
    path: PathBuf,
    mode: OpenMode,
    size: u64,
    limit: u64,
}

impl ScopedFile {
    /// Resolved path of the open file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mode the file was opened with.
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Current size as tracked by this handle (writes only).
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Read for ScopedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for ScopedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.mode == OpenMode::Read {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "file was opened read-only",
            ));
        }
        if self.size.saturating_add(buf.len() as u64) > self.limit {
            return Err(io::Error::other(format!(
                "file size limit of {} bytes exceeded",
                self.limit
            )));
        }
        let n = self.file.write(buf)?;
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Mediates file operations against a [`FilesystemPolicy`].
#[derive(Debug)]
pub struct FilesystemAccessController {
    policy: Arc<FilesystemPolicy>,
    audit: Arc<AuditLog>,
    fs: Arc<dyn FileSystem>,
    root: PathBuf,
    roots: Vec<PathBuf>,
    allowed_paths: Vec<PathBuf>,
    denied_paths: Vec<PathBuf>,
    allowed_extensions: BTreeSet<String>,
    denied_extensions: BTreeSet<String>,
    temp_dirs: Mutex<Vec<PathBuf>>,
    files_created: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    execution_id: Option<String>,
}

impl FilesystemAccessController {
    /// Creates a controller over the real filesystem.
    pub fn new(policy: Arc<FilesystemPolicy>, audit: Arc<AuditLog>) -> Self {
        Self::with_backend(policy, audit, Arc::new(OsFileSystem))
    }

    /// Creates a controller over a custom backend.
    pub fn with_backend(
        policy: Arc<FilesystemPolicy>,
        audit: Arc<AuditLog>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        let lexical_root = absolute_clean(&policy.repo_root);
        let root = fs
            .canonicalize(&lexical_root)
            .unwrap_or_else(|_| lexical_root.clone());
        let mut roots = vec![root.clone()];
        if lexical_root != root {
            roots.push(lexical_root.clone());
        }
        let allowed_paths = normalize_prefixes(&policy.allowed_paths, &lexical_root, fs.as_ref());
        let denied_paths = normalize_prefixes(&policy.denied_paths, &lexical_root, fs.as_ref());
        let allowed_extensions = normalize_extensions(&policy.allowed_extensions);
        let denied_extensions = normalize_extensions(&policy.denied_extensions);
        Self {
            policy,
            audit,
            fs,
            root,
            roots,
            allowed_paths,
            denied_paths,
            allowed_extensions,
            denied_extensions,
            temp_dirs: Mutex::new(Vec::new()),
            files_created: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            execution_id: None,
        }
    }

    /// Tags every audit entry from this controller with `execution_id`.
    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    /// Resolved repository root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The enforced policy.
    pub fn policy(&self) -> &FilesystemPolicy {
        &self.policy
    }

    /// The shared audit log.
    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Reads a whole file.
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn read(&self, path: impl AsRef<Path>) -> Result<Vec<u8>, AccessError> {
        let started = Instant::now();
        let op = AuditOperation::Read;
        let resolved = self.authorize(op, path.as_ref(), true, started)?;
        let data = self.io(op, &resolved, started, "read", self.fs.read(&resolved))?;
        self.bytes_read.fetch_add(data.len() as u64, Ordering::Relaxed);
        self.record(
            op,
            &resolved,
            AuditResult::Allowed,
            started,
            None,
            vec![("bytes", data.len().into())],
        );
        Ok(data)
    }

    /// Reads a whole file as UTF-8.
    pub fn read_to_string(&self, path: impl AsRef<Path>) -> Result<String, AccessError> {
        let display = path.as_ref().display().to_string();
        let bytes = self.read(path)?;
        String::from_utf8(bytes).map_err(|e| AccessError::Io {
            operation: "read",
            path: display,
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })
    }

    /// Writes (or appends) `data`, creating parent directories.
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display(), len = data.len()))]
    pub fn write(
        &self,
        path: impl AsRef<Path>,
        data: &[u8],
        append: bool,
    ) -> Result<WriteReceipt, AccessError> {
        let started = Instant::now();
        let op = if append {
            AuditOperation::Append
        } else {
            AuditOperation::Write
        };
        let resolved = self.authorize(op, path.as_ref(), true, started)?;
        let existing = self.fs.metadata(&resolved).ok();
        if existing.is_some_and(|m| m.is_dir) {
            return Err(self.deny(
                op,
                &resolved,
                started,
                Denial::new(DenialRule::InvalidTarget, display(&resolved), "is a directory"),
            ));
        }
        let base = if append {
            existing.map_or(0, |m| m.len)
        } else {
            0
        };
        self.check_size(op, &resolved, base.saturating_add(data.len() as u64), started)?;
        let created = existing.is_none();
        if created {
            self.reserve_file_slot(op, &resolved, started)?;
        }
        if let Err(e) = self.fs.write(&resolved, data, append) {
            if created {
                self.files_created.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(self.io_error(op, &resolved, started, "write", e));
        }
        let sha256 = hex::encode(Sha256::digest(data));
        self.bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.record(
            op,
            &resolved,
            AuditResult::Allowed,
            started,
            None,
            vec![
                ("bytes", data.len().into()),
                ("sha256", sha256.clone().into()),
                ("created", created.into()),
            ],
        );
        Ok(WriteReceipt {
            path: resolved,
            bytes: data.len() as u64,
            sha256,
            created,
        })
    }

    /// Copies `src` to `dst`. Returns bytes copied.
    #[tracing::instrument(skip_all, fields(src = %src.as_ref().display(), dst = %dst.as_ref().display()))]
    pub fn copy(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<u64, AccessError> {
        let started = Instant::now();
        let op = AuditOperation::Copy;
        let from = self.authorize(op, src.as_ref(), true, started)?;
        let to = self.authorize(op, dst.as_ref(), true, started)?;
        let meta = self.io(op, &from, started, "copy", self.fs.metadata(&from))?;
        self.check_size(op, &to, meta.len, started)?;
        let created = self.fs.metadata(&to).is_err();
        if created {
            self.reserve_file_slot(op, &to, started)?;
        }
        let bytes = match self.fs.copy(&from, &to) {
            Ok(n) => n,
            Err(e) => {
                if created {
                    self.files_created.fetch_sub(1, Ordering::SeqCst);
                }
                return Err(self.io_error(op, &from, started, "copy", e));
            }
        };
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.record(
            op,
            &from,
            AuditResult::Allowed,
            started,
            None,
            vec![
                ("destination", display(&to).into()),
                ("bytes", bytes.into()),
            ],
        );
        Ok(bytes)
    }

    /// Moves `src` to `dst`. Moves do not count toward `max_files_created`.
    #[tracing::instrument(skip_all, fields(src = %src.as_ref().display(), dst = %dst.as_ref().display()))]
    pub fn move_file(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<(), AccessError> {
        let started = Instant::now();
        let op = AuditOperation::Move;
        let from = self.authorize(op, src.as_ref(), true, started)?;
        let to = self.authorize(op, dst.as_ref(), true, started)?;
        let meta = self.io(op, &from, started, "move", self.fs.metadata(&from))?;
        self.check_size(op, &to, meta.len, started)?;
        self.io(op, &from, started, "move", self.fs.rename(&from, &to))?;
        self.record(
            op,
            &from,
            AuditResult::Allowed,
            started,
            None,
            vec![("destination", display(&to).into())],
        );
        Ok(())
    }

    /// Deletes a file or a directory tree. The root itself is never deleted,
    /// and a tree holding any file the extension rules refuse is left intact.
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn delete(&self, path: impl AsRef<Path>) -> Result<(), AccessError> {
        let started = Instant::now();
        let op = AuditOperation::Delete;
        let resolved = self.authorize(op, path.as_ref(), false, started)?;
        if self.roots.iter().any(|r| r == &resolved) {
            return Err(self.deny(
                op,
                &resolved,
                started,
                Denial::new(
                    DenialRule::DeniedPath,
                    display(&resolved),
                    "the repository root cannot be deleted",
                ),
            ));
        }
        let meta = self.io(op, &resolved, started, "delete", self.fs.metadata(&resolved))?;
        if meta.is_dir {
            let files = self.io(op, &resolved, started, "delete", self.fs.walk_files(&resolved))?;
            if let Some(denial) = files.iter().find_map(|f| self.check_extension(f).err()) {
                return Err(self.deny(op, &resolved, started, denial));
            }
            self.io(op, &resolved, started, "delete", self.fs.remove_dir_all(&resolved))?;
            let mut temp = self.temp_dirs.lock().unwrap_or_else(|e| e.into_inner());
            temp.retain(|d| !d.starts_with(&resolved));
        } else {
            if let Err(denial) = self.check_extension(&resolved) {
                return Err(self.deny(op, &resolved, started, denial));
            }
            self.io(op, &resolved, started, "delete", self.fs.remove_file(&resolved))?;
        }
        self.record(
            op,
            &resolved,
            AuditResult::Allowed,
            started,
            None,
            vec![("directory", meta.is_dir.into())],
        );
        Ok(())
    }

    /// Opens a file handle scoped to the caller.
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open_scoped(
        &self,
        path: impl AsRef<Path>,
        mode: OpenMode,
    ) -> Result<ScopedFile, AccessError> {
        let started = Instant::now();
        let op = AuditOperation::Open;
        let resolved = self.authorize(op, path.as_ref(), true, started)?;
        let existing = self.fs.metadata(&resolved).ok();
        let mut created = false;
        let size = match mode {
            OpenMode::Read => 0,
            OpenMode::Write | OpenMode::Append => {
                if existing.is_none() {
                    self.reserve_file_slot(op, &resolved, started)?;
                    created = true;
                }
                if mode == OpenMode::Append {
                    existing.map_or(0, |m| m.len)
                } else {
                    0
                }
            }
        };
        let file = match self.fs.open(&resolved, mode) {
            Ok(f) => f,
            Err(e) => {
                if created {
                    self.files_created.fetch_sub(1, Ordering::SeqCst);
                }
                return Err(self.io_error(op, &resolved, started, "open", e));
            }
        };
        self.record(
            op,
            &resolved,
            AuditResult::Allowed,
            started,
            None,
            vec![("mode", format!("{mode:?}").to_lowercase().into())],
        );
        Ok(ScopedFile {
            file,
            path: resolved,
            mode,
            size,
            limit: self.policy.max_file_size_bytes,
        })
    }

    /// Lists a directory. Entries the policy would refuse are omitted.
    pub fn list_dir(&self, path: impl AsRef<Path>) -> Result<Vec<PathBuf>, AccessError> {
        let started = Instant::now();
        let op = AuditOperation::ListDir;
        let resolved = self.authorize(op, path.as_ref(), false, started)?;
        let entries = self.io(op, &resolved, started, "list", self.fs.read_dir(&resolved))?;
        let visible: Vec<PathBuf> = entries
            .into_iter()
            .filter(|p| self.check_location(p).is_ok())
            .collect();
        self.record(
            op,
            &resolved,
            AuditResult::Allowed,
            started,
            None,
            vec![("entries", visible.len().into())],
        );
        Ok(visible)
    }

    /// Whether an allowed path exists.
    pub fn exists(&self, path: impl AsRef<Path>) -> Result<bool, AccessError> {
        let started = Instant::now();
        let op = AuditOperation::Check;
        let resolved = self.authorize(op, path.as_ref(), false, started)?;
        let exists = self.fs.metadata(&resolved).is_ok();
        self.record(
            op,
            &resolved,
            AuditResult::Allowed,
            started,
            None,
            vec![("operation", "exists".into()), ("exists", exists.into())],
        );
        Ok(exists)
    }

    /// Validates `path` for `operation` without performing it.
    ///
    /// For writes an existing file larger than the size limit is refused,
    /// which is how payload output is revalidated after a run.
    pub fn check(
        &self,
        path: impl AsRef<Path>,
        operation: FileOperation,
    ) -> Result<PathBuf, AccessError> {
        let started = Instant::now();
        let op = AuditOperation::Check;
        let resolved = self.authorize(op, path.as_ref(), operation.targets_file(), started)?;
        if matches!(operation, FileOperation::Write | FileOperation::Append) {
            if let Ok(meta) = self.fs.metadata(&resolved) {
                self.check_size(op, &resolved, meta.len, started)?;
            }
        }
        self.record(
            op,
            &resolved,
            AuditResult::Allowed,
            started,
            None,
            vec![("operation", operation.as_str().into())],
        );
        Ok(resolved)
    }

    /// Creates a temp directory owned by this controller.
    pub fn create_temp_dir(&self, prefix: &str) -> Result<PathBuf, AccessError> {
        let started = Instant::now();
        let op = AuditOperation::CreateTempDir;
        if prefix.contains(['/', '\\']) || prefix.contains("..") {
            let target = PathBuf::from(prefix);
            return Err(self.deny(
                op,
                &target,
                started,
                Denial::new(DenialRule::InvalidTarget, prefix, "prefix must be a plain name"),
            ));
        }
        let target = PathBuf::from(prefix);
        let created = self.io(op, &target, started, "create temp dir", self.fs.create_temp_dir(prefix))?;
        let dir = self.fs.canonicalize(&created).unwrap_or(created);
        self.temp_dirs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(dir.clone());
        self.record(op, &dir, AuditResult::Allowed, started, None, Vec::new());
        Ok(dir)
    }

    /// Removes every temp directory this controller created.
    ///
    /// Idempotent: a second call finds nothing to do. Returns how many
    /// directories were removed.
    pub fn cleanup_temp_dirs(&self) -> usize {
        let dirs: Vec<PathBuf> = {
            let mut guard = self.temp_dirs.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        let mut removed = 0;
        for dir in dirs {
            let started = Instant::now();
            match self.fs.remove_dir_all(&dir) {
                Ok(()) => {
                    removed += 1;
                    self.record(
                        AuditOperation::CleanupTempDir,
                        &dir,
                        AuditResult::Allowed,
                        started,
                        None,
                        Vec::new(),
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "temp dir cleanup failed");
                    self.record(
                        AuditOperation::CleanupTempDir,
                        &dir,
                        AuditResult::Error,
                        started,
                        Some(e.to_string()),
                        Vec::new(),
                    );
                }
            }
        }
        removed
    }

    /// Temp directories currently owned by this controller.
    pub fn temp_dirs(&self) -> Vec<PathBuf> {
        self.temp_dirs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Counters for this controller.
    pub fn stats(&self) -> FsStats {
        FsStats {
            files_created: self.files_created.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            temp_dirs: self.temp_dirs.lock().unwrap_or_else(|e| e.into_inner()).len(),
        }
    }

    /// Runs location, symlink and (optionally) extension checks. Denials are
    /// audited before returning.
    fn authorize(
        &self,
        op: AuditOperation,
        path: &Path,
        file_target: bool,
        started: Instant,
    ) -> Result<PathBuf, AccessError> {
        let lexical = self.lexical(path);
        match self.evaluate(&lexical, file_target) {
            Ok(resolved) => Ok(resolved),
            Err(denial) => Err(self.deny(op, &lexical, started, denial)),
        }
    }

    fn evaluate(&self, lexical: &Path, file_target: bool) -> Result<PathBuf, Denial> {
        self.check_location(lexical)?;
        let resolved = self.resolve_symlinks(lexical)?;
        if resolved != lexical {
            self.check_location(&resolved)?;
        }
        if file_target {
            self.check_extension(&resolved)?;
        }
        Ok(resolved)
    }

    fn lexical(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path_clean::clean(path)
        } else {
            path_clean::clean(self.root.join(path))
        }
    }

    fn check_location(&self, path: &Path) -> Result<(), Denial> {
        let in_root = self.roots.iter().any(|r| path.starts_with(r));
        let in_temp = self.policy.temp_dir_access && self.in_temp_dir(path);
        if self.policy.restrict_to_root && !in_root && !in_temp {
            return Err(Denial::new(
                DenialRule::OutsideRoot,
                display(path),
                format!("root is {}", self.root.display()),
            ));
        }
        if let Some(prefix) = self.denied_paths.iter().find(|d| path.starts_with(d)) {
            return Err(Denial::new(
                DenialRule::DeniedPath,
                display(path),
                format!("matches {}", prefix.display()),
            ));
        }
        if !self.policy.system_access {
            let system = SYSTEM_PATHS
                .iter()
                .map(Path::new)
                .find(|sys| path.starts_with(sys));
            if let Some(sys) = system {
                let granted = in_root && self.roots.iter().any(|r| r.starts_with(sys));
                if !granted && !in_temp {
                    return Err(Denial::new(
                        DenialRule::SystemPath,
                        display(path),
                        format!("inside {}", sys.display()),
                    ));
                }
            }
        }
        if !self.allowed_paths.is_empty()
            && !in_temp
            && !self.allowed_paths.iter().any(|a| path.starts_with(a))
        {
            return Err(Denial::new(DenialRule::NotInAllowedPaths, display(path), ""));
        }
        Ok(())
    }

    fn in_temp_dir(&self, path: &Path) -> bool {
        let dirs = self.temp_dirs.lock().unwrap_or_else(|e| e.into_inner());
        dirs.iter().any(|d| path.starts_with(d))
    }

    /// Canonicalizes the longest existing ancestor and re-appends the rest.
    fn resolve_symlinks(&self, lexical: &Path) -> Result<PathBuf, Denial> {
        for ancestor in lexical.ancestors() {
            let Ok(canonical) = self.fs.canonicalize(ancestor) else {
                continue;
            };
            if ancestor != lexical && self.fs.is_symlink(lexical) {
                return Err(Denial::new(
                    DenialRule::InvalidTarget,
                    display(lexical),
                    "dangling symlink",
                ));
            }
            let rest = lexical.strip_prefix(ancestor).unwrap_or(Path::new(""));
            return Ok(if rest.as_os_str().is_empty() {
                canonical
            } else {
                canonical.join(rest)
            });
        }
        Ok(lexical.to_path_buf())
    }

    fn check_extension(&self, path: &Path) -> Result<(), Denial> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase());
        match ext {
            Some(ext) if self.denied_extensions.contains(&ext) => Err(Denial::new(
                DenialRule::DeniedExtension,
                display(path),
                format!(".{ext}"),
            )),
            Some(ext)
                if !self.allowed_extensions.is_empty()
                    && !self.allowed_extensions.contains(&ext) =>
            {
                Err(Denial::new(
                    DenialRule::ExtensionNotAllowed,
                    display(path),
                    format!(".{ext}"),
                ))
            }
            None if !self.allowed_extensions.is_empty() => Err(Denial::new(
                DenialRule::ExtensionNotAllowed,
                display(path),
                "no extension",
            )),
            _ => Ok(()),
        }
    }

    fn check_size(
        &self,
        op: AuditOperation,
        path: &Path,
        size: u64,
        started: Instant,
    ) -> Result<(), AccessError> {
        let max = self.policy.max_file_size_bytes;
        if size > max {
            return Err(self.deny(
                op,
                path,
                started,
                Denial::new(
                    DenialRule::FileTooLarge,
                    display(path),
                    format!("{size} bytes exceeds limit of {max}"),
                ),
            ));
        }
        Ok(())
    }

    fn reserve_file_slot(
        &self,
        op: AuditOperation,
        path: &Path,
        started: Instant,
    ) -> Result<(), AccessError> {
        let max = self.policy.max_files_created;
        let reserved = self
            .files_created
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            });
        match reserved {
            Ok(_) => Ok(()),
            Err(_) => Err(self.deny(
                op,
                path,
                started,
                Denial::new(
                    DenialRule::TooManyFiles,
                    display(path),
                    format!("limit of {max} files reached"),
                ),
            )),
        }
    }

    fn deny(&self, op: AuditOperation, path: &Path, started: Instant, denial: Denial) -> AccessError {
        tracing::debug!(rule = %denial.rule, target = %denial.target, "filesystem access denied");
        self.record(
            op,
            path,
            AuditResult::Denied,
            started,
            Some(denial.to_string()),
            vec![("rule", denial.rule.as_str().into())],
        );
        AccessError::PolicyViolation(denial)
    }

    fn io<T>(
        &self,
        op: AuditOperation,
        path: &Path,
        started: Instant,
        operation: &'static str,
        result: io::Result<T>,
    ) -> Result<T, AccessError> {
        result.map_err(|e| self.io_error(op, path, started, operation, e))
    }

    fn io_error(
        &self,
        op: AuditOperation,
        path: &Path,
        started: Instant,
        operation: &'static str,
        source: io::Error,
    ) -> AccessError {
        self.record(
            op,
            path,
            AuditResult::Error,
            started,
            Some(source.to_string()),
            Vec::new(),
        );
        AccessError::Io {
            operation,
            path: display(path),
            source,
        }
    }

    fn record(
        &self,
        op: AuditOperation,
        path: &Path,
        result: AuditResult,
        started: Instant,
        error: Option<String>,
        metadata: Vec<(&'static str, serde_json::Value)>,
    ) {
        if !self.policy.audit_enabled {
            return;
        }
        let mut entry = AuditLogEntry::new(op, display(path), result)
            .with_duration_ms(started.elapsed().as_millis() as u64)
            .with_execution_id(self.execution_id.clone());
        if let Some(message) = error {
            entry = entry.with_error(message);
        }
        for (key, value) in metadata {
            entry = entry.with_metadata(key, value);
        }
        self.audit.record(entry);
    }
}

impl Drop for FilesystemAccessController {
    fn drop(&mut self) {
        self.cleanup_temp_dirs();
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

fn absolute_clean(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    path_clean::clean(absolute)
}

fn normalize_prefixes(paths: &[PathBuf], root: &Path, fs: &dyn FileSystem) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for p in paths {
        let lexical = if p.is_absolute() {
            path_clean::clean(p)
        } else {
            path_clean::clean(root.join(p))
        };
        if let Ok(canonical) = fs.canonicalize(&lexical) {
            if canonical != lexical {
                out.push(canonical);
            }
        }
        out.push(lexical);
    }
    out
}

fn normalize_extensions(exts: &BTreeSet<String>) -> BTreeSet<String> {
    exts.iter()
        .map(|e| e.trim().trim_start_matches('.').to_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(dir: &Path, tweak: impl FnOnce(&mut FilesystemPolicy)) -> FilesystemAccessController {
        let mut policy = FilesystemPolicy {
            repo_root: dir.to_path_buf(),
            ..FilesystemPolicy::default()
        };
        tweak(&mut policy);
        FilesystemAccessController::new(Arc::new(policy), AuditLog::new_shared())
    }

    #[test]
    fn lexical_traversal_is_denied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctl = controller(dir.path(), |_| {});
        let err = ctl.read("../../etc/hostname").expect_err("denied");
        assert_eq!(err.denial().map(|d| d.rule), Some(DenialRule::OutsideRoot));
    }

    #[test]
    fn extension_rules() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctl = controller(dir.path(), |p| {
            p.allowed_extensions = ["txt".to_string(), ".MD".to_string()].into_iter().collect();
        });
        assert!(ctl.write("notes.md", b"# hi", false).is_ok());
        let err = ctl.write("tool.exe", b"MZ", false).expect_err("denied");
        assert_eq!(err.denial().map(|d| d.rule), Some(DenialRule::DeniedExtension));
        let err = ctl.write("Makefile", b"all:", false).expect_err("denied");
        assert_eq!(err.denial().map(|d| d.rule), Some(DenialRule::ExtensionNotAllowed));
    }

    #[test]
    fn denied_paths_win_over_allowed_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctl = controller(dir.path(), |p| {
            p.allowed_paths = vec![PathBuf::from("src")];
            p.denied_paths = vec![PathBuf::from("src/secret")];
        });
        assert!(ctl.write("src/lib.rs", b"", false).is_ok());
        let err = ctl.write("src/secret/key.pem", b"", false).expect_err("denied");
        assert_eq!(err.denial().map(|d| d.rule), Some(DenialRule::DeniedPath));
        let err = ctl.write("docs/readme.txt", b"", false).expect_err("denied");
        assert_eq!(err.denial().map(|d| d.rule), Some(DenialRule::NotInAllowedPaths));
    }

    #[test]
    fn append_counts_existing_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctl = controller(dir.path(), |p| p.max_file_size_bytes = 8);
        ctl.write("log.txt", b"12345", false).expect("first");
        let err = ctl.write("log.txt", b"6789", true).expect_err("too large");
        assert_eq!(err.denial().map(|d| d.rule), Some(DenialRule::FileTooLarge));
        ctl.write("log.txt", b"678", true).expect("fits");
        assert_eq!(ctl.read("log.txt").expect("read"), b"12345678");
    }

    #[test]
    fn file_count_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctl = controller(dir.path(), |p| p.max_files_created = 2);
        ctl.write("a.txt", b"a", false).expect("a");
        ctl.write("b.txt", b"b", false).expect("b");
        ctl.write("a.txt", b"again", false).expect("overwrite does not count");
        let err = ctl.write("c.txt", b"c", false).expect_err("limit");
        assert_eq!(err.denial().map(|d| d.rule), Some(DenialRule::TooManyFiles));
        assert_eq!(ctl.stats().files_created, 2);
    }

    #[test]
    fn root_cannot_be_deleted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctl = controller(dir.path(), |_| {});
        let err = ctl.delete(".").expect_err("root");
        assert_eq!(err.denial().map(|d| d.rule), Some(DenialRule::DeniedPath));
        assert!(dir.path().exists());
    }

    #[test]
    fn scoped_file_enforces_size_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctl = controller(dir.path(), |p| p.max_file_size_bytes = 4);
        let mut f = ctl.open_scoped("out.txt", OpenMode::Write).expect("open");
        f.write_all(b"abcd").expect("fits");
        assert!(f.write_all(b"e").is_err());
        drop(f);
        assert_eq!(std::fs::read(dir.path().join("out.txt")).expect("read"), b"abcd");
    }

    #[test]
    fn write_receipt_has_checksum() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctl = controller(dir.path(), |_| {});
        let receipt = ctl.write("a.txt", b"abc", false).expect("write");
        assert_eq!(
            receipt.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(receipt.created);
        let last = ctl.audit_log().last().expect("entry");
        assert_eq!(last.metadata["sha256"], receipt.sha256.as_str());
    }
}
