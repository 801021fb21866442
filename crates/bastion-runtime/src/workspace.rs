//! Per-execution working directories.
//!
//! A [`Workspace`] is a fresh directory that only one execution sees. Files
//! enter it through a [`FilesystemAccessController`] jailed to the
//! directory, and payload output is checked against the same controller
//! after the run.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bastion_access::{AuditLog, FileOperation, FilesystemAccessController};
use bastion_types::{AuditLogEntry, AuditOperation, AuditResult, FilesystemPolicy};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::RuntimeError;
use crate::isolation::RESERVED_PREFIX;

/// Content fingerprints of the files under a workspace, keyed by relative
/// path with `/` separators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    files: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, relative: &str) -> bool {
        self.files.contains_key(relative)
    }

    /// Files present in `after` but not here, and files whose content
    /// changed.
    pub fn diff(&self, after: &Snapshot) -> Changes {
        let mut changes = Changes::default();
        for (path, digest) in &after.files {
            match self.files.get(path) {
                None => changes.created.push(path.clone()),
                Some(before) if before != digest => changes.modified.push(path.clone()),
                Some(_) => {}
            }
        }
        changes
    }
}

/// Result of [`Snapshot::diff`]. Both lists are sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    pub created: Vec<String>,
    pub modified: Vec<String>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty()
    }
}

/// An execution's working directory.
#[derive(Debug)]
pub struct Workspace {
    dir: PathBuf,
    controller: FilesystemAccessController,
    execution_id: String,
    cleaned: AtomicBool,
}

impl Workspace {
    /// Creates `bastion-<execution_id>` under `work_root` (system temp when
    /// `None`) and a controller jailed to it.
    pub fn create(
        work_root: Option<&Path>,
        policy: &FilesystemPolicy,
        audit: Arc<AuditLog>,
        execution_id: &str,
    ) -> Result<Self, RuntimeError> {
        let parent = work_root.map_or_else(std::env::temp_dir, Path::to_path_buf);
        fs::create_dir_all(&parent).map_err(|e| RuntimeError::io("create work root", e))?;
        let requested = parent.join(format!("bastion-{execution_id}"));
        create_private_dir(&requested).map_err(|e| RuntimeError::io("create workdir", e))?;

        let controller = FilesystemAccessController::new(
            Arc::new(policy.scoped_to(&requested)),
            audit,
        )
        .with_execution_id(execution_id);
        let dir = controller.root().to_path_buf();
        tracing::debug!(workdir = %dir.display(), "workspace created");
        Ok(Self {
            dir,
            controller,
            execution_id: execution_id.to_string(),
            cleaned: AtomicBool::new(false),
        })
    }

    /// Resolved directory path.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn controller(&self) -> &FilesystemAccessController {
        &self.controller
    }

    /// Writes `files` and then the entry file through the jailed controller.
    /// Returns bytes staged.
    ///
    /// # Errors
    ///
    /// The first denied or failed write aborts staging.
    #[tracing::instrument(skip_all, fields(execution_id = %self.execution_id))]
    pub fn stage(
        &self,
        files: &BTreeMap<String, String>,
        entry: &str,
        code: &str,
    ) -> Result<u64, RuntimeError> {
        let started = Instant::now();
        let mut bytes = 0;
        for (path, content) in files {
            if is_reserved(path) || path == entry {
                return Err(RuntimeError::invalid(format!(
                    "staged path {path:?} collides with a sandbox file"
                )));
            }
            bytes += self.controller.write(path, content.as_bytes(), false)?.bytes;
        }
        bytes += self.controller.write(entry, code.as_bytes(), false)?.bytes;

        if self.controller.policy().audit_enabled {
            self.controller.audit_log().record(
                AuditLogEntry::new(
                    AuditOperation::Stage,
                    self.dir.display().to_string(),
                    AuditResult::Allowed,
                )
                .with_duration_ms(started.elapsed().as_millis() as u64)
                .with_metadata("files", files.len() + 1)
                .with_metadata("bytes", bytes)
                .with_execution_id(Some(self.execution_id.clone())),
            );
        }
        Ok(bytes)
    }

    /// Fingerprints every payload-visible file. Symlinks are recorded by
    /// their target, never followed.
    pub fn snapshot(&self) -> Result<Snapshot, RuntimeError> {
        let mut files = BTreeMap::new();
        let walker = WalkDir::new(&self.dir)
            .follow_links(false)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !(e.depth() == 1 && is_reserved(&e.file_name().to_string_lossy())));
        for entry in walker {
            let entry = entry.map_err(|e| RuntimeError::io("snapshot workdir", e.into()))?;
            if entry.file_type().is_dir() {
                continue;
            }
            let Some(relative) = relative_name(&self.dir, entry.path()) else {
                continue;
            };
            let digest = if entry.file_type().is_symlink() {
                let target = fs::read_link(entry.path())
                    .map_err(|e| RuntimeError::io("snapshot workdir", e))?;
                format!("link:{}", target.display())
            } else {
                match hash_file(entry.path()) {
                    Ok(digest) => digest,
                    // Unreadable entries (sockets, chmod 000) still count as present.
                    Err(_) => "unreadable".to_string(),
                }
            };
            files.insert(relative, digest);
        }
        Ok(Snapshot { files })
    }

    /// Checks every created or modified file against the write policy and
    /// deletes the ones it refuses. Returns the refused paths.
    #[tracing::instrument(skip_all, fields(execution_id = %self.execution_id, changed = changes.created.len() + changes.modified.len()))]
    pub fn revalidate(&self, changes: &Changes) -> Vec<String> {
        let mut rejected = BTreeSet::new();
        for path in changes.created.iter().chain(&changes.modified) {
            if let Err(e) = self.controller.check(path, FileOperation::Write) {
                tracing::warn!(path, error = %e, "payload output refused");
                let full = self.dir.join(path);
                if let Err(err) = fs::remove_file(&full) {
                    if err.kind() != io::ErrorKind::NotFound {
                        tracing::warn!(path, error = %err, "failed to remove refused output");
                    }
                }
                rejected.insert(path.clone());
            }
        }
        rejected.into_iter().collect()
    }

    /// Removes the directory. Idempotent; returns whether this call removed
    /// it.
    pub fn cleanup(&self) -> Result<bool, RuntimeError> {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                tracing::debug!(workdir = %self.dir.display(), "workspace removed");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                self.cleaned.store(false, Ordering::SeqCst);
                Err(RuntimeError::io("remove workdir", e))
            }
        }
    }

    pub fn is_cleaned(&self) -> bool {
        self.cleaned.load(Ordering::SeqCst)
    }
}

fn is_reserved(relative: &str) -> bool {
    relative
        .split(['/', '\\'])
        .next()
        .is_some_and(|first| first.starts_with(RESERVED_PREFIX))
}

fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> io::Result<()> {
    fs::create_dir(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(root: &Path) -> Workspace {
        Workspace::create(
            Some(root),
            &FilesystemPolicy::default(),
            AuditLog::new_shared(),
            "exec-test",
        )
        .expect("workspace")
    }

    #[test]
    fn reserved_names_are_top_level_only() {
        assert!(is_reserved(".bastion_deps/x.py"));
        assert!(is_reserved(".bastion_tmp"));
        assert!(!is_reserved("data/.bastion_deps"));
        assert!(!is_reserved("main.py"));
    }

    #[test]
    fn diff_reports_created_and_modified() {
        let before = Snapshot {
            files: BTreeMap::from([
                ("a.txt".to_string(), "1".to_string()),
                ("b.txt".to_string(), "2".to_string()),
            ]),
        };
        let after = Snapshot {
            files: BTreeMap::from([
                ("a.txt".to_string(), "1".to_string()),
                ("b.txt".to_string(), "3".to_string()),
                ("c/d.txt".to_string(), "4".to_string()),
            ]),
        };
        let changes = before.diff(&after);
        assert_eq!(changes.created, vec!["c/d.txt"]);
        assert_eq!(changes.modified, vec!["b.txt"]);
    }

    #[test]
    fn stage_writes_files_and_entry() {
        let root = tempfile::tempdir().expect("tempdir");
        let ws = workspace(root.path());
        let files = BTreeMap::from([("data/in.txt".to_string(), "abc".to_string())]);
        let bytes = ws.stage(&files, "main.sh", "echo hi").expect("stage");
        assert_eq!(bytes, 3 + 7);
        assert_eq!(fs::read_to_string(ws.path().join("data/in.txt")).expect("read"), "abc");
        let snap = ws.snapshot().expect("snapshot");
        assert!(snap.contains("data/in.txt"));
        assert!(snap.contains("main.sh"));
    }

    #[test]
    fn stage_refuses_reserved_paths() {
        let root = tempfile::tempdir().expect("tempdir");
        let ws = workspace(root.path());
        let files = BTreeMap::from([(".bastion_deps/evil.py".to_string(), "x".to_string())]);
        assert!(ws.stage(&files, "main.py", "print(1)").is_err());
    }

    #[test]
    fn snapshot_skips_reserved_dirs() {
        let root = tempfile::tempdir().expect("tempdir");
        let ws = workspace(root.path());
        fs::create_dir_all(ws.path().join(".bastion_deps/pkg")).expect("mkdir");
        fs::write(ws.path().join(".bastion_deps/pkg/mod.py"), "x").expect("write");
        fs::write(ws.path().join("out.txt"), "y").expect("write");
        let snap = ws.snapshot().expect("snapshot");
        assert_eq!(snap.len(), 1);
        assert!(snap.contains("out.txt"));
    }

    #[test]
    fn revalidate_removes_denied_output() {
        let root = tempfile::tempdir().expect("tempdir");
        let ws = workspace(root.path());
        let before = ws.snapshot().expect("snapshot");
        fs::write(ws.path().join("ok.txt"), "fine").expect("write");
        fs::write(ws.path().join("tool.exe"), "MZ").expect("write");
        let changes = before.diff(&ws.snapshot().expect("snapshot"));
        let rejected = ws.revalidate(&changes);
        assert_eq!(rejected, vec!["tool.exe"]);
        assert!(!ws.path().join("tool.exe").exists());
        assert!(ws.path().join("ok.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn revalidate_removes_escaping_symlink() {
        let root = tempfile::tempdir().expect("tempdir");
        let outside = tempfile::tempdir().expect("outside");
        let ws = workspace(root.path());
        let before = ws.snapshot().expect("snapshot");
        std::os::unix::fs::symlink(outside.path().join("x"), ws.path().join("link")).expect("symlink");
        let changes = before.diff(&ws.snapshot().expect("snapshot"));
        assert_eq!(changes.created, vec!["link"]);
        assert_eq!(ws.revalidate(&changes), vec!["link"]);
        assert!(fs::symlink_metadata(ws.path().join("link")).is_err());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let root = tempfile::tempdir().expect("tempdir");
        let ws = workspace(root.path());
        assert!(ws.cleanup().expect("cleanup"));
        assert!(!ws.cleanup().expect("second cleanup"));
        assert!(!ws.path().exists());
        assert!(ws.is_cleaned());
    }
}
