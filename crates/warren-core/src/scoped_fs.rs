//! Per-worker scoped filesystem.
//!
//! Every worker owns one directory tree and can only reach paths inside
//! it. The root is a pure function of `(workspace_id, worker_id)`, so a
//! worker recreated under the same id finds its files again.
//!
//! # Security
//!
//! All paths arriving from sandboxed code are worker-relative and go
//! through two gates before any I/O:
//!
//! 1. Syntactic validation — absolute paths, `..` components, null bytes,
//!    and oversized paths are rejected outright.
//! 2. Escape check — the deepest existing ancestor of the resolved path
//!    (or the path itself, following symlinks) must canonicalize to a
//!    location under the canonical root.
//!
//! Provisioning is synchronous so worker creation can fail fast before the
//! host process is ever contacted; the data-path operations are async.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::worker::WorkerId;

/// Maximum length of a worker-relative path in bytes.
pub const MAX_REL_PATH_LEN: usize = 4096;

/// Mode reported for regular files on platforms without Unix modes.
pub const DEFAULT_FILE_MODE: u32 = 0o100_644;

/// Mode reported for directories on platforms without Unix modes.
pub const DEFAULT_DIR_MODE: u32 = 0o40_755;

/// Deterministic scoped root for a worker.
///
/// The layout is `<base_dir>/<workspace_id>/<worker_id>`.
#[must_use]
pub fn worker_root(base_dir: &Path, workspace_id: &str, worker_id: &WorkerId) -> PathBuf {
    base_dir.join(workspace_id).join(worker_id.as_str())
}

/// Handle to one worker's directory tree.
#[derive(Debug, Clone)]
pub struct ScopedFs {
    /// Canonicalized root; every operation resolves under it.
    root: PathBuf,
}

impl ScopedFs {
    /// Create (or reattach to) the scoped root for a worker.
    ///
    /// Runs synchronously: creation failures must surface before the host
    /// process is asked to do anything for this worker.
    ///
    /// # Errors
    ///
    /// [`ScopedFsError::InvalidPath`] for a malformed workspace id and
    /// [`ScopedFsError::Provision`] when the directory cannot be created
    /// or canonicalized.
    pub fn provision(
        base_dir: &Path,
        workspace_id: &str,
        worker_id: &WorkerId,
    ) -> Result<Self, ScopedFsError> {
        // Workspace ids share the worker-id charset; both become single
        // path components.
        WorkerId::parse(workspace_id).map_err(|e| ScopedFsError::InvalidPath {
            path: workspace_id.to_string(),
            reason: format!("invalid workspace id: {e}"),
        })?;

        let root = worker_root(base_dir, workspace_id, worker_id);
        std::fs::create_dir_all(&root).map_err(|source| ScopedFsError::Provision {
            path: root.display().to_string(),
            source,
        })?;
        let root = std::fs::canonicalize(&root).map_err(|source| ScopedFsError::Provision {
            path: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    /// The canonical root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read a file's raw contents.
    ///
    /// # Errors
    ///
    /// Path validation, escape, or I/O failures.
    pub async fn read_file(&self, rel: &str) -> Result<Vec<u8>, ScopedFsError> {
        let path = self.resolve(rel)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| ScopedFsError::io("read", rel, e))
    }

    /// Write a file atomically (temp file + rename), creating parent
    /// directories as needed.
    ///
    /// # Errors
    ///
    /// Path validation, escape, or I/O failures.
    pub async fn write_file(&self, rel: &str, contents: &[u8]) -> Result<(), ScopedFsError> {
        let path = self.resolve(rel)?;
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return Err(ScopedFsError::InvalidPath {
                path: rel.to_string(),
                reason: "path has no file name".to_string(),
            });
        };
        let Some(parent) = path.parent() else {
            return Err(ScopedFsError::InvalidPath {
                path: rel.to_string(),
                reason: "path has no parent directory".to_string(),
            });
        };
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ScopedFsError::io("write", rel, e))?;

        let tmp = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| ScopedFsError::io("write", rel, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ScopedFsError::io("write", rel, e));
        }
        Ok(())
    }

    /// List a directory, sorted by name.
    ///
    /// # Errors
    ///
    /// Path validation, escape, or I/O failures.
    pub async fn read_dir(&self, rel: &str) -> Result<Vec<DirEntryInfo>, ScopedFsError> {
        let path = self.resolve(rel)?;
        let mut reader = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| ScopedFsError::io("readdir", rel, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| ScopedFsError::io("readdir", rel, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| ScopedFsError::io("readdir", rel, e))?;
            entries.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_file: file_type.is_file(),
                is_directory: file_type.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Stat a path (following symlinks) into the normalized [`FileStat`].
    ///
    /// # Errors
    ///
    /// Path validation, escape, or I/O failures.
    pub async fn stat(&self, rel: &str) -> Result<FileStat, ScopedFsError> {
        let path = self.resolve(rel)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| ScopedFsError::io("stat", rel, e))?;
        Ok(FileStat::from_metadata(&meta))
    }

    /// Create a directory, including missing parents.
    ///
    /// # Errors
    ///
    /// Path validation, escape, or I/O failures.
    pub async fn mkdir(&self, rel: &str) -> Result<(), ScopedFsError> {
        let path = self.resolve(rel)?;
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| ScopedFsError::io("mkdir", rel, e))
    }

    /// Remove a file, or a directory tree recursively.
    ///
    /// # Errors
    ///
    /// Path validation, escape, or I/O failures (including a missing
    /// target).
    pub async fn rm(&self, rel: &str) -> Result<(), ScopedFsError> {
        let path = self.resolve(rel)?;
        let meta = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|e| ScopedFsError::io("rm", rel, e))?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|e| ScopedFsError::io("rm", rel, e))
        } else {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| ScopedFsError::io("rm", rel, e))
        }
    }

    /// Whether a path exists (following symlinks).
    ///
    /// # Errors
    ///
    /// Path validation or escape failures; a missing target is `Ok(false)`.
    pub async fn exists(&self, rel: &str) -> Result<bool, ScopedFsError> {
        let path = self.resolve(rel)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| ScopedFsError::io("exists", rel, e))
    }

    /// Remove a single file. Directories are refused.
    ///
    /// # Errors
    ///
    /// Path validation, escape, or I/O failures.
    pub async fn unlink(&self, rel: &str) -> Result<(), ScopedFsError> {
        let path = self.resolve(rel)?;
        let meta = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|e| ScopedFsError::io("unlink", rel, e))?;
        if meta.is_dir() {
            return Err(ScopedFsError::InvalidPath {
                path: rel.to_string(),
                reason: "unlink target is a directory".to_string(),
            });
        }
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| ScopedFsError::io("unlink", rel, e))
    }

    /// Remove the whole scoped tree. Missing roots are fine (idempotent).
    ///
    /// Called on worker termination confirmation, never on the termination
    /// request itself.
    ///
    /// # Errors
    ///
    /// I/O failures other than a missing root.
    pub async fn destroy(&self) -> Result<(), ScopedFsError> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ScopedFsError::io("destroy", &self.root.display().to_string(), e)),
        }
    }

    /// Validate `rel` and resolve it to an absolute path under the root.
    fn resolve(&self, rel: &str) -> Result<PathBuf, ScopedFsError> {
        validate_rel_path(rel)?;
        let joined = self.root.join(rel);
        self.check_escape(rel, &joined)?;
        Ok(joined)
    }

    /// Verify that `joined` cannot leave the root via symlinks.
    fn check_escape(&self, rel: &str, joined: &Path) -> Result<(), ScopedFsError> {
        let resolved = match std::fs::symlink_metadata(joined) {
            // The target exists (possibly as a symlink): resolve it fully.
            Ok(meta) => match std::fs::canonicalize(joined) {
                Ok(resolved) => resolved,
                // A symlink that cannot be resolved is refused rather than
                // followed blindly by the subsequent operation.
                Err(_) if meta.file_type().is_symlink() => {
                    return Err(ScopedFsError::Escape {
                        path: rel.to_string(),
                    });
                }
                Err(e) => return Err(ScopedFsError::io("resolve", rel, e)),
            },
            // Not there yet (e.g. a write target): check the deepest
            // existing ancestor instead.
            Err(_) => {
                let mut ancestor = joined.parent();
                loop {
                    match ancestor {
                        Some(dir) if dir.exists() => {
                            break std::fs::canonicalize(dir)
                                .map_err(|e| ScopedFsError::io("resolve", rel, e))?;
                        }
                        Some(dir) => ancestor = dir.parent(),
                        None => {
                            return Err(ScopedFsError::Escape {
                                path: rel.to_string(),
                            })
                        }
                    }
                }
            }
        };
        if resolved.starts_with(&self.root) {
            Ok(())
        } else {
            Err(ScopedFsError::Escape {
                path: rel.to_string(),
            })
        }
    }
}

/// Syntactic validation for a worker-relative path.
///
/// # Errors
///
/// [`ScopedFsError::InvalidPath`] naming the first violation.
pub fn validate_rel_path(rel: &str) -> Result<(), ScopedFsError> {
    let fail = |reason: &str| {
        Err(ScopedFsError::InvalidPath {
            path: rel.to_string(),
            reason: reason.to_string(),
        })
    };
    if rel.is_empty() {
        return fail("path is empty");
    }
    if rel.len() > MAX_REL_PATH_LEN {
        return fail("path is too long");
    }
    if rel.contains('\0') {
        return fail("path contains a null byte");
    }
    let path = Path::new(rel);
    if path.is_absolute() {
        return fail("path must be relative");
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return fail("path contains `..`"),
            Component::RootDir | Component::Prefix(_) => {
                return fail("path must be relative");
            }
        }
    }
    Ok(())
}

/// One `readdir` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntryInfo {
    /// File name within the listed directory.
    pub name: String,
    /// Whether the entry is a regular file.
    pub is_file: bool,
    /// Whether the entry is a directory.
    pub is_directory: bool,
}

/// Normalized stat result.
///
/// `mtime`/`ctime` are RFC 3339 strings; `mode` falls back to
/// [`DEFAULT_FILE_MODE`]/[`DEFAULT_DIR_MODE`] on platforms without Unix
/// modes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    /// Whether the target is a regular file.
    pub is_file: bool,
    /// Whether the target is a directory.
    pub is_directory: bool,
    /// Size in bytes.
    pub size: u64,
    /// Modification time, RFC 3339.
    pub mtime: String,
    /// Change (or creation) time, RFC 3339.
    pub ctime: String,
    /// Unix mode, synthesized where the platform has none.
    pub mode: u32,
}

impl FileStat {
    /// Normalize platform metadata.
    #[must_use]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        Self {
            is_file: meta.is_file(),
            is_directory: meta.is_dir(),
            size: meta.len(),
            mtime: rfc3339_of(meta.modified().ok()),
            ctime: ctime_of(meta),
            mode: mode_of(meta),
        }
    }
}

fn rfc3339_of(time: Option<std::time::SystemTime>) -> String {
    let datetime: chrono::DateTime<chrono::Utc> = match time {
        Some(t) => t.into(),
        None => chrono::DateTime::UNIX_EPOCH,
    };
    datetime.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(unix)]
fn ctime_of(meta: &std::fs::Metadata) -> String {
    use std::os::unix::fs::MetadataExt;
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let datetime = chrono::DateTime::from_timestamp(meta.ctime(), meta.ctime_nsec() as u32)
        .unwrap_or(chrono::DateTime::UNIX_EPOCH);
    datetime.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(not(unix))]
fn ctime_of(meta: &std::fs::Metadata) -> String {
    rfc3339_of(meta.created().ok().or_else(|| meta.modified().ok()))
}

#[cfg(unix)]
fn mode_of(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode()
}

#[cfg(not(unix))]
fn mode_of(meta: &std::fs::Metadata) -> u32 {
    if meta.is_dir() {
        DEFAULT_DIR_MODE
    } else {
        DEFAULT_FILE_MODE
    }
}

/// Scoped filesystem failure.
#[derive(Debug, Error)]
pub enum ScopedFsError {
    /// The path failed syntactic validation.
    #[error("invalid path `{path}`: {reason}")]
    InvalidPath {
        /// The offending path.
        path: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The path resolves outside the worker root.
    #[error("path `{path}` escapes the worker root")]
    Escape {
        /// The offending path.
        path: String,
    },

    /// The scoped root could not be created.
    #[error("failed to provision worker root `{path}`: {source}")]
    Provision {
        /// The root that failed.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An operation failed with an I/O error.
    #[error("{op} failed for `{path}`: {source}")]
    Io {
        /// Operation name.
        op: &'static str,
        /// The path involved.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl ScopedFsError {
    fn io(op: &'static str, path: &str, source: std::io::Error) -> Self {
        ScopedFsError::Io {
            op,
            path: path.to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tempfile::TempDir;

    use super::*;

    fn scoped(dir: &TempDir) -> ScopedFs {
        let id = WorkerId::parse("w1").unwrap();
        ScopedFs::provision(dir.path(), "ws", &id).unwrap()
    }

    #[test]
    fn test_root_is_deterministic() {
        let id = WorkerId::parse("w1").unwrap();
        let a = worker_root(Path::new("/base"), "ws", &id);
        let b = worker_root(Path::new("/base"), "ws", &id);
        assert_eq!(a, b);
        assert_eq!(a, PathBuf::from("/base/ws/w1"));
    }

    #[test]
    fn test_provision_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let id = WorkerId::parse("w1").unwrap();
        let first = ScopedFs::provision(dir.path(), "ws", &id).unwrap();
        let second = ScopedFs::provision(dir.path(), "ws", &id).unwrap();
        assert_eq!(first.root(), second.root());
        assert!(first.root().is_dir());
    }

    #[test]
    fn test_provision_rejects_bad_workspace_id() {
        let dir = TempDir::new().unwrap();
        let id = WorkerId::parse("w1").unwrap();
        assert!(matches!(
            ScopedFs::provision(dir.path(), "../ws", &id),
            Err(ScopedFsError::InvalidPath { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let fs = scoped(&dir);
        fs.write_file("nested/deep/notes.txt", b"hello sandbox")
            .await
            .unwrap();
        let contents = fs.read_file("nested/deep/notes.txt").await.unwrap();
        assert_eq!(contents, b"hello sandbox");
    }

    #[tokio::test]
    async fn test_write_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let fs = scoped(&dir);
        fs.write_file("a.txt", b"one").await.unwrap();
        fs.write_file("a.txt", b"two").await.unwrap();
        let entries = fs.read_dir(".").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(fs.read_file("a.txt").await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_paths() {
        let dir = TempDir::new().unwrap();
        let fs = scoped(&dir);
        for bad in ["", "/etc/passwd", "..", "../sibling", "a/../../b", "a\0b"] {
            let err = fs.read_file(bad).await.unwrap_err();
            assert!(
                matches!(err, ScopedFsError::InvalidPath { .. }),
                "expected InvalidPath for {bad:?}, got {err}"
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_is_refused() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"top secret").unwrap();

        let fs = scoped(&dir);
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), fs.root().join("link"))
            .unwrap();

        let err = fs.read_file("link").await.unwrap_err();
        assert!(matches!(err, ScopedFsError::Escape { .. }), "got {err}");

        // Writing through an escaping symlink is refused too.
        let err = fs.write_file("link", b"overwrite").await.unwrap_err();
        assert!(matches!(err, ScopedFsError::Escape { .. }), "got {err}");
        assert_eq!(
            std::fs::read(outside.path().join("secret.txt")).unwrap(),
            b"top secret"
        );
    }

    #[tokio::test]
    async fn test_exists_and_unlink() {
        let dir = TempDir::new().unwrap();
        let fs = scoped(&dir);
        assert!(!fs.exists("gone.txt").await.unwrap());
        fs.write_file("gone.txt", b"x").await.unwrap();
        assert!(fs.exists("gone.txt").await.unwrap());
        fs.unlink("gone.txt").await.unwrap();
        assert!(!fs.exists("gone.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_unlink_refuses_directories() {
        let dir = TempDir::new().unwrap();
        let fs = scoped(&dir);
        fs.mkdir("subdir").await.unwrap();
        let err = fs.unlink("subdir").await.unwrap_err();
        assert!(matches!(err, ScopedFsError::InvalidPath { .. }));
        assert!(fs.exists("subdir").await.unwrap());
    }

    #[tokio::test]
    async fn test_rm_removes_trees_and_files() {
        let dir = TempDir::new().unwrap();
        let fs = scoped(&dir);
        fs.write_file("tree/a/b.txt", b"x").await.unwrap();
        fs.rm("tree").await.unwrap();
        assert!(!fs.exists("tree").await.unwrap());

        fs.write_file("single.txt", b"x").await.unwrap();
        fs.rm("single.txt").await.unwrap();
        assert!(!fs.exists("single.txt").await.unwrap());

        // A missing target is an error, matching the underlying API.
        assert!(fs.rm("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_stat_normalization() {
        let dir = TempDir::new().unwrap();
        let fs = scoped(&dir);
        fs.write_file("file.bin", &[0u8; 64]).await.unwrap();
        fs.mkdir("subdir").await.unwrap();

        let file = fs.stat("file.bin").await.unwrap();
        assert!(file.is_file);
        assert!(!file.is_directory);
        assert_eq!(file.size, 64);
        assert!(chrono::DateTime::parse_from_rfc3339(&file.mtime).is_ok());
        assert!(chrono::DateTime::parse_from_rfc3339(&file.ctime).is_ok());

        let subdir = fs.stat("subdir").await.unwrap();
        assert!(subdir.is_directory);
        assert!(!subdir.is_file);
        assert_ne!(subdir.mode, 0);

        let json = serde_json::to_string(&file).unwrap();
        assert!(json.contains("\"isFile\":true"), "{json}");
        assert!(json.contains("\"isDirectory\":false"), "{json}");
    }

    #[cfg(not(unix))]
    #[tokio::test]
    async fn test_stat_synthesizes_default_modes() {
        let dir = TempDir::new().unwrap();
        let fs = scoped(&dir);
        fs.write_file("file.txt", b"x").await.unwrap();
        fs.mkdir("subdir").await.unwrap();
        assert_eq!(fs.stat("file.txt").await.unwrap().mode, DEFAULT_FILE_MODE);
        assert_eq!(fs.stat("subdir").await.unwrap().mode, DEFAULT_DIR_MODE);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let fs = scoped(&dir);
        fs.write_file("data.txt", b"x").await.unwrap();
        fs.destroy().await.unwrap();
        assert!(!fs.root().exists());
        fs.destroy().await.unwrap();
    }

    proptest! {
        #[test]
        fn prop_validate_never_panics(rel in ".*") {
            let _ = validate_rel_path(&rel);
        }

        #[test]
        fn prop_accepted_paths_have_no_parent_components(rel in ".*") {
            if validate_rel_path(&rel).is_ok() {
                let has_parent = Path::new(&rel)
                    .components()
                    .any(|c| matches!(c, Component::ParentDir));
                prop_assert!(!has_parent);
                prop_assert!(!Path::new(&rel).is_absolute());
            }
        }
    }
}
