//! Per-session workspaces on local disk and relocation of build artifacts.
//!
//! All functions here are blocking; async callers go through
//! `tokio::task::spawn_blocking`.

use crate::error::{OrchestratorError, Result};
use crate::scaffold;
use crate::state::{FileMap, SessionKind};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

/// Result of writing a session's files.
#[derive(Debug)]
pub struct Materialized {
    pub path: PathBuf,
    /// Defaults written because the submission did not include them.
    pub scaffolded: Vec<&'static str>,
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    workspace_root: PathBuf,
    public_root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(workspace_root: impl Into<PathBuf>, public_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            public_root: public_root.into(),
        }
    }

    pub fn workspace_path(&self, session_id: &str) -> PathBuf {
        self.workspace_root.join(session_id)
    }

    pub fn artifact_path(&self, session_id: &str) -> PathBuf {
        self.public_root.join(session_id)
    }

    pub fn public_root(&self) -> &Path {
        &self.public_root
    }

    /// Write `files` into a fresh workspace for `session_id`.
    ///
    /// Every path is validated before the first write, so an unsafe path
    /// leaves the filesystem untouched.
    pub fn materialize(
        &self,
        session_id: &str,
        files: &FileMap,
        kind: SessionKind,
    ) -> Result<Materialized> {
        validate_session_id(session_id)?;
        if files.is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "no files submitted".to_string(),
            ));
        }

        let mut entries = Vec::with_capacity(files.len());
        let mut seen = HashSet::new();
        for (raw, content) in files {
            let relative = normalize_path(raw)?;
            if !seen.insert(relative.clone()) {
                return Err(OrchestratorError::InvalidInput(format!(
                    "duplicate path after normalization: {}",
                    raw
                )));
            }
            entries.push((relative, content.as_slice()));
        }
        check_layout(&seen, kind)?;

        let root = self.workspace_path(session_id);
        if root.exists() {
            remove_tree(&root)?;
        }
        create_dir(&root)?;

        for (relative, content) in &entries {
            write_file(&root, relative, content)?;
        }

        let mut scaffolded = Vec::new();
        for (relative, default) in scaffold::required_files(kind) {
            if seen.contains(Path::new(relative)) {
                continue;
            }
            info!(session_id, file = relative, "Synthesizing default file");
            write_file(&root, Path::new(relative), default.as_bytes())?;
            scaffolded.push(*relative);
        }

        info!(session_id, files = entries.len(), path = ?root, "Workspace materialized");
        Ok(Materialized {
            path: root,
            scaffolded,
        })
    }

    /// Remove a session workspace. Absent or half-written trees are fine.
    pub fn destroy(&self, session_id: &str) -> Result<()> {
        validate_session_id(session_id)?;
        remove_tree(&self.workspace_path(session_id))
    }

    /// Move a finished build out of the workspace into the public store.
    pub fn relocate_artifact(&self, session_id: &str, built: &Path) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        if !built.is_dir() {
            return Err(OrchestratorError::Infrastructure(format!(
                "build output missing at {}",
                built.display()
            )));
        }

        fs::create_dir_all(&self.public_root)
            .map_err(|e| OrchestratorError::infra("mkdir public root", e))?;
        let target = self.artifact_path(session_id);
        remove_tree(&target)?;

        if let Err(e) = fs::rename(built, &target) {
            // rename(2) cannot cross filesystems; fall back to copy + delete.
            warn!(session_id, error = %e, "rename failed, copying artifact");
            copy_tree(built, &target)?;
            remove_tree(built)?;
        }
        info!(session_id, path = ?target, "Artifact relocated");
        Ok(target)
    }

    /// Delete a relocated artifact. Idempotent.
    pub fn destroy_artifact(&self, session_id: &str) -> Result<()> {
        validate_session_id(session_id)?;
        remove_tree(&self.artifact_path(session_id))
    }
}

/// Strip leading separators and reject anything that could leave the root.
pub fn normalize_path(raw: &str) -> Result<PathBuf> {
    let invalid = |why: &str| OrchestratorError::InvalidInput(format!("{}: {:?}", why, raw));

    if raw.contains('\0') {
        return Err(invalid("path contains NUL"));
    }
    let trimmed = raw.trim_start_matches(['/', '\\']);

    let mut normalized = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => {
                if part.to_string_lossy().contains('\\') {
                    return Err(invalid("path contains backslash"));
                }
                normalized.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir => return Err(invalid("path escapes workspace")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("path is not relative"))
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(invalid("empty path"));
    }
    Ok(normalized)
}

/// A path used as a file must not also be a directory of another entry,
/// including the defaults that will be synthesized.
fn check_layout(paths: &HashSet<PathBuf>, kind: SessionKind) -> Result<()> {
    let defaults = scaffold::required_files(kind)
        .iter()
        .map(|(relative, _)| Path::new(*relative))
        .filter(|path| !paths.contains(*path));

    for path in paths.iter().map(PathBuf::as_path).chain(defaults) {
        for ancestor in path.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            if paths.contains(ancestor) {
                return Err(OrchestratorError::InvalidInput(format!(
                    "{} is both a file and a directory of {}",
                    ancestor.display(),
                    path.display()
                )));
            }
        }
    }
    Ok(())
}

fn validate_session_id(session_id: &str) -> Result<()> {
    let ok = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if ok {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidInput(format!(
            "malformed session id: {:?}",
            session_id
        )))
    }
}

// Directories are world-writable so the unprivileged sandbox user can emit
// build output next to the sources.
fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| OrchestratorError::infra("mkdir", e))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o777))
        .map_err(|e| OrchestratorError::infra("chmod dir", e))
}

fn write_file(root: &Path, relative: &Path, content: &[u8]) -> Result<()> {
    let full_path = root.join(relative);

    if let Some(parent) = full_path.parent() {
        let mut dir = root.to_path_buf();
        if let Ok(rest) = parent.strip_prefix(root) {
            for part in rest.components() {
                dir.push(part);
                if !dir.is_dir() {
                    create_dir(&dir)?;
                }
            }
        }
    }

    fs::write(&full_path, content).map_err(|e| OrchestratorError::infra("write file", e))?;
    fs::set_permissions(&full_path, fs::Permissions::from_mode(file_mode(content)))
        .map_err(|e| OrchestratorError::infra("chmod", e))
}

// Scripts (`gradlew`, `*.sh`) keep an execute bit when they carry a shebang.
fn file_mode(content: &[u8]) -> u32 {
    if content.starts_with(b"#!") {
        0o755
    } else {
        0o644
    }
}

fn remove_tree(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(OrchestratorError::infra("remove", e)),
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to).map_err(|e| OrchestratorError::infra("mkdir", e))?;
    let entries = fs::read_dir(from).map_err(|e| OrchestratorError::infra("read dir", e))?;
    for entry in entries {
        let entry = entry.map_err(|e| OrchestratorError::infra("read dir", e))?;
        let target = to.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|e| OrchestratorError::infra("stat", e))?;
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| OrchestratorError::infra("copy", e))?;
        }
    }
    Ok(())
}
