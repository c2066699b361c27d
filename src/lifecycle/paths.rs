//! Installation path validation
//!
//! Proposal files are relative paths that must sit under one of the allowed
//! installation directories and must resolve (after following symlinks) to a
//! location inside the instance root.

use std::path::{Component, Path, PathBuf};

use crate::error::{EvolveError, Result};

/// Directories, relative to the instance root, that proposals may write into
pub const ALLOWED_INSTALL_DIRS: &[&str] = &[
    "evolved/skills",
    "evolved/hooks",
    "evolved/agents",
    "evolved/commands",
    "evolved/mcp-servers",
];

/// Whether a relative path starts with an allowed installation directory
pub fn is_allowed(rel_path: &str) -> bool {
    ALLOWED_INSTALL_DIRS.iter().any(|dir| {
        rel_path
            .strip_prefix(dir)
            .map(|rest| rest.starts_with('/') || rest.starts_with('\\'))
            .unwrap_or(false)
    })
}

/// Canonicalize the longest existing ancestor and append the rest
fn resolve_lenient(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut missing = Vec::new();
    while std::fs::symlink_metadata(&existing).is_err() {
        match existing.file_name() {
            Some(name) => missing.push(name.to_os_string()),
            None => break,
        }
        if !existing.pop() {
            break;
        }
    }

    let mut resolved = existing.canonicalize()?;
    for name in missing.iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

/// The canonical instance root that installations are confined to
#[derive(Debug, Clone)]
pub struct InstallRoot {
    root: PathBuf,
}

impl InstallRoot {
    /// Create the root directory if needed and canonicalize it
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self { root: root.canonicalize()? })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Check the allow-list, then resolve and confine to the root
    pub fn validate(&self, rel_path: &str) -> Result<PathBuf> {
        if !is_allowed(rel_path) {
            return Err(EvolveError::PathNotAllowed(rel_path.to_string()));
        }
        self.resolve(rel_path)
    }

    /// Resolve a relative path and assert it stays inside the root
    pub fn resolve(&self, rel_path: &str) -> Result<PathBuf> {
        let candidate = Path::new(rel_path);
        let suspicious = rel_path.contains("..")
            || rel_path.starts_with('/')
            || rel_path.starts_with('~')
            || candidate.is_absolute()
            || candidate
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if suspicious {
            return Err(EvolveError::PathTraversal(rel_path.to_string()));
        }

        let resolved = resolve_lenient(&self.root.join(candidate))
            .map_err(|e| EvolveError::PathTraversal(format!("{} ({})", rel_path, e)))?;
        if resolved == self.root || !resolved.starts_with(&self.root) {
            return Err(EvolveError::PathTraversal(format!(
                "{} resolves outside {}",
                rel_path,
                self.root.display()
            )));
        }
        Ok(resolved)
    }

    /// Path relative to the root, for display and capability records
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}
