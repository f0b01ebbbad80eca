//! Project-root containment for planned paths.
//!
//! Every path an edit touches is resolved through [`resolve_within_root`]
//! twice: once while validating the plan, and again immediately before the
//! write, so a symlink swapped in between is caught.

use path_clean::PathClean;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::STATE_DIR;

/// Why a planned path was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathViolation {
    Empty,
    Absolute,
    /// A `..` component, rejected outright.
    Traversal,
    /// Resolves (after following existing symlinks) outside the root.
    EscapesRoot { resolved: PathBuf },
    /// Final component is a symlink whose target does not exist.
    DanglingSymlink,
    /// Points into the engine's own state directory.
    StateDirectory,
}

impl fmt::Display for PathViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathViolation::Empty => write!(f, "empty path"),
            PathViolation::Absolute => write!(f, "absolute paths are not allowed"),
            PathViolation::Traversal => write!(f, "parent directory traversal is not allowed"),
            PathViolation::EscapesRoot { resolved } => {
                write!(f, "resolves outside the project root ({})", resolved.display())
            }
            PathViolation::DanglingSymlink => write!(f, "dangling symlink"),
            PathViolation::StateDirectory => {
                write!(f, "targets the internal {} directory", STATE_DIR)
            }
        }
    }
}

/// Canonicalise a project root, which must exist and be a directory.
pub fn canonical_root(root: &Path) -> io::Result<PathBuf> {
    let canonical = root.canonicalize()?;
    if !canonical.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("project root {} is not a directory", canonical.display()),
        ));
    }
    Ok(canonical)
}

/// Lexically check a project-relative path and join it onto `root`.
///
/// `root` must already be canonical.
pub fn join_relative(root: &Path, candidate: &Path) -> Result<PathBuf, PathViolation> {
    if candidate.as_os_str().is_empty() {
        return Err(PathViolation::Empty);
    }

    for component in candidate.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => return Err(PathViolation::Absolute),
            Component::ParentDir => return Err(PathViolation::Traversal),
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    let cleaned = candidate.clean();
    if cleaned == Path::new(".") {
        return Err(PathViolation::Empty);
    }
    if cleaned.starts_with(STATE_DIR) {
        return Err(PathViolation::StateDirectory);
    }

    Ok(root.join(cleaned))
}

/// Resolve `candidate` under `root`, following any symlinks that already
/// exist on the way and refusing anything that lands outside.
///
/// Returns the lexical absolute path (not the symlink-resolved one), which is
/// where writes are performed.
pub fn resolve_within_root(root: &Path, candidate: &Path) -> Result<PathBuf, PathViolation> {
    let full = join_relative(root, candidate)?;
    ensure_contained(root, &full)?;
    Ok(full)
}

/// Re-check an already joined absolute path against the root.
pub fn ensure_contained(root: &Path, full: &Path) -> Result<(), PathViolation> {
    if !full.starts_with(root) {
        return Err(PathViolation::EscapesRoot {
            resolved: full.to_path_buf(),
        });
    }

    if let Ok(metadata) = std::fs::symlink_metadata(full) {
        if metadata.file_type().is_symlink() {
            let target = full
                .canonicalize()
                .map_err(|_| PathViolation::DanglingSymlink)?;
            return check_prefix(root, target);
        }
    }

    // The deepest existing ancestor decides where the path really lives.
    let mut ancestor = full.parent();
    while let Some(dir) = ancestor {
        if dir.exists() {
            let resolved = dir.canonicalize().map_err(|_| PathViolation::EscapesRoot {
                resolved: dir.to_path_buf(),
            })?;
            return check_prefix(root, resolved);
        }
        ancestor = dir.parent();
    }

    Err(PathViolation::EscapesRoot {
        resolved: full.to_path_buf(),
    })
}

fn check_prefix(root: &Path, resolved: PathBuf) -> Result<(), PathViolation> {
    if resolved.starts_with(root) {
        Ok(())
    } else {
        Err(PathViolation::EscapesRoot { resolved })
    }
}

/// Display form of `full` relative to `root`.
pub fn relative_to(root: &Path, full: &Path) -> PathBuf {
    full.strip_prefix(root).unwrap_or(full).to_path_buf()
}
