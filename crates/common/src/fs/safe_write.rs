use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

const TMP_SUFFIX: &str = ".editgate.tmp";

// Unique temporary names within a process.
static NEXT_TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum SafeWriteError {
    #[error("content size {size} exceeds maximum {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("failed to {operation} '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        operation: &'static str,
        #[source]
        source: io::Error,
    },
}

impl SafeWriteError {
    fn io(path: &Path, operation: &'static str, source: io::Error) -> Self {
        SafeWriteError::Io {
            path: path.to_path_buf(),
            operation,
            source,
        }
    }
}

/// Writes whole files through a sibling temporary file and a rename, so a
/// reader never observes a half-written file under the real name.
#[derive(Debug, Clone)]
pub struct AtomicWriter {
    max_file_size: Option<usize>,
}

impl Default for AtomicWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicWriter {
    pub fn new() -> Self {
        Self {
            max_file_size: Some(2 * 1024 * 1024), // 2MB default max
        }
    }

    pub fn with_max_size(mut self, max_size: Option<usize>) -> Self {
        self.max_file_size = max_size;
        self
    }

    fn validate_content(&self, content: &[u8]) -> Result<(), SafeWriteError> {
        if let Some(max) = self.max_file_size {
            if content.len() > max {
                return Err(SafeWriteError::TooLarge {
                    size: content.len(),
                    max,
                });
            }
        }
        Ok(())
    }

    /// Replace `path` with `content`, creating parent directories as needed.
    ///
    /// Permissions of an existing destination are carried over.
    pub fn write(&self, path: &Path, content: &[u8]) -> Result<(), SafeWriteError> {
        self.validate_content(content)?;

        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        if !parent.exists() {
            fs::create_dir_all(parent)
                .map_err(|e| SafeWriteError::io(parent, "create parent directories", e))?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let counter = NEXT_TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_path = parent.join(format!(
            ".{}.{}.{}{}",
            file_name,
            std::process::id(),
            counter,
            TMP_SUFFIX
        ));

        let result = write_temp_then_rename(&temp_path, path, content);
        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        result?;

        fsync_parent_dir(path);
        Ok(())
    }
}

fn write_temp_then_rename(
    temp_path: &Path,
    path: &Path,
    content: &[u8],
) -> Result<(), SafeWriteError> {
    let mut temp_file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp_path)
        .map_err(|e| SafeWriteError::io(temp_path, "create temp file", e))?;

    temp_file
        .write_all(content)
        .map_err(|e| SafeWriteError::io(temp_path, "write to temp file", e))?;

    temp_file
        .sync_all()
        .map_err(|e| SafeWriteError::io(temp_path, "sync temp file", e))?;
    drop(temp_file);

    if let Ok(existing) = fs::metadata(path) {
        if existing.is_file() {
            fs::set_permissions(temp_path, existing.permissions())
                .map_err(|e| SafeWriteError::io(temp_path, "copy permissions", e))?;
        }
    }

    fs::rename(temp_path, path).map_err(|e| SafeWriteError::io(path, "atomic rename", e))
}

#[cfg(unix)]
fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn fsync_parent_dir(_path: &Path) {}

/// Remove a file, treating an absent file as success. Returns whether a file
/// was actually removed.
pub fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
