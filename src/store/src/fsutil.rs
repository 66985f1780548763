//! Small filesystem helpers shared by the stores.

use std::path::Path;

use cimage_core::error::{CimageError, Result};

/// Replace `path` with `data` atomically (write tmp, rename).
///
/// Readers observe either the previous content or the new content, never a
/// partially written file.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CimageError::Other(format!("{} has no parent directory", path.display())))?;
    std::fs::create_dir_all(parent).map_err(|e| CimageError::io(parent, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| CimageError::io(parent, e))?;
    std::io::Write::write_all(&mut tmp, data).map_err(|e| CimageError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| CimageError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| CimageError::io(path, e.error))?;
    Ok(())
}

/// Calculate total size of a directory recursively. Symlinks are not followed.
pub(crate) fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let meta = entry.path().symlink_metadata()?;
            if meta.is_dir() {
                total += dir_size(&entry.path())?;
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

/// Copy a file or a directory tree to `dst`, preserving symlinks.
pub(crate) fn copy_recursive(src: &Path, dst: &Path) -> Result<()> {
    let meta = src.symlink_metadata().map_err(|e| CimageError::io(src, e))?;
    if meta.file_type().is_symlink() {
        #[cfg(unix)]
        {
            let target = std::fs::read_link(src).map_err(|e| CimageError::io(src, e))?;
            std::os::unix::fs::symlink(&target, dst).map_err(|e| CimageError::io(dst, e))?;
            return Ok(());
        }
    }

    if meta.is_dir() {
        std::fs::create_dir_all(dst).map_err(|e| CimageError::io(dst, e))?;
        for entry in std::fs::read_dir(src).map_err(|e| CimageError::io(src, e))? {
            let entry = entry.map_err(|e| CimageError::io(src, e))?;
            copy_recursive(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CimageError::io(parent, e))?;
        }
        std::fs::copy(src, dst).map_err(|e| {
            CimageError::Other(format!(
                "Failed to copy {} to {}: {}",
                src.display(),
                dst.display(),
                e
            ))
        })?;
    }
    Ok(())
}

/// Whether `path` is a directory with no entries (missing counts as empty).
pub(crate) fn is_empty_dir(path: &Path) -> Result<bool> {
    match std::fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(CimageError::io(path, e)),
    }
}

/// Remove a directory tree, ignoring a missing one.
pub(crate) fn remove_dir_all_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CimageError::io(path, e)),
    }
}
