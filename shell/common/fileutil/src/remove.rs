// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    io::ErrorKind,
    os::unix::prelude::PermissionsExt,
    path::Path,
};

use anyhow::{Context, Result};
use walkdir::WalkDir;

/// Runs a closure with the permissions of a file temporarily replaced.
///
/// The original permissions are restored after the closure returns, unless
/// the closure removed the file.
pub fn with_permissions<T>(path: &Path, mode: u32, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let old_mode = std::fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .permissions()
        .mode();
    std::fs::set_permissions(path, PermissionsExt::from_mode(mode))
        .with_context(|| format!("chmod {:03o} {}", mode, path.display()))?;

    let result = f();

    match std::fs::set_permissions(path, PermissionsExt::from_mode(old_mode)) {
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        other => other.with_context(|| format!("chmod {:03o} {}", old_mode, path.display()))?,
    }

    result
}

/// Removes a file, retrying once after making its parent directory writable.
///
/// Removing a missing file is not an error.
pub fn remove_file_with_chmod(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(_) => {}
    }

    if let Some(parent) = path.parent() {
        let _ = std::fs::set_permissions(parent, PermissionsExt::from_mode(0o777));
    }
    std::fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))
}

/// Removes a directory tree, fixing up permissions as needed.
///
/// [`std::fs::remove_dir_all`] fails when the tree contains entries the
/// current user cannot traverse or unlink. This function retries after
/// making every directory 0777 and every file 0666. Removing a missing
/// tree is not an error.
pub fn remove_dir_all_with_chmod(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(_) => {}
    }

    // The walk itself needs traversable directories, so fix permissions as
    // entries are yielded (parents are visited before their contents).
    for entry in WalkDir::new(dir) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let mode = if entry.file_type().is_dir() { 0o777 } else { 0o666 };
        let _ = std::fs::set_permissions(entry.path(), PermissionsExt::from_mode(mode));
    }

    std::fs::remove_dir_all(dir).with_context(|| format!("Failed to remove {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_missing_entries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        remove_file_with_chmod(&dir.path().join("no-such-file"))?;
        remove_dir_all_with_chmod(&dir.path().join("no-such-dir"))?;
        Ok(())
    }

    #[test]
    fn test_remove_unreadable_tree() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let bad_dir = dir.path().join("bad");
        std::fs::create_dir(&bad_dir)?;
        std::fs::write(bad_dir.join("file"), "x")?;
        std::fs::set_permissions(&bad_dir, PermissionsExt::from_mode(0o000))?;

        remove_dir_all_with_chmod(&bad_dir)?;
        assert!(!bad_dir.try_exists()?);
        Ok(())
    }

    #[test]
    fn test_with_permissions_restores_mode() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("file");
        std::fs::write(&path, "x")?;
        std::fs::set_permissions(&path, PermissionsExt::from_mode(0o640))?;

        with_permissions(&path, 0o600, || {
            assert_eq!(std::fs::metadata(&path)?.permissions().mode() & 0o777, 0o600);
            Ok(())
        })?;

        assert_eq!(std::fs::metadata(&path)?.permissions().mode() & 0o777, 0o640);
        Ok(())
    }
}
