// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use crate::remove_dir_all_with_chmod;

/// Scratch storage under the OS temp directory.
///
/// Sandbox sessions park their overlay upper and work layers here, and
/// those layers routinely end up holding entries whose permission bits a
/// command stripped (mode-0 directories, read-only trees), so removal goes
/// through [`remove_dir_all_with_chmod`]. Removal happens at the latest on
/// drop; a tree that still cannot be removed is logged and leaked, never a
/// panic, because teardown must make progress on every exit path.
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Allocates a fresh scratch directory with the given file name prefix.
    pub fn new(prefix: &str) -> Result<Self> {
        let path = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir()
            .context("Failed to allocate a scratch directory")?
            .into_path();
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the scratch tree now, fixing up permissions as needed.
    /// Removing an already-removed tree is not an error, so a later call
    /// (or the drop) stays safe.
    pub fn remove(&self) -> Result<()> {
        remove_dir_all_with_chmod(&self.path)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!("Leaking scratch directory {}: {:#}", self.path.display(), e);
        }
    }
}
