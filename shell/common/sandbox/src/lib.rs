// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Copy-on-write filesystem sandbox built on overlayfs.
//!
//! A session overlays the entire root filesystem with a scratch upper
//! layer, hides sensitive host paths, and runs commands chrooted into the
//! merged view inside a private mount namespace. Nothing a command writes
//! reaches the host until the session is closed with `keep_changes`;
//! closing without it discards everything.
//!
//! Requires CAP_SYS_ADMIN (practically: root). Note that commands are not
//! restricted to the base directory — the whole root is visible so that
//! `/bin/bash` and friends work; the base directory only clamps where the
//! session's working directory may travel.

use std::{
    collections::BTreeSet,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use fileutil::ScratchDir;
use tracing::{info, warn};

mod commit;
mod conceal;
mod error;
mod exec;
mod layers;
mod mounts;

pub use commit::{ChangeKind, ChangedFile};
pub use conceal::ConcealProfile;
pub use error::{Error, Result};
pub use exec::RunOutput;

use layers::Overlay;

/// One open-run*-close sandbox session.
///
/// Dropping a session that was never closed discards all changes and tears
/// the overlays down, so an early return or panic in the caller cannot
/// leave mounts behind.
pub struct OverlaySandbox {
    base_dir: PathBuf,
    current_dir: PathBuf,
    scratch: ScratchDir,
    overlays: Vec<Overlay>,
    hidden: BTreeSet<PathBuf>,
    mounted: bool,
}

impl OverlaySandbox {
    /// Opens a session rooted at `base_dir` with the default concealment
    /// profile.
    pub fn open(base_dir: &Path) -> Result<Self> {
        Self::open_with(base_dir, ConcealProfile::default(), &[])
    }

    /// Opens a session rooted at `base_dir`, hiding the given profile's
    /// paths plus any extra patterns (absolute paths or globs).
    pub fn open_with(
        base_dir: &Path,
        profile: ConcealProfile,
        extra_patterns: &[String],
    ) -> Result<Self> {
        let base_dir = base_dir.canonicalize().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                Error::BaseMissing {
                    path: base_dir.to_path_buf(),
                }
            } else {
                Error::Io(e)
            }
        })?;

        let scratch = ScratchDir::new("overlay_").map_err(|e| Error::Scratch {
            message: format!("{e:#}"),
        })?;

        // Any error between here and the end of the function unwinds
        // through the guards, unmounting whatever was already stacked.
        let built = layers::build_layers(scratch.path())?;

        let mut patterns: Vec<String> = profile.patterns().iter().map(|p| p.to_string()).collect();
        patterns.extend_from_slice(extra_patterns);
        let hidden = conceal::conceal(&built.overlays, &patterns);
        info!(
            "Sandbox mounted at {} ({} overlays, {} paths hidden)",
            scratch.path().display(),
            built.overlays.len(),
            hidden.len()
        );

        for guard in built.guards {
            guard.leak();
        }

        Ok(Self {
            current_dir: base_dir.clone(),
            base_dir,
            scratch,
            overlays: built.overlays,
            hidden,
            mounted: true,
        })
    }

    /// Runs a command inside the sandbox and captures its output.
    ///
    /// A non-zero exit is reported through [`RunOutput::returncode`], never
    /// as an error. If the command succeeds and ends in a directory below
    /// the base directory, the session's working directory follows it.
    pub fn run(&mut self, argv: &[String]) -> Result<RunOutput> {
        if !self.mounted {
            return Err(Error::NotMounted);
        }
        if argv.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                "empty command",
            )));
        }

        let merged_dir = self.scratch.path().join("merged");
        let (output, next_dir) =
            exec::run_in_sandbox(&merged_dir, &self.base_dir, &self.current_dir, argv)?;
        if let Some(dir) = next_dir {
            self.current_dir = dir;
        }
        Ok(output)
    }

    /// The directory the session was opened on.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// The working directory the next command starts in.
    pub fn current_dir(&self) -> &Path {
        &self.current_dir
    }

    /// Host paths concealed from sandboxed commands.
    pub fn hidden_paths(&self) -> &BTreeSet<PathBuf> {
        &self.hidden
    }

    /// Derives the set of files the session added, modified or deleted,
    /// relative to the host. Call before [`close`](Self::close).
    pub fn changed_files(&self) -> Vec<ChangedFile> {
        if !self.mounted {
            return Vec::new();
        }
        commit::collect_changes(&self.overlays, &self.hidden)
    }

    /// Ends the session: applies the upper layers to the host when
    /// `keep_changes` is set, then unmounts every overlay in reverse order
    /// and removes the scratch storage. Idempotent, and every stage runs
    /// even when an earlier one failed, so the host mount table is always
    /// left clean.
    pub fn close(&mut self, keep_changes: bool) {
        if !self.mounted {
            return;
        }

        if keep_changes {
            commit::apply_changes(&self.overlays, &self.hidden);
        }

        for overlay in self.overlays.iter().rev() {
            mounts::unmount_best_effort(&overlay.mount_point);
        }

        if let Err(e) = self.scratch.remove() {
            warn!(
                "Leaking scratch directory {}: {:#}",
                self.scratch.path().display(),
                e
            );
        }

        self.mounted = false;
        self.overlays.clear();
    }
}

impl Drop for OverlaySandbox {
    fn drop(&mut self) {
        self.close(false);
    }
}
