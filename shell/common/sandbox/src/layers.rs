// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::{Path, PathBuf};

use nix::errno::Errno;
use tracing::debug;

use crate::error::Error;
use crate::mounts::{host_mount_targets, mount_overlay, mount_slug, MountGuard};

/// One mounted overlay: a writable upper directory stacked on a host lower
/// directory, visible inside the merged view at `mount_point`.
#[derive(Clone, Debug)]
pub(crate) struct Overlay {
    pub(crate) upper_dir: PathBuf,
    pub(crate) lower_dir: PathBuf,
    pub(crate) mount_point: PathBuf,
}

pub(crate) struct BuiltLayers {
    /// Root overlay first, then submount overlays in discovery order
    /// (parents before children). Teardown iterates this in reverse.
    pub(crate) overlays: Vec<Overlay>,
    /// One guard per mounted overlay; leak them once the session owns
    /// teardown.
    pub(crate) guards: Vec<MountGuard>,
}

/// Builds the layered view under `scratch`: mounts the root overlay with
/// the real root as its lower layer, then re-overlays every host submount
/// so their contents are visible and their writes are captured.
///
/// The lower layer is deliberately `/`, not the session base directory, so
/// chrooted commands find `/bin/bash` and the rest of the toolchain.
pub(crate) fn build_layers(scratch: &Path) -> Result<BuiltLayers, Error> {
    let upper_dir = scratch.join("upper");
    let work_dir = scratch.join("work");
    let merged_dir = scratch.join("merged");
    for dir in [&upper_dir, &work_dir, &merged_dir] {
        std::fs::create_dir(dir)?;
    }

    mount_overlay(Path::new("/"), &upper_dir, &work_dir, &merged_dir).map_err(|errno| {
        let source = std::io::Error::from_raw_os_error(errno as i32);
        match errno {
            Errno::EPERM | Errno::EACCES => Error::PermissionDenied { source },
            _ => Error::MountFailed { source },
        }
    })?;

    let mut overlays = vec![Overlay {
        upper_dir,
        lower_dir: PathBuf::from("/"),
        mount_point: merged_dir.clone(),
    }];
    let mut guards = vec![MountGuard::new(&merged_dir)];

    mount_submounts(scratch, &merged_dir, &mut overlays, &mut guards);

    Ok(BuiltLayers { overlays, guards })
}

/// Overlays every filesystem mounted below `/` into the merged view.
///
/// Overlayfs exposes only the contents of the single filesystem supplied
/// as its lower layer; filesystems mounted under it on the host appear as
/// empty directories. Each submount therefore gets its own nested overlay
/// with a private upper layer. A submount that cannot be overlaid keeps
/// its live host contents in the merged view.
fn mount_submounts(
    scratch: &Path,
    merged_dir: &Path,
    overlays: &mut Vec<Overlay>,
    guards: &mut Vec<MountGuard>,
) {
    let targets = match host_mount_targets() {
        Ok(targets) => targets,
        Err(e) => {
            debug!("Cannot enumerate host mounts: {}", e);
            return;
        }
    };

    for target in targets {
        if target == Path::new("/") || target.starts_with(scratch) {
            continue;
        }
        let Ok(rel) = target.strip_prefix("/") else {
            continue;
        };
        let mount_point = merged_dir.join(rel);
        if !target.is_dir() || !mount_point.is_dir() {
            continue;
        }

        let slug = mount_slug(&target);
        let sub_upper = scratch.join(format!("sub_upper{slug}"));
        let sub_work = scratch.join(format!("sub_work{slug}"));
        if let Err(e) = std::fs::create_dir(&sub_upper).and_then(|_| std::fs::create_dir(&sub_work))
        {
            debug!("Skipping submount {}: {}", target.display(), e);
            continue;
        }

        match mount_overlay(&target, &sub_upper, &sub_work, &mount_point) {
            Ok(()) => {
                overlays.push(Overlay {
                    upper_dir: sub_upper,
                    lower_dir: target.clone(),
                    mount_point: mount_point.clone(),
                });
                guards.push(MountGuard::new(&mount_point));
                debug!("Overlaid submount {}", target.display());
            }
            Err(errno) => {
                // Typically a filesystem overlayfs refuses as a lower layer
                // (proc, sysfs, ...). The submount stays visible with its
                // live host contents.
                debug!("Cannot overlay submount {}: {}", target.display(), errno);
            }
        }
    }
}
