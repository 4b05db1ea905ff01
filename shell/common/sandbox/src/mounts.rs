// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    ffi::OsString,
    fs::File,
    io::{self, BufRead, BufReader},
    os::unix::ffi::OsStringExt,
    path::{Path, PathBuf},
};

use nix::mount::{mount, umount, umount2, MntFlags, MsFlags};
use tracing::warn;

/// Mounts an overlay with a single lower directory at `target`.
pub(crate) fn mount_overlay(
    lower_dir: &Path,
    upper_dir: &Path,
    work_dir: &Path,
    target: &Path,
) -> nix::Result<()> {
    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        lower_dir.display(),
        upper_dir.display(),
        work_dir.display()
    );
    mount(
        Some("overlay"),
        target,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
}

/// Unmounts a mount point, falling back to a lazy detach when the plain
/// unmount reports the target as busy. Failures are logged, not returned;
/// teardown keeps going regardless.
pub(crate) fn unmount_best_effort(target: &Path) {
    if umount(target).is_ok() {
        return;
    }
    if let Err(e) = umount2(target, MntFlags::MNT_DETACH) {
        warn!("Failed to unmount {}: {}", target.display(), e);
    }
}

/// Unmounts a mount point on drop unless leaked.
///
/// Held while a session is still being assembled, so that an error on any
/// later setup step cannot leave stray overlay mounts in the host mount
/// table.
#[must_use]
pub(crate) struct MountGuard {
    dir: Option<PathBuf>,
}

impl MountGuard {
    pub(crate) fn new(dir: &Path) -> Self {
        Self {
            dir: Some(dir.to_path_buf()),
        }
    }

    /// Forgets this mount point. After calling this method, it is your
    /// responsibility to unmount it.
    pub(crate) fn leak(mut self) {
        self.dir = None;
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            unmount_best_effort(&dir);
        }
    }
}

/// Enumerates the mount targets of the current mount namespace, parents
/// before children (ascending path length, ties broken lexicographically).
pub(crate) fn host_mount_targets() -> io::Result<Vec<PathBuf>> {
    let file = File::open("/proc/self/mounts")?;
    let mut targets = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if let Some(field) = line.split_whitespace().nth(1) {
            targets.push(unescape_mount_path(field));
        }
    }
    targets.sort_by(|a, b| {
        (a.as_os_str().len(), a.as_os_str()).cmp(&(b.as_os_str().len(), b.as_os_str()))
    });
    targets.dedup();
    Ok(targets)
}

/// Decodes the octal escapes (`\040` for space etc.) used in
/// /proc/self/mounts fields.
fn unescape_mount_path(field: &str) -> PathBuf {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(u8::is_ascii_digit)
        {
            if let Ok(value) = u8::from_str_radix(&field[i + 1..i + 4], 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    PathBuf::from(OsString::from_vec(out))
}

/// Turns a mount target into the directory-name suffix used for its
/// per-submount upper and work directories: `/` becomes `_`, so `/home`
/// maps to `sub_upper_home`.
pub(crate) fn mount_slug(target: &Path) -> String {
    target.to_string_lossy().replace('/', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescapes_octal_sequences() {
        assert_eq!(
            unescape_mount_path(r"/mnt/with\040space"),
            PathBuf::from("/mnt/with space")
        );
        assert_eq!(
            unescape_mount_path(r"/mnt/tab\011here"),
            PathBuf::from("/mnt/tab\there")
        );
        assert_eq!(unescape_mount_path("/plain"), PathBuf::from("/plain"));
        // A trailing backslash without digits is kept as-is.
        assert_eq!(unescape_mount_path(r"/odd\"), PathBuf::from(r"/odd\"));
    }

    #[test]
    fn slugs_replace_every_separator() {
        assert_eq!(mount_slug(Path::new("/home")), "_home");
        assert_eq!(mount_slug(Path::new("/var/lib/docker")), "_var_lib_docker");
    }

    #[test]
    fn targets_are_sorted_parents_first() {
        let mut targets = vec![
            PathBuf::from("/home/user/mnt"),
            PathBuf::from("/"),
            PathBuf::from("/home"),
        ];
        targets.sort_by(|a, b| {
            (a.as_os_str().len(), a.as_os_str()).cmp(&(b.as_os_str().len(), b.as_os_str()))
        });
        assert_eq!(
            targets,
            vec![
                PathBuf::from("/"),
                PathBuf::from("/home"),
                PathBuf::from("/home/user/mnt"),
            ]
        );
    }

    #[test]
    fn reads_the_host_mount_table() {
        let targets = host_mount_targets().unwrap();
        assert!(targets.contains(&PathBuf::from("/")));
    }
}
