// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    collections::BTreeSet,
    os::unix::fs::{symlink, FileTypeExt, MetadataExt},
    path::{Path, PathBuf},
};

use tracing::warn;
use walkdir::WalkDir;

use crate::conceal::OPAQUE_XATTR;
use crate::layers::Overlay;

/// How a path in the merged view diverged from the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// One divergence between an upper layer and its lower directory.
#[derive(Clone, Debug)]
pub struct ChangedFile {
    /// The logical host path, e.g. `/tmp/t/a.txt`.
    pub path: PathBuf,
    pub kind: ChangeKind,
    /// Physical location of the new content in the upper layer. For a
    /// deletion this is the whiteout marker.
    pub upper_path: PathBuf,
    /// Physical location of the pre-session content on the host.
    pub lower_path: PathBuf,
}

/// Classification of a single upper-layer entry. Overlayfs encodes its
/// intent in file types and xattrs; everything acts on this enum rather
/// than re-testing metadata at each use site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UpperEntry {
    /// Character device 0:0 — the lower entry is deleted.
    Whiteout,
    Regular,
    Symlink,
    Directory,
    /// Directory carrying `trusted.overlay.opaque=y` — replaces the lower
    /// subtree entirely.
    OpaqueDir,
    /// Sockets, fifos, real device nodes: nothing we can usefully carry
    /// over.
    Skip,
}

fn classify(path: &Path) -> UpperEntry {
    let Ok(metadata) = std::fs::symlink_metadata(path) else {
        return UpperEntry::Skip;
    };
    let file_type = metadata.file_type();

    if file_type.is_symlink() {
        UpperEntry::Symlink
    } else if file_type.is_char_device() && metadata.rdev() == 0 {
        UpperEntry::Whiteout
    } else if file_type.is_dir() {
        match xattr::get(path, OPAQUE_XATTR) {
            Ok(Some(value)) if value == b"y" => UpperEntry::OpaqueDir,
            _ => UpperEntry::Directory,
        }
    } else if file_type.is_file() {
        UpperEntry::Regular
    } else {
        UpperEntry::Skip
    }
}

/// Derives the change set from the upper layers without touching the host.
///
/// Markers planted by the concealer are not changes: a session that hid
/// `/etc/shadow` and committed must not delete `/etc/shadow`, so anything
/// recorded in `hidden` is excluded here and in [`apply_changes`].
pub(crate) fn collect_changes(
    overlays: &[Overlay],
    hidden: &BTreeSet<PathBuf>,
) -> Vec<ChangedFile> {
    let mut changes = Vec::new();

    for overlay in overlays {
        let mut it = WalkDir::new(&overlay.upper_dir).min_depth(1).into_iter();
        while let Some(entry) = it.next() {
            let Ok(entry) = entry else { continue };
            let Ok(rel) = entry.path().strip_prefix(&overlay.upper_dir) else {
                continue;
            };
            let logical = overlay.lower_dir.join(rel);

            match classify(entry.path()) {
                UpperEntry::Whiteout => {
                    if hidden.contains(&logical) {
                        continue;
                    }
                    if std::fs::symlink_metadata(&logical).is_ok() {
                        changes.push(ChangedFile {
                            path: logical.clone(),
                            kind: ChangeKind::Deleted,
                            upper_path: entry.path().to_path_buf(),
                            lower_path: logical,
                        });
                    }
                }
                UpperEntry::Regular | UpperEntry::Symlink => {
                    let kind = if std::fs::symlink_metadata(&logical).is_ok() {
                        ChangeKind::Modified
                    } else {
                        ChangeKind::Added
                    };
                    changes.push(ChangedFile {
                        path: logical.clone(),
                        kind,
                        upper_path: entry.path().to_path_buf(),
                        lower_path: logical,
                    });
                }
                UpperEntry::OpaqueDir => {
                    if hidden.contains(&logical) {
                        it.skip_current_dir();
                    }
                }
                UpperEntry::Directory | UpperEntry::Skip => {}
            }
        }
    }

    changes
}

/// Applies every overlay's upper layer to its lower directory, in forward
/// overlay order. Each overlay gets two passes: deletions first, then
/// additions and modifications, so that a path replaced by an entry of a
/// different type never collides with its old self. Per-file failures are
/// logged and skipped.
pub(crate) fn apply_changes(overlays: &[Overlay], hidden: &BTreeSet<PathBuf>) {
    for overlay in overlays {
        apply_deletions(overlay, hidden);
        apply_additions(overlay, hidden);
    }
}

fn apply_deletions(overlay: &Overlay, hidden: &BTreeSet<PathBuf>) {
    let mut it = WalkDir::new(&overlay.upper_dir).min_depth(1).into_iter();
    while let Some(entry) = it.next() {
        let Ok(entry) = entry else { continue };
        let Ok(rel) = entry.path().strip_prefix(&overlay.upper_dir) else {
            continue;
        };
        let logical = overlay.lower_dir.join(rel);

        match classify(entry.path()) {
            UpperEntry::Whiteout => {
                if hidden.contains(&logical) {
                    continue;
                }
                if let Err(e) = remove_lower(&logical) {
                    warn!("Failed to delete {}: {}", logical.display(), e);
                }
            }
            UpperEntry::OpaqueDir => {
                if hidden.contains(&logical) {
                    it.skip_current_dir();
                }
            }
            _ => {}
        }
    }
}

fn apply_additions(overlay: &Overlay, hidden: &BTreeSet<PathBuf>) {
    let mut it = WalkDir::new(&overlay.upper_dir).min_depth(1).into_iter();
    while let Some(entry) = it.next() {
        let Ok(entry) = entry else { continue };
        let Ok(rel) = entry.path().strip_prefix(&overlay.upper_dir) else {
            continue;
        };
        let logical = overlay.lower_dir.join(rel);

        let result = match classify(entry.path()) {
            UpperEntry::Directory => std::fs::create_dir_all(&logical),
            UpperEntry::OpaqueDir => {
                if hidden.contains(&logical) {
                    it.skip_current_dir();
                    continue;
                }
                std::fs::create_dir_all(&logical)
            }
            UpperEntry::Regular => copy_file(entry.path(), &logical),
            UpperEntry::Symlink => copy_symlink(entry.path(), &logical),
            UpperEntry::Whiteout | UpperEntry::Skip => continue,
        };

        if let Err(e) = result {
            warn!("Failed to apply {}: {}", logical.display(), e);
        }
    }
}

fn remove_lower(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Err(_) => Ok(()),
        Ok(m) if m.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
    }
}

/// Copies an upper file over its lower path, preserving content, mode and
/// mtime. A lower entry of a different type is removed first.
fn copy_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    if let Ok(m) = std::fs::symlink_metadata(dst) {
        if !m.is_file() {
            remove_lower(dst)?;
        }
    }
    let metadata = std::fs::metadata(src)?;
    std::fs::copy(src, dst)?;
    let dst_file = std::fs::File::options().write(true).open(dst)?;
    dst_file.set_modified(metadata.modified()?)?;
    Ok(())
}

fn copy_symlink(src: &Path, dst: &Path) -> std::io::Result<()> {
    remove_lower(dst)?;
    let target = std::fs::read_link(src)?;
    symlink(target, dst)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use nix::sys::stat::{mknod, Mode, SFlag};

    use super::*;

    struct Fixture {
        _root: tempfile::TempDir,
        overlay: Overlay,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let upper = root.path().join("upper");
        let lower = root.path().join("lower");
        std::fs::create_dir_all(&upper).unwrap();
        std::fs::create_dir_all(&lower).unwrap();
        let overlay = Overlay {
            upper_dir: upper,
            lower_dir: lower,
            mount_point: root.path().join("merged"),
        };
        Fixture {
            _root: root,
            overlay,
        }
    }

    fn plant_whiteout(path: &Path) {
        mknod(path, SFlag::S_IFCHR, Mode::empty(), 0).unwrap();
    }

    #[test]
    fn classifies_upper_entries() {
        let f = fixture();
        let upper = &f.overlay.upper_dir;

        std::fs::write(upper.join("file"), "x").unwrap();
        std::fs::create_dir(upper.join("dir")).unwrap();
        symlink("file", upper.join("link")).unwrap();
        plant_whiteout(&upper.join("gone"));

        assert_eq!(classify(&upper.join("file")), UpperEntry::Regular);
        assert_eq!(classify(&upper.join("dir")), UpperEntry::Directory);
        assert_eq!(classify(&upper.join("link")), UpperEntry::Symlink);
        assert_eq!(classify(&upper.join("gone")), UpperEntry::Whiteout);
        assert_eq!(classify(&upper.join("missing")), UpperEntry::Skip);
    }

    #[test]
    fn derives_the_change_set() {
        let f = fixture();
        let upper = &f.overlay.upper_dir;
        let lower = &f.overlay.lower_dir;

        std::fs::write(lower.join("existing.txt"), "old").unwrap();
        std::fs::write(lower.join("doomed.txt"), "bye").unwrap();

        std::fs::write(upper.join("new.txt"), "hi").unwrap();
        std::fs::write(upper.join("existing.txt"), "new").unwrap();
        plant_whiteout(&upper.join("doomed.txt"));
        // A whiteout without a lower counterpart is a no-op (created and
        // deleted within the session).
        plant_whiteout(&upper.join("ephemeral.txt"));

        let overlays = vec![f.overlay.clone()];
        let mut changes = collect_changes(&overlays, &BTreeSet::new());
        changes.sort_by(|a, b| a.path.cmp(&b.path));

        let summary: Vec<(String, ChangeKind)> = changes
            .iter()
            .map(|c| {
                (
                    c.path.file_name().unwrap().to_string_lossy().into_owned(),
                    c.kind,
                )
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                ("doomed.txt".to_string(), ChangeKind::Deleted),
                ("existing.txt".to_string(), ChangeKind::Modified),
                ("new.txt".to_string(), ChangeKind::Added),
            ]
        );
    }

    #[test]
    fn concealment_markers_are_not_changes() {
        let f = fixture();
        let upper = &f.overlay.upper_dir;
        let lower = &f.overlay.lower_dir;

        std::fs::write(lower.join("secret"), "s").unwrap();
        plant_whiteout(&upper.join("secret"));

        let overlays = vec![f.overlay.clone()];
        let hidden = BTreeSet::from([lower.join("secret")]);

        assert!(collect_changes(&overlays, &hidden).is_empty());

        apply_changes(&overlays, &hidden);
        assert_eq!(std::fs::read_to_string(lower.join("secret")).unwrap(), "s");
    }

    #[test]
    fn applies_additions_modifications_and_deletions() {
        let f = fixture();
        let upper = &f.overlay.upper_dir;
        let lower = &f.overlay.lower_dir;

        std::fs::write(lower.join("existing.txt"), "old").unwrap();
        std::fs::write(lower.join("doomed.txt"), "bye").unwrap();

        std::fs::create_dir_all(upper.join("sub")).unwrap();
        std::fs::write(upper.join("sub/new.txt"), "hi").unwrap();
        std::fs::write(upper.join("existing.txt"), "new").unwrap();
        plant_whiteout(&upper.join("doomed.txt"));

        apply_changes(&[f.overlay.clone()], &BTreeSet::new());

        assert_eq!(
            std::fs::read_to_string(lower.join("sub/new.txt")).unwrap(),
            "hi"
        );
        assert_eq!(
            std::fs::read_to_string(lower.join("existing.txt")).unwrap(),
            "new"
        );
        assert!(!lower.join("doomed.txt").exists());
    }

    #[test]
    fn replaces_entries_of_a_different_type() {
        let f = fixture();
        let upper = &f.overlay.upper_dir;
        let lower = &f.overlay.lower_dir;

        // The session replaced a directory with a regular file of the same
        // name.
        std::fs::create_dir(lower.join("thing")).unwrap();
        std::fs::write(lower.join("thing/inner"), "x").unwrap();
        std::fs::write(upper.join("thing"), "flat").unwrap();

        apply_changes(&[f.overlay.clone()], &BTreeSet::new());

        assert_eq!(std::fs::read_to_string(lower.join("thing")).unwrap(), "flat");
    }

    #[test]
    fn copies_preserve_mode_and_mtime() {
        use std::os::unix::fs::PermissionsExt;

        let f = fixture();
        let upper = &f.overlay.upper_dir;
        let lower = &f.overlay.lower_dir;

        let src = upper.join("script.sh");
        std::fs::write(&src, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&src, PermissionsExt::from_mode(0o755)).unwrap();
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let file = std::fs::File::options().write(true).open(&src).unwrap();
        file.set_modified(mtime).unwrap();
        drop(file);

        apply_changes(&[f.overlay.clone()], &BTreeSet::new());

        let dst = lower.join("script.sh");
        let metadata = std::fs::metadata(&dst).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o755);
        assert_eq!(metadata.modified().unwrap(), mtime);
    }

    #[test]
    fn symlinks_are_recreated_not_followed() {
        let f = fixture();
        let upper = &f.overlay.upper_dir;
        let lower = &f.overlay.lower_dir;

        symlink("target", upper.join("link")).unwrap();

        apply_changes(&[f.overlay.clone()], &BTreeSet::new());

        let dst = lower.join("link");
        assert!(std::fs::symlink_metadata(&dst).unwrap().is_symlink());
        assert_eq!(std::fs::read_link(&dst).unwrap(), PathBuf::from("target"));
    }
}
