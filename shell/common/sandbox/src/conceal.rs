// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use nix::sys::stat::{mknod, Mode, SFlag};
use tracing::debug;

use crate::layers::Overlay;

/// Extended attribute marking an upper directory as opaque: overlayfs hides
/// every lower-layer entry below it.
pub(crate) const OPAQUE_XATTR: &str = "trusted.overlay.opaque";

/// Which set of sensitive host paths to hide from sandboxed commands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConcealProfile {
    /// Password databases, sudoers and user SSH directories.
    Core,
    /// [`ConcealProfile::Core`] plus shell histories, key stores and
    /// credential files of common tools.
    #[default]
    Broad,
}

const CORE_PATTERNS: &[&str] = &[
    "/etc/shadow",
    "/etc/gshadow",
    "/etc/sudoers",
    "/etc/sudoers.d",
    "/etc/security/opasswd",
    "/home/*/.ssh",
];

const BROAD_EXTRA_PATTERNS: &[&str] = &[
    "/etc/ssh/ssh_host_*",
    "/root/.ssh",
    "/root/.bash_history",
    "/root/.zsh_history",
    "/root/.python_history",
    "/home/*/.bash_history",
    "/home/*/.zsh_history",
    "/home/*/.python_history",
    "/root/.gnupg",
    "/home/*/.gnupg",
    "/root/.aws",
    "/root/.azure",
    "/root/.config/gcloud",
    "/home/*/.aws",
    "/home/*/.azure",
    "/home/*/.config/gcloud",
    "/etc/environment",
    "/root/.kube",
    "/home/*/.kube",
    "/root/.docker/config.json",
    "/home/*/.docker/config.json",
    "/root/.local/share/keyrings",
    "/home/*/.local/share/keyrings",
    "/root/.git-credentials",
    "/home/*/.git-credentials",
    "/root/.netrc",
    "/home/*/.netrc",
];

impl ConcealProfile {
    pub fn patterns(&self) -> Vec<&'static str> {
        let mut patterns = CORE_PATTERNS.to_vec();
        if *self == ConcealProfile::Broad {
            patterns.extend_from_slice(BROAD_EXTRA_PATTERNS);
        }
        patterns
    }
}

/// Hides the given paths (absolute paths or glob patterns) from the merged
/// view by materializing whiteouts and opaque markers in the upper layers.
///
/// Returns the set of host paths that ended up concealed. Every failure is
/// per-path: a pattern that cannot be expanded or a marker that cannot be
/// created is skipped and the rest proceed.
pub(crate) fn conceal(overlays: &[Overlay], patterns: &[String]) -> BTreeSet<PathBuf> {
    let mut hidden = BTreeSet::new();

    for pattern in patterns {
        for path in expand_pattern(pattern) {
            let Some(overlay) = innermost_overlay(overlays, &path) else {
                continue;
            };
            conceal_path(overlay, &path, &mut hidden);
        }
    }

    hidden
}

/// Glob-expands a pattern against the host filesystem. A pattern with no
/// matches is retained as a literal path: its parent may be unreadable to
/// the globber while the path itself is still statable.
fn expand_pattern(pattern: &str) -> Vec<PathBuf> {
    let Ok(entries) = glob::glob(pattern) else {
        debug!("Ignoring malformed conceal pattern {pattern:?}");
        return Vec::new();
    };
    let matches: Vec<PathBuf> = entries.flatten().collect();
    if matches.is_empty() {
        return vec![PathBuf::from(pattern)];
    }
    matches
}

/// Picks the overlay whose lower directory contains `path` most tightly,
/// so every path is concealed in exactly one upper layer. The root overlay
/// (lower `/`) contains everything; a `/home` submount overlay wins for
/// paths under `/home`.
fn innermost_overlay<'a>(overlays: &'a [Overlay], path: &Path) -> Option<&'a Overlay> {
    overlays
        .iter()
        .filter(|overlay| path.starts_with(&overlay.lower_dir))
        .max_by_key(|overlay| overlay.lower_dir.as_os_str().len())
}

fn conceal_path(overlay: &Overlay, path: &Path, hidden: &mut BTreeSet<PathBuf>) {
    // Follow symlinks: a link to a directory is concealed as a directory,
    // and a dangling link counts as absent.
    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    let Ok(rel) = path.strip_prefix(&overlay.lower_dir) else {
        return;
    };
    let white = overlay.upper_dir.join(rel);

    if let Some(parent) = white.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            debug!("Cannot conceal {}: {}", path.display(), e);
            return;
        }
    }

    if metadata.is_dir() {
        conceal_dir(overlay, path, &white, hidden);
    } else {
        match whiteout(&white) {
            Ok(()) => {
                hidden.insert(path.to_path_buf());
            }
            Err(e) => debug!("Cannot whiteout {}: {}", path.display(), e),
        }
    }
}

/// Creates the overlayfs whiteout marker: a character device with device
/// number 0:0 and no permission bits.
fn whiteout(white: &Path) -> nix::Result<()> {
    if std::fs::symlink_metadata(white).is_ok() {
        let _ = std::fs::remove_file(white);
    }
    mknod(white, SFlag::S_IFCHR, Mode::empty(), 0)
}

/// Hides a directory by marking its upper shadow opaque. When the xattr
/// cannot be set (unsupported filesystem, missing capability), falls back
/// to whiting out every file beneath it. The fallback shadows file
/// contents but may still leak the names of empty lower subdirectories.
fn conceal_dir(overlay: &Overlay, path: &Path, white: &Path, hidden: &mut BTreeSet<PathBuf>) {
    if let Err(e) = std::fs::create_dir_all(white) {
        debug!("Cannot conceal {}: {}", path.display(), e);
        return;
    }

    match xattr::set(white, OPAQUE_XATTR, b"y") {
        Ok(()) => {
            hidden.insert(path.to_path_buf());
        }
        Err(e) => {
            debug!(
                "Cannot mark {} opaque ({}); falling back to per-file whiteouts",
                path.display(),
                e
            );
            whiteout_tree(overlay, path, hidden);
        }
    }
}

/// Recursively creates whiteouts for every non-directory entry of a lower
/// directory. Inner directories are recursed into, not marked opaque.
fn whiteout_tree(overlay: &Overlay, dir: &Path, hidden: &mut BTreeSet<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(metadata) = std::fs::metadata(&path) else {
            continue;
        };
        if metadata.is_dir() {
            whiteout_tree(overlay, &path, hidden);
            continue;
        }

        let Ok(rel) = path.strip_prefix(&overlay.lower_dir) else {
            continue;
        };
        let white = overlay.upper_dir.join(rel);
        if let Some(parent) = white.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                continue;
            }
        }
        match whiteout(&white) {
            Ok(()) => {
                hidden.insert(path);
            }
            Err(e) => debug!("Cannot whiteout {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::{symlink, FileTypeExt, MetadataExt};

    use super::*;

    fn fake_overlay(root: &Path, name: &str, lower: &Path) -> Overlay {
        let upper = root.join(name);
        std::fs::create_dir_all(&upper).unwrap();
        Overlay {
            upper_dir: upper,
            lower_dir: lower.to_path_buf(),
            mount_point: root.join("merged").join(name),
        }
    }

    fn is_whiteout(path: &Path) -> bool {
        match std::fs::symlink_metadata(path) {
            Ok(m) => m.file_type().is_char_device() && m.rdev() == 0,
            Err(_) => false,
        }
    }

    #[test]
    fn broad_profile_extends_core() {
        let core = ConcealProfile::Core.patterns();
        let broad = ConcealProfile::Broad.patterns();
        assert!(core.contains(&"/etc/shadow"));
        assert!(broad.len() > core.len());
        for pattern in core {
            assert!(broad.contains(&pattern));
        }
    }

    #[test]
    fn innermost_overlay_wins() {
        let root = tempfile::tempdir().unwrap();
        let overlays = vec![
            fake_overlay(root.path(), "upper", Path::new("/")),
            fake_overlay(root.path(), "sub_upper_home", Path::new("/home")),
        ];

        let chosen = innermost_overlay(&overlays, Path::new("/home/alice/.ssh")).unwrap();
        assert_eq!(chosen.lower_dir, Path::new("/home"));

        let chosen = innermost_overlay(&overlays, Path::new("/etc/shadow")).unwrap();
        assert_eq!(chosen.lower_dir, Path::new("/"));

        // Sibling prefixes do not match: /homework is not under /home.
        let chosen = innermost_overlay(&overlays, Path::new("/homework")).unwrap();
        assert_eq!(chosen.lower_dir, Path::new("/"));
    }

    #[test]
    fn conceals_a_regular_file_with_a_whiteout() {
        let root = tempfile::tempdir().unwrap();
        let lower = root.path().join("lower");
        std::fs::create_dir_all(lower.join("etc")).unwrap();
        std::fs::write(lower.join("etc/secret"), "x").unwrap();

        let overlays = vec![fake_overlay(root.path(), "upper", &lower)];
        let hidden = conceal(
            &overlays,
            &[lower.join("etc/secret").to_string_lossy().into_owned()],
        );

        assert!(hidden.contains(&lower.join("etc/secret")));
        assert!(is_whiteout(&overlays[0].upper_dir.join("etc/secret")));
    }

    #[test]
    fn skips_paths_that_do_not_exist() {
        let root = tempfile::tempdir().unwrap();
        let lower = root.path().join("lower");
        std::fs::create_dir_all(&lower).unwrap();

        let overlays = vec![fake_overlay(root.path(), "upper", &lower)];
        let hidden = conceal(
            &overlays,
            &[lower.join("missing").to_string_lossy().into_owned()],
        );

        assert!(hidden.is_empty());
    }

    #[test]
    fn conceals_a_directory() {
        let root = tempfile::tempdir().unwrap();
        let lower = root.path().join("lower");
        std::fs::create_dir_all(lower.join("secrets/inner")).unwrap();
        std::fs::write(lower.join("secrets/a"), "x").unwrap();
        std::fs::write(lower.join("secrets/inner/b"), "y").unwrap();

        let overlays = vec![fake_overlay(root.path(), "upper", &lower)];
        let hidden = conceal(
            &overlays,
            &[lower.join("secrets").to_string_lossy().into_owned()],
        );

        let shadow = overlays[0].upper_dir.join("secrets");
        assert!(shadow.is_dir());

        // With privileges the directory is marked opaque; otherwise the
        // fallback whites out each file beneath it.
        let opaque = xattr::get(&shadow, OPAQUE_XATTR)
            .ok()
            .flatten()
            .is_some_and(|v| v == b"y");
        if opaque {
            assert!(hidden.contains(&lower.join("secrets")));
        } else {
            assert!(hidden.contains(&lower.join("secrets/a")));
            assert!(hidden.contains(&lower.join("secrets/inner/b")));
            assert!(is_whiteout(&shadow.join("a")));
            assert!(is_whiteout(&shadow.join("inner/b")));
        }
    }

    #[test]
    fn dangling_symlinks_count_as_absent() {
        let root = tempfile::tempdir().unwrap();
        let lower = root.path().join("lower");
        std::fs::create_dir_all(&lower).unwrap();
        symlink("missing-target", lower.join("ghost")).unwrap();

        let overlays = vec![fake_overlay(root.path(), "upper", &lower)];
        let hidden = conceal(
            &overlays,
            &[lower.join("ghost").to_string_lossy().into_owned()],
        );

        assert!(hidden.is_empty());
        assert!(std::fs::symlink_metadata(overlays[0].upper_dir.join("ghost")).is_err());
    }

    #[test]
    fn symlinked_directories_are_concealed_as_directories() {
        let root = tempfile::tempdir().unwrap();
        let lower = root.path().join("lower");
        std::fs::create_dir_all(lower.join("realdir")).unwrap();
        std::fs::write(lower.join("realdir/key"), "x").unwrap();
        symlink("realdir", lower.join("alias")).unwrap();

        let overlays = vec![fake_overlay(root.path(), "upper", &lower)];
        let hidden = conceal(
            &overlays,
            &[lower.join("alias").to_string_lossy().into_owned()],
        );

        // The link is shadowed by a real directory in the upper layer, not
        // whited out as a single file.
        let shadow = overlays[0].upper_dir.join("alias");
        assert!(std::fs::symlink_metadata(&shadow).unwrap().is_dir());

        let opaque = xattr::get(&shadow, OPAQUE_XATTR)
            .ok()
            .flatten()
            .is_some_and(|v| v == b"y");
        if opaque {
            assert!(hidden.contains(&lower.join("alias")));
        } else {
            assert!(hidden.contains(&lower.join("alias/key")));
            assert!(is_whiteout(&shadow.join("key")));
        }
    }

    #[test]
    fn glob_patterns_expand_against_the_host() {
        let root = tempfile::tempdir().unwrap();
        let lower = root.path().join("lower");
        std::fs::create_dir_all(lower.join("home/alice")).unwrap();
        std::fs::create_dir_all(lower.join("home/bob")).unwrap();
        std::fs::write(lower.join("home/alice/token"), "x").unwrap();
        std::fs::write(lower.join("home/bob/token"), "y").unwrap();

        let overlays = vec![fake_overlay(root.path(), "upper", &lower)];
        let pattern = lower.join("home/*/token").to_string_lossy().into_owned();
        let hidden = conceal(&overlays, &[pattern]);

        assert_eq!(hidden.len(), 2);
        assert!(is_whiteout(&overlays[0].upper_dir.join("home/alice/token")));
        assert!(is_whiteout(&overlays[0].upper_dir.join("home/bob/token")));
    }
}
