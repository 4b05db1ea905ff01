// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    borrow::Cow,
    io,
    os::unix::process::{CommandExt, ExitStatusExt},
    path::{Path, PathBuf},
    process::Command,
};

use itertools::Itertools;
use nix::{
    mount::{mount, MsFlags},
    sched::{unshare, CloneFlags},
    unistd::{chdir, chroot},
};
use path_absolutize::Absolutize;

/// Captured result of one sandboxed command.
#[derive(Clone, Debug)]
pub struct RunOutput {
    /// Exit code of the command; a signal death maps to `128 + signum`
    /// following the POSIX shell convention.
    pub returncode: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Marker line the child shell appends so the parent can learn the working
/// directory the command ended in.
const PWD_SENTINEL: &str = "FINAL_PWD:";

/// Runs `argv` inside the merged view and returns its output plus the
/// working directory to carry into the next command, if the command ended
/// in one the session may adopt.
///
/// The child enters a fresh mount namespace before chrooting, so an
/// `umount` it performs can never reach the host mount table, and the
/// chroot confines it to the overlay even then.
pub(crate) fn run_in_sandbox(
    merged_dir: &Path,
    base_dir: &Path,
    current_dir: &Path,
    argv: &[String],
) -> io::Result<(RunOutput, Option<PathBuf>)> {
    let script = build_script(current_dir, argv);

    let mut cmd = Command::new("/bin/bash");
    cmd.arg("-c")
        .arg(&script)
        .env("PWD", current_dir)
        .env("SANDSHELL_BASE_DIR", base_dir);

    let merged_dir = merged_dir.to_path_buf();
    // After fork, before exec: confine the child. Runs in the child, so any
    // failure surfaces as a spawn error of this `Command` only.
    unsafe {
        cmd.pre_exec(move || {
            enter_confinement(&merged_dir).map_err(|errno| io::Error::from_raw_os_error(errno as i32))
        });
    }

    let output = cmd.output()?;

    let returncode = output
        .status
        .code()
        .unwrap_or_else(|| 128 + output.status.signal().unwrap_or(0));
    let (stdout, reported_pwd) = split_sentinel(&output.stdout);
    let next_dir = reported_pwd.and_then(|pwd| accept_pwd(base_dir, &pwd));

    Ok((
        RunOutput {
            returncode,
            stdout,
            stderr: output.stderr,
        },
        next_dir,
    ))
}

fn enter_confinement(merged_dir: &Path) -> nix::Result<()> {
    unshare(CloneFlags::CLONE_NEWNS)?;
    // Remount everything private so unmounts inside the namespace never
    // propagate back to the host.
    mount(
        Some(""),
        "/",
        Some(""),
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        Some(""),
    )?;
    chroot(merged_dir)?;
    chdir("/")
}

/// Assembles the shell script for one command. Every interpolated string is
/// single-quote escaped; the command itself never passes through a format
/// string unescaped.
///
/// The sentinel is only printed when the command succeeds, which also means
/// a failed `cd` leaves the session directory untouched.
fn build_script(current_dir: &Path, argv: &[String]) -> String {
    let cd = shell_escape::escape(current_dir.to_string_lossy());
    let command = argv
        .iter()
        .map(|arg| shell_escape::escape(Cow::Borrowed(arg.as_str())))
        .join(" ");
    format!("cd {cd} && {command} && echo \"{PWD_SENTINEL}$(pwd)\"")
}

/// Strips the last sentinel line from captured stdout and returns the
/// remaining bytes plus the reported working directory.
fn split_sentinel(stdout: &[u8]) -> (Vec<u8>, Option<String>) {
    let lines: Vec<&[u8]> = stdout.split(|&b| b == b'\n').collect();
    let Some(idx) = lines
        .iter()
        .rposition(|line| line.starts_with(PWD_SENTINEL.as_bytes()))
    else {
        return (stdout.to_vec(), None);
    };

    let pwd = String::from_utf8_lossy(&lines[idx][PWD_SENTINEL.len()..]).into_owned();
    let kept: Vec<&[u8]> = lines
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != idx)
        .map(|(_, line)| *line)
        .collect();
    (kept.join(&b'\n'), Some(pwd))
}

/// Normalizes a reported working directory lexically and accepts it only
/// if it stays within the session base directory. Anything else is
/// silently ignored so the session directory can never escape the base.
fn accept_pwd(base_dir: &Path, reported: &str) -> Option<PathBuf> {
    if !reported.starts_with('/') {
        return None;
    }
    let normalized = Path::new(reported).absolutize().ok()?;
    if normalized.starts_with(base_dir) {
        Some(normalized.into_owned())
    } else {
        None
    }
}
