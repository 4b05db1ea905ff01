// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("base directory does not exist: {path}")]
    BaseMissing { path: PathBuf },

    #[error(
        "mounting overlayfs requires root privileges; try re-running under sudo ({source})"
    )]
    PermissionDenied { source: io::Error },

    #[error("kernel refused the overlay mount: {source}")]
    MountFailed { source: io::Error },

    #[error("sandbox is not mounted")]
    NotMounted,

    #[error("failed to prepare scratch storage: {message}")]
    Scratch { message: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
