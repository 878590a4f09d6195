// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Disk probe/query APIs

use std::path::PathBuf;

use snafu::Snafu;

mod builder;
pub use builder::Builder;
pub mod mounts;
pub mod probe;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("from io: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("no such mount: {path:?}"))]
    UnknownMount { path: PathBuf },

    #[snafu(display("no such device: {path:?}"))]
    InvalidDevice { path: PathBuf },

    #[snafu(display("invalid partition number for {path:?}: {value:?}"))]
    InvalidPartition { path: PathBuf, value: String },
}
