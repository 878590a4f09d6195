// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use snafu::Snafu;

pub mod bootloader;
pub mod config;
pub mod drive;
pub mod entry;
pub mod file_utils;
pub mod host;
pub mod installer;
pub mod kernel;
pub mod options;
pub mod os_release;
pub mod store;
pub mod version;

mod manager;
pub use manager::{CreateRequest, EditRequest, EntrySummary, Manager, SystemChanges};

/// Re-export the topology APIs
pub use topology::disk;

pub use config::{Backend, SystemConfiguration};
pub use drive::Drive;
pub use entry::{BootEntry, EntryBuilder, Executable, Kind};
pub use host::Host;

/// Core error type for stubforme
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(context(false), display("{source}"))]
    Drive { source: drive::Error },

    #[snafu(context(false), display("invalid entry: {source}"))]
    Entry { source: entry::Error },

    #[snafu(context(false), display("configuration: {source}"))]
    Config { source: config::Error },

    #[snafu(context(false), display("bootloader: {source}"))]
    Bootloader { source: bootloader::Error },

    #[snafu(context(false), display("topology scan: {source}"))]
    Topology { source: topology::disk::Error },

    #[snafu(display("no entry with index {index:?}"))]
    NoSuchEntry { index: String },

    #[snafu(display("index {index:?} is already in use"))]
    DuplicateIndex { index: String },

    #[snafu(display("an entry named {entry_id:?} already exists"))]
    DuplicateEntry { entry_id: String },
}

/// Process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitStatus {
    Success = 0,
    Failure = 1,
    KernelCopy = 2,
    InitrdCopy = 3,
    Config = 4,
    NoBlockDevice = 5,
    UuidNotFound = 6,
    NvramCreate = 7,
    NvramDelete = 8,
    InvalidEntry = 9,
    Mount = 10,
    NotRoot = 176,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

fn drive_status(error: &drive::Error) -> ExitStatus {
    match error {
        drive::Error::NoBlockDevice { .. } => ExitStatus::NoBlockDevice,
        drive::Error::UuidNotFound { .. } => ExitStatus::UuidNotFound,
        drive::Error::NoMountPoint { .. }
        | drive::Error::MountPointBusy { .. }
        | drive::Error::Spawn { .. }
        | drive::Error::Mount { .. }
        | drive::Error::Unmount { .. } => ExitStatus::Mount,
    }
}

fn topology_status(error: &topology::disk::Error) -> ExitStatus {
    match error {
        topology::disk::Error::UnknownMount { .. } | topology::disk::Error::InvalidDevice { .. } => {
            ExitStatus::NoBlockDevice
        }
        _ => ExitStatus::Failure,
    }
}

impl Error {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Error::Drive { source } => drive_status(source),
            Error::Entry {
                source: entry::Error::Drive { source },
            } => drive_status(source),
            Error::Entry { .. } => ExitStatus::InvalidEntry,
            Error::Config { .. } => ExitStatus::Config,
            Error::Bootloader { source } => match source {
                bootloader::Error::KernelCopy { .. } => ExitStatus::KernelCopy,
                bootloader::Error::InitrdCopy { .. } => ExitStatus::InitrdCopy,
                bootloader::Error::NvramQuery { .. } | bootloader::Error::NvramCreate { .. } => {
                    ExitStatus::NvramCreate
                }
                bootloader::Error::NvramDelete { .. } => ExitStatus::NvramDelete,
                bootloader::Error::Topology { source } => topology_status(source),
                _ => ExitStatus::Failure,
            },
            Error::Topology { source } => topology_status(source),
            Error::NoSuchEntry { .. } | Error::DuplicateIndex { .. } | Error::DuplicateEntry { .. } => {
                ExitStatus::InvalidEntry
            }
        }
    }

    /// Kernel or initrd failed to reach the ESP, leaving the entry unbootable
    pub fn is_install_failure(&self) -> bool {
        matches!(
            self.exit_status(),
            ExitStatus::KernelCopy | ExitStatus::InitrdCopy
        )
    }
}
