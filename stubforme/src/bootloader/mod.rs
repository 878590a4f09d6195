// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Bootloader APIs

use std::path::{Path, PathBuf};

use snafu::{ResultExt as _, Snafu};
use topology::disk::probe::Probe;

use crate::{
    config::{Backend, SystemConfiguration},
    entry::BootEntry,
    host::Host,
    installer::{Installed, Installer},
};

pub mod efistub;
pub mod systemd_boot;

/// Bootloader errors
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to copy kernel {path:?} to the ESP: {source}"))]
    KernelCopy { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to copy initrd {path:?} to the ESP: {source}"))]
    InitrdCopy { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to create {path:?}: {source}"))]
    CreateDir { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to write {path:?}: {source}"))]
    Write { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to remove {path:?}: {source}"))]
    Remove { path: PathBuf, source: std::io::Error },

    #[snafu(display("unable to read firmware boot variables: {reason}"))]
    NvramQuery { reason: String },

    #[snafu(display("unable to create boot variable {label:?}: {reason}"))]
    NvramCreate { label: String, reason: String },

    #[snafu(display("unable to delete boot variable Boot{id}: {reason}"))]
    NvramDelete { id: String, reason: String },

    #[snafu(context(false), display("topology scan: {source}"))]
    Topology { source: topology::disk::Error },
}

#[derive(Debug)]
pub enum Bootloader<'a> {
    /// `loader/entries` consumed by systemd-boot
    Systemd(systemd_boot::Loader<'a>),

    /// Firmware boot variables, no intermediate loader
    Efistub(efistub::Loader<'a>),
}

impl<'a> Bootloader<'a> {
    /// Construct the configured bootloader manager
    pub fn new(backend: Backend, host: &'a Host, esp: &'a Path, probe: &'a Probe) -> Self {
        match backend {
            Backend::SystemdBoot => Bootloader::Systemd(systemd_boot::Loader::new(host, esp)),
            Backend::Efistub => Bootloader::Efistub(efistub::Loader::new(host, esp, probe)),
        }
    }

    /// Point the bootloader at a freshly installed entry
    pub fn sync_entry(&self, entry: &BootEntry, installed: &Installed, uuid: &str) -> Result<(), Error> {
        match self {
            Bootloader::Systemd(s) => s.sync_entry(entry, installed, uuid),
            Bootloader::Efistub(e) => e.sync_entry(entry, installed, uuid),
        }
    }

    /// Whether entries are tracked by firmware boot variable labels
    pub fn uses_labels(&self) -> bool {
        matches!(self, Bootloader::Efistub(_))
    }

    /// Forget an entry. `label` names its firmware boot variable.
    pub fn remove_entry(&self, entry_id: &str, label: Option<&str>) -> Result<(), Error> {
        match self {
            Bootloader::Systemd(s) => s.remove_entry(entry_id),
            Bootloader::Efistub(e) => e.remove_entry(entry_id, label),
        }
    }

    /// Drop boot variables left under a label the entry no longer carries
    pub fn remove_label(&self, label: &str) -> Result<(), Error> {
        match self {
            Bootloader::Systemd(_) => Ok(()),
            Bootloader::Efistub(e) => e.remove_label(label),
        }
    }

    /// Apply system wide settings such as the default entry and menu timeout
    pub fn sync_defaults(&self, config: &SystemConfiguration) -> Result<(), Error> {
        match self {
            Bootloader::Systemd(s) => s.sync_defaults(config),
            Bootloader::Efistub(_) => {
                log::debug!("efistub has no menu, ignoring default entry and timeout");
                Ok(())
            }
        }
    }
}

/// Remove `EFI/<entry_id>` from the ESP
pub(crate) fn remove_esp_files(host: &Host, esp: &Path, entry_id: &str) -> Result<(), Error> {
    let dir = Installer::new(host, esp).entry_dir(entry_id);
    if !dir.is_dir() {
        return Ok(());
    }
    host.remove_dir_all(&dir).context(RemoveSnafu { path: dir })
}
