// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Construction of a [`Probe`] against real or fixture virtual filesystems

use std::path::PathBuf;

use super::{mounts::Table, probe::Probe};

/// Builder for [`Probe`]
///
/// The defaults point at the live system. Image builds and tests override
/// individual roots.
#[derive(Debug)]
pub struct Builder {
    sysfs: PathBuf,
    devfs: PathBuf,
    procfs: PathBuf,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            sysfs: "/sys".into(),
            devfs: "/dev".into(),
            procfs: "/proc".into(),
        }
    }
}

impl Builder {
    /// Override the `/sys` location
    pub fn with_sysfs(self, sysfs: impl Into<PathBuf>) -> Self {
        Self {
            sysfs: sysfs.into(),
            ..self
        }
    }

    /// Override the `/dev` location
    pub fn with_devfs(self, devfs: impl Into<PathBuf>) -> Self {
        Self {
            devfs: devfs.into(),
            ..self
        }
    }

    /// Override the `/proc` location
    pub fn with_procfs(self, procfs: impl Into<PathBuf>) -> Self {
        Self {
            procfs: procfs.into(),
            ..self
        }
    }

    /// Build the probe and take the initial mount table snapshot
    pub fn build(self) -> Result<Probe, super::Error> {
        let mut probe = Probe {
            sysfs: self.sysfs,
            devfs: self.devfs,
            procfs: self.procfs,
            mounts: Table::default(),
        };
        probe.init_scan()?;
        Ok(probe)
    }
}
