// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Block device and mount point pairs

use std::{
    cell::OnceCell,
    path::{Path, PathBuf},
};

use fs_err as fs;
use snafu::{ResultExt as _, Snafu};
use topology::disk::probe::Probe;

use crate::host::Host;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("no block device found for {path:?}"))]
    NoBlockDevice {
        path: PathBuf,
        source: topology::disk::Error,
    },

    #[snafu(display("{node:?} is not mounted and no mount point was given"))]
    NoMountPoint { node: PathBuf },

    #[snafu(display("{mount_point:?} already has {mounted:?} mounted, not {node:?}"))]
    MountPointBusy {
        node: PathBuf,
        mount_point: PathBuf,
        mounted: PathBuf,
    },

    #[snafu(display("no filesystem UUID found for {mount_point:?}"))]
    UuidNotFound { mount_point: PathBuf },

    #[snafu(display("failed to run {program}: {source}"))]
    Spawn { program: String, source: std::io::Error },

    #[snafu(display("mounting {node:?} on {mount_point:?} failed with code {code}: {stderr}"))]
    Mount {
        node: PathBuf,
        mount_point: PathBuf,
        code: i32,
        stderr: String,
    },

    #[snafu(display("unmounting {mount_point:?} failed with code {code}: {stderr}"))]
    Unmount {
        mount_point: PathBuf,
        code: i32,
        stderr: String,
    },
}

/// Node paths name the same device, following `/dev/disk/by-*` links
fn same_device(a: &Path, b: &Path) -> bool {
    a == b || matches!((fs::canonicalize(a), fs::canonicalize(b)), (Ok(x), Ok(y)) if x == y)
}

/// A block device and where it is (or will be) mounted
#[derive(Debug, Clone)]
pub struct Drive {
    node: PathBuf,
    mount_point: PathBuf,
    uuid: OnceCell<String>,
    mounted: bool,

    /// Set once this process mounts the drive, and only then may it unmount it
    mounted_here: bool,
}

impl Drive {
    /// Construct a drive without consulting the mount table
    pub fn new(node: impl Into<PathBuf>, mount_point: impl Into<PathBuf>, mounted: bool) -> Self {
        Self {
            node: node.into(),
            mount_point: mount_point.into(),
            uuid: OnceCell::new(),
            mounted,
            mounted_here: false,
        }
    }

    /// The drive currently mounted at `mount_point`
    pub fn from_mount_point(probe: &Probe, mount_point: impl AsRef<Path>) -> Result<Self, Error> {
        let mount_point = mount_point.as_ref();
        let node = probe
            .get_device_from_mountpoint(mount_point)
            .context(NoBlockDeviceSnafu { path: mount_point })?;
        log::debug!("{} is backed by {}", mount_point.display(), node.display());
        Ok(Self::new(node, mount_point, true))
    }

    /// Resolve a drive from whichever of node and mount point are known
    ///
    /// With neither, the drive backing `/` is used.
    pub fn resolve(probe: &Probe, node: Option<&Path>, mount_point: Option<&Path>) -> Result<Self, Error> {
        match (node, mount_point) {
            (None, mount_point) => Self::from_mount_point(probe, mount_point.unwrap_or(Path::new("/"))),
            (Some(node), Some(mount_point)) => match probe.mounts.find_by_mountpoint(&mount_point.to_string_lossy()) {
                Some(m) if same_device(Path::new(&m.device), node) => Ok(Self::new(node, mount_point, true)),
                Some(m) => MountPointBusySnafu {
                    node,
                    mount_point,
                    mounted: &m.device,
                }
                .fail(),
                None => Ok(Self::new(node, mount_point, false)),
            },
            (Some(node), None) => {
                let mount_point = probe
                    .get_mountpoint_from_device(node)
                    .ok_or_else(|| Error::NoMountPoint { node: node.to_path_buf() })?;
                Ok(Self::new(node, mount_point, true))
            }
        }
    }

    /// Preset the filesystem UUID, skipping the `findmnt` lookup
    pub fn with_uuid(self, uuid: impl Into<String>) -> Self {
        let uuid_cell = OnceCell::new();
        let _ = uuid_cell.set(uuid.into());
        Self { uuid: uuid_cell, ..self }
    }

    pub fn node(&self) -> &Path {
        &self.node
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Filesystem UUID of the mounted drive, looked up once
    pub fn uuid(&self, host: &Host) -> Result<&str, Error> {
        if let Some(uuid) = self.uuid.get() {
            return Ok(uuid);
        }

        let args = ["--noheadings", "--output", "UUID", "--mountpoint"]
            .into_iter()
            .map(String::from)
            .chain([self.mount_point.to_string_lossy().into_owned()])
            .collect::<Vec<_>>();
        let output = host.query("findmnt", &args).context(SpawnSnafu { program: "findmnt" })?;

        let uuid = output.stdout.lines().map(str::trim).find(|l| !l.is_empty());
        match uuid {
            Some(uuid) if output.success() => {
                log::debug!("{} has UUID {uuid}", self.mount_point.display());
                Ok(self.uuid.get_or_init(|| uuid.to_string()))
            }
            _ => UuidNotFoundSnafu {
                mount_point: self.mount_point.clone(),
            }
            .fail(),
        }
    }

    /// Mount the drive unless it already is
    pub fn mount(&mut self, host: &Host) -> Result<(), Error> {
        if self.mounted {
            return Ok(());
        }

        log::info!("mounting {} on {}", self.node.display(), self.mount_point.display());
        host.create_dir_all(&self.mount_point)
            .context(SpawnSnafu { program: "mkdir" })?;
        let args = [self.node.to_string_lossy().into_owned(), self.mount_point.to_string_lossy().into_owned()];
        let output = host.privileged("mount", &args).context(SpawnSnafu { program: "mount" })?;
        if !output.success() {
            return MountSnafu {
                node: self.node.clone(),
                mount_point: self.mount_point.clone(),
                code: output.status,
                stderr: output.stderr.trim(),
            }
            .fail();
        }

        self.mounted = true;
        self.mounted_here = true;
        Ok(())
    }

    /// Unmount the drive if this process mounted it
    ///
    /// `/` and the ESP stay mounted no matter who mounted them.
    pub fn release(&mut self, host: &Host, esp: &Path) -> Result<(), Error> {
        if !self.mounted_here || self.mount_point == Path::new("/") || self.mount_point == esp {
            return Ok(());
        }

        log::info!("unmounting {}", self.mount_point.display());
        let args = [self.mount_point.to_string_lossy().into_owned()];
        let output = host.privileged("umount", &args).context(SpawnSnafu { program: "umount" })?;
        if !output.success() {
            return UnmountSnafu {
                mount_point: self.mount_point.clone(),
                code: output.status,
                stderr: output.stderr.trim(),
            }
            .fail();
        }

        self.mounted = false;
        self.mounted_here = false;
        Ok(())
    }
}
