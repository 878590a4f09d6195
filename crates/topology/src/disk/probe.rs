// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Disk probe/query APIs

use std::path::{Path, PathBuf};

use fs_err as fs;
use snafu::{OptionExt, ResultExt as _};

use super::{mounts::Table, InvalidDeviceSnafu, InvalidPartitionSnafu, IoSnafu};

/// A Disk probe to query disks
#[derive(Debug)]
pub struct Probe {
    /// location of /sys
    pub(super) sysfs: PathBuf,

    /// location of /dev
    pub(super) devfs: PathBuf,

    /// location of /proc
    pub(super) procfs: PathBuf,

    /// Mountpoints
    pub mounts: Table,
}

impl Probe {
    /// Initial startup loads
    pub(super) fn init_scan(&mut self) -> Result<(), super::Error> {
        let mounts = Table::new_from_path(self.procfs.join("self").join("mounts")).context(IoSnafu)?;
        self.mounts = mounts;

        Ok(())
    }

    /// Refresh the mount table snapshot, i.e. after a mount or unmount
    pub fn rescan(&mut self) -> Result<(), super::Error> {
        self.init_scan()
    }

    /// Resolve a device by mountpoint
    ///
    /// The mountpoint must match a mount table entry exactly, we never guess
    /// at a "closest" mount.
    pub fn get_device_from_mountpoint(&self, mountpoint: impl AsRef<Path>) -> Result<PathBuf, super::Error> {
        let mountpoint = mountpoint.as_ref();
        let matching_device = self
            .mounts
            .find_by_mountpoint(&mountpoint.to_string_lossy())
            .ok_or_else(|| super::Error::UnknownMount {
                path: mountpoint.to_path_buf(),
            })?;
        log::trace!("{} is mounted from {}", mountpoint.display(), matching_device.device);
        Ok(matching_device.device.as_str().into())
    }

    /// Where the given device node is currently mounted, if anywhere
    pub fn get_mountpoint_from_device(&self, device: impl AsRef<Path>) -> Option<PathBuf> {
        self.mounts
            .find_by_device(&device.as_ref().to_string_lossy())
            .map(|m| m.mountpoint.as_str().into())
    }

    /// Whether the device node appears in the mount table
    pub fn is_mounted(&self, device: impl AsRef<Path>) -> bool {
        self.get_mountpoint_from_device(device).is_some()
    }

    /// Retrieve the parent device, such as the disk of a partition
    ///
    /// Virtual (device-mapper) volumes have no meaningful parent and are
    /// returned as-is. Whole disks are also returned as-is.
    pub fn get_device_parent(&self, device: impl AsRef<Path>) -> Result<PathBuf, super::Error> {
        let device = self.canonical_device(device.as_ref());
        let name = device.file_name().context(InvalidDeviceSnafu { path: device.clone() })?;
        let link = fs::read_link(self.sysfs.join("class").join("block").join(name)).context(IoSnafu)?;
        let disk_sys = link.parent().context(InvalidDeviceSnafu { path: device.clone() })?;

        if disk_sys.components().any(|c| c.as_os_str() == "virtual") {
            let leaf = link.file_name().context(InvalidDeviceSnafu { path: device.clone() })?;
            log::debug!("{} is a virtual device", device.display());
            return Ok(self.devfs.join(leaf));
        }

        let disk = disk_sys.file_name().context(InvalidDeviceSnafu { path: device.clone() })?;
        if disk == "block" {
            return Ok(device);
        }
        log::debug!("{} is a partition on {}", device.display(), disk.to_string_lossy());

        Ok(self.devfs.join(disk))
    }

    /// Partition number of the device within its parent disk
    pub fn get_partition_number(&self, device: impl AsRef<Path>) -> Result<u32, super::Error> {
        let device = self.canonical_device(device.as_ref());
        let name = device.file_name().context(InvalidDeviceSnafu { path: device.clone() })?;
        let raw = fs::read_to_string(self.sysfs.join("class").join("block").join(name).join("partition"))
            .context(IoSnafu)?;
        raw.trim().parse::<u32>().ok().context(InvalidPartitionSnafu {
            path: device.clone(),
            value: raw.trim(),
        })
    }

    /// For GPT disks return the PartUUID (GUID)
    pub fn get_device_guid(&self, parent: impl AsRef<Path>, path: impl AsRef<Path>) -> Option<String> {
        let partition = self.get_partition_number(path).ok()?;
        let fi = fs::File::open(parent.as_ref()).ok()?;
        let gpt_header = gpt::GptConfig::new()
            .writable(false)
            .open_from_device(Box::new(fi))
            .ok()?;
        gpt_header
            .partitions()
            .get(&partition)
            .map(|partition| partition.part_guid.hyphenated().to_string())
    }

    /// Follow `/dev/disk/by-*` style symlinks to the kernel name where possible
    fn canonical_device(&self, device: &Path) -> PathBuf {
        fs::canonicalize(device).unwrap_or_else(|_| device.to_path_buf())
    }
}
