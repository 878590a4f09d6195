// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Direct EFISTUB booting: the firmware starts the kernel itself

use std::path::Path;

use topology::disk::probe::Probe;

use crate::{
    bootloader::remove_esp_files,
    entry::{BootEntry, Kind},
    host::Host,
    installer::Installed,
};

pub mod nvram;

use nvram::{NewVariable, Nvram};

#[derive(Debug)]
pub struct Loader<'a> {
    host: &'a Host,
    esp: &'a Path,
    probe: &'a Probe,
}

/// `/EFI/a/b.efi` as the firmware spells it, `\EFI\a\b.efi`
pub fn firmware_path(path: &str) -> String {
    let path = path.replace('/', "\\");
    if path.starts_with('\\') {
        path
    } else {
        format!("\\{path}")
    }
}

impl<'a> Loader<'a> {
    pub(super) fn new(host: &'a Host, esp: &'a Path, probe: &'a Probe) -> Self {
        Self { host, esp, probe }
    }

    /// Describe the boot variable for an installed entry
    pub fn variable(&self, entry: &BootEntry, installed: &Installed, uuid: &str) -> Result<NewVariable, super::Error> {
        let esp_node = self.probe.get_device_from_mountpoint(self.esp)?;
        let disk = self.probe.get_device_parent(&esp_node)?;
        let partition = self.probe.get_partition_number(&esp_node)?;

        let cmdline = match (entry.kind(), &installed.initrd) {
            (Kind::Linux, Some(initrd)) => {
                let mut cmdline = format!("root=UUID={uuid} ro initrd={}", firmware_path(initrd));
                for option in entry.options() {
                    cmdline.push(' ');
                    cmdline.push_str(option);
                }
                Some(cmdline)
            }
            _ => None,
        };

        Ok(NewVariable {
            disk,
            partition,
            label: entry.label(),
            loader: firmware_path(&installed.loader),
            cmdline,
        })
    }

    pub(super) fn sync_entry(&self, entry: &BootEntry, installed: &Installed, uuid: &str) -> Result<(), super::Error> {
        let variable = self.variable(entry, installed, uuid)?;
        Nvram::new(self.host).reconcile(&variable)?;
        Ok(())
    }

    pub(super) fn remove_entry(&self, entry_id: &str, label: Option<&str>) -> Result<(), super::Error> {
        match label {
            Some(label) => self.remove_label(label)?,
            None => log::warn!("no boot variable label known for {entry_id}, leaving firmware untouched"),
        }
        remove_esp_files(self.host, self.esp, entry_id)
    }

    pub(super) fn remove_label(&self, label: &str) -> Result<(), super::Error> {
        let removed = Nvram::new(self.host).delete_matching(label)?;
        log::info!("removed {removed} boot variables labelled {label:?}");
        Ok(())
    }
}
