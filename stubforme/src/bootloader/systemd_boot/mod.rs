// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! systemd-boot management and interfaces

use std::{fmt::Write as _, path::Path, path::PathBuf};

use snafu::ResultExt as _;

use crate::{
    bootloader::{remove_esp_files, CreateDirSnafu, RemoveSnafu, WriteSnafu},
    config::SystemConfiguration,
    entry::{BootEntry, Kind},
    file_utils::PathExt,
    host::Host,
    installer::Installed,
};

const BANNER: &str = "## THIS FILE IS GENERATED AUTOMATICALLY!!\n## To modify this file, use `stubctl`\n\n";

/// systemd specific bootloader behaviours
#[derive(Debug)]
pub struct Loader<'a> {
    host: &'a Host,
    esp: &'a Path,
}

/// Everything a `loader/entries/*.conf` file states
#[derive(Debug)]
pub struct EntryConf<'a> {
    pub title: &'a str,
    pub machine_id: &'a str,
    pub version: Option<&'a str>,
    pub kind: Kind,
    pub loader: &'a str,
    pub initrd: Option<&'a str>,
    pub cmdline: &'a str,
}

impl EntryConf<'_> {
    pub fn render(&self) -> String {
        let mut out = String::from(BANNER);
        let _ = writeln!(out, "title {}", self.title);
        let _ = writeln!(out, "machine-id {}", self.machine_id);
        if let (Kind::Linux, Some(version)) = (self.kind, self.version) {
            let _ = writeln!(out, "version {version}");
        }
        let _ = writeln!(out, "{} {}", self.kind, self.loader);
        if self.kind == Kind::Linux {
            if let Some(initrd) = self.initrd {
                let _ = writeln!(out, "initrd {initrd}");
            }
            let _ = writeln!(out, "options {}", self.cmdline);
        }
        out
    }
}

/// Render `loader/loader.conf`
pub fn render_loader_conf(config: &SystemConfiguration) -> String {
    let mut out = String::from(BANNER);
    if let Some(default) = &config.default_entry {
        let _ = writeln!(out, "default {default}");
    }
    let _ = writeln!(out, "timeout {}", config.menu_timeout);
    out
}

impl<'a> Loader<'a> {
    pub(super) fn new(host: &'a Host, esp: &'a Path) -> Self {
        Self { host, esp }
    }

    fn entries_dir(&self) -> PathBuf {
        self.esp.join_insensitive("loader").join_insensitive("entries")
    }

    fn conf_path(&self, name: &str) -> PathBuf {
        self.entries_dir().join_insensitive(format!("{name}.conf"))
    }

    fn write(&self, path: &Path, contents: &str) -> Result<(), super::Error> {
        if let Some(parent) = path.parent() {
            self.host.create_dir_all(parent).context(CreateDirSnafu { path: parent })?;
        }
        log::trace!("{}:\n{contents}", path.display());
        self.host.write(path, contents).context(WriteSnafu { path })
    }

    /// Write the entry file, plus a `-previous` twin when a backup slot exists
    pub(super) fn sync_entry(&self, entry: &BootEntry, installed: &Installed, uuid: &str) -> Result<(), super::Error> {
        let cmdline = entry.cmdline(uuid);
        let version = entry.version();
        let conf = EntryConf {
            title: entry.title(),
            machine_id: entry.machine_id(),
            version: version.as_deref(),
            kind: entry.kind(),
            loader: &installed.loader,
            initrd: installed.initrd.as_deref(),
            cmdline: &cmdline,
        };
        self.write(&self.conf_path(entry.entry_id()), &conf.render())?;

        let previous_path = self.conf_path(&format!("{}-previous", entry.entry_id()));
        match &installed.previous {
            Some((kernel, initrd)) => {
                let title = format!("{} (previous)", entry.title());
                let previous = EntryConf {
                    title: &title,
                    version: None,
                    loader: kernel,
                    initrd: Some(initrd),
                    ..conf
                };
                self.write(&previous_path, &previous.render())?;
            }
            None if previous_path.exists() => {
                log::debug!("no previous kernel, removing {}", previous_path.display());
                self.host
                    .remove_file(&previous_path)
                    .context(RemoveSnafu { path: &previous_path })?;
            }
            None => {}
        }

        Ok(())
    }

    /// Remove both entry files and the entry's ESP directory
    pub(super) fn remove_entry(&self, entry_id: &str) -> Result<(), super::Error> {
        for name in [entry_id.to_string(), format!("{entry_id}-previous")] {
            let path = self.conf_path(&name);
            if path.exists() {
                self.host.remove_file(&path).context(RemoveSnafu { path: &path })?;
            }
        }
        remove_esp_files(self.host, self.esp, entry_id)
    }

    pub(super) fn sync_defaults(&self, config: &SystemConfiguration) -> Result<(), super::Error> {
        let path = self.esp.join_insensitive("loader").join_insensitive("loader.conf");
        self.write(&path, &render_loader_conf(config))
    }
}
