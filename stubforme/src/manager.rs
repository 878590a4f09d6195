// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Entry management operations
//!
//! The [`Manager`] ties the stores, the drives and the configured bootloader
//! together. Every mutation it performs goes through its [`Host`].

use std::path::{Path, PathBuf};

use fs_err as fs;
use snafu::OptionExt as _;
use topology::disk::probe::Probe;

use crate::{
    bootloader::{remove_esp_files, Bootloader},
    config::{Backend, SystemConfiguration},
    drive::Drive,
    entry::{self, random_index, truncate_index, BootEntry, Descriptor, EntryBuilder, Kind},
    file_utils::{sanitize, under_root},
    host::Host,
    installer::Installer,
    options,
    os_release::OsInfo,
    store::EntryStore,
    DuplicateEntrySnafu, DuplicateIndexSnafu, Error, NoSuchEntrySnafu,
};

/// Parameters of a new entry. Anything left out is derived.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub index: Option<String>,
    pub entry_id: Option<String>,
    pub title: Option<String>,
    pub node: Option<PathBuf>,
    pub mount_point: Option<PathBuf>,
    pub exec_path: Option<Vec<PathBuf>>,

    /// Kernel command line, replacing the defaults
    pub options: Option<String>,

    pub make_default: bool,
}

/// Changes to an existing entry. Its index and `entry_id` never change.
#[derive(Debug, Clone, Default)]
pub struct EditRequest {
    pub title: Option<String>,
    pub node: Option<PathBuf>,
    pub mount_point: Option<PathBuf>,
    pub exec_path: Option<Vec<PathBuf>>,

    /// Replaces the whole command line
    pub options: Option<String>,
    pub add_options: Option<String>,
    pub remove_options: Option<String>,

    pub make_default: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SystemChanges {
    pub menu_timeout: Option<u32>,
    pub esp_path: Option<PathBuf>,
    pub backend: Option<Backend>,
}

/// One row of `list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySummary {
    pub index: String,
    pub title: String,
    pub entry_id: String,
    pub kind: Kind,
    pub is_default: bool,
}

#[derive(Debug)]
pub struct Manager {
    host: Host,
    probe: Probe,
    config: SystemConfiguration,
    store: EntryStore,
}

impl Manager {
    /// Load the system configuration from `config_dir`, creating it if needed
    pub fn new(host: Host, probe: Probe, config_dir: impl AsRef<Path>) -> Result<Self, Error> {
        let config_dir = config_dir.as_ref();
        let config = SystemConfiguration::load(&host, config_dir)?;
        log::debug!(
            "using ESP {} with the {} backend",
            config.esp_path.display(),
            config.backend
        );

        Ok(Self {
            host,
            probe,
            config,
            store: EntryStore::new(config_dir),
        })
    }

    pub fn config(&self) -> &SystemConfiguration {
        &self.config
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    fn bootloader(&self) -> Bootloader<'_> {
        Bootloader::new(self.config.backend, &self.host, &self.config.esp_path, &self.probe)
    }

    fn find(&self, index: &str) -> Result<Descriptor, Error> {
        self.store
            .find(&self.host, index)?
            .context(NoSuchEntrySnafu { index })
    }

    /// Install an entry and record it, releasing `drive` whatever happens
    fn deploy(&self, builder: EntryBuilder, drive: &mut Drive) -> Result<BootEntry, Error> {
        drive.mount(&self.host)?;
        let result = self.install(builder, drive);
        let released = drive.release(&self.host, &self.config.esp_path);
        let entry = match result {
            Ok(entry) => entry,
            Err(e) => {
                if let Err(release) = released {
                    log::warn!("unable to release {}: {release}", drive.mount_point().display());
                }
                return Err(e);
            }
        };
        released?;
        Ok(entry)
    }

    /// Firmware label an entry was installed under
    ///
    /// Descriptors written before labels were recorded read it from the
    /// entry's root, mounting it when needed.
    fn installed_label(&self, descriptor: &Descriptor) -> Result<String, Error> {
        if let Some(label) = &descriptor.label {
            return Ok(label.clone());
        }
        if descriptor.kind() == Kind::Efi {
            return Ok(descriptor.title.clone());
        }

        let mut drive = Drive::resolve(
            &self.probe,
            Some(descriptor.root_partition.as_path()),
            Some(descriptor.mount_point.as_path()),
        )?;
        drive.mount(&self.host)?;
        let os = OsInfo::from_root(drive.mount_point());
        drive.release(&self.host, &self.config.esp_path)?;
        Ok(entry::firmware_label(descriptor.kind(), &descriptor.title, &os))
    }

    /// Label to clean up after reinstalling `descriptor`, if the backend tracks labels
    fn label_before_change(&self, descriptor: &Descriptor) -> Result<Option<String>, Error> {
        if self.bootloader().uses_labels() {
            self.installed_label(descriptor).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Remove what the previous install of `entry` left behind
    fn retire(&self, old: &Descriptor, old_label: Option<&str>, entry: &BootEntry) -> Result<(), Error> {
        if let Some(old_label) = old_label {
            if old_label != entry.label() {
                log::info!("{} is now labelled {:?}, dropping {old_label:?}", entry.entry_id(), entry.label());
                self.bootloader().remove_label(old_label)?;
            }
        }

        if old.kind() == Kind::Linux && entry.kind() == Kind::Efi {
            let entry_dir = Path::new("/EFI").join(entry.entry_id());
            let keeps_loader = entry.executable().paths().iter().any(|p| p.starts_with(&entry_dir));
            if !keeps_loader {
                log::info!("{} no longer boots a kernel, removing its ESP files", entry.entry_id());
                remove_esp_files(&self.host, &self.config.esp_path, entry.entry_id())?;
            }
        }

        Ok(())
    }

    fn install(&self, builder: EntryBuilder, drive: &Drive) -> Result<BootEntry, Error> {
        Drive::from_mount_point(&self.probe, &self.config.esp_path)?;

        let entry = builder.build(drive, &self.host)?;
        let uuid = drive.uuid(&self.host)?.to_string();

        let installed = Installer::new(&self.host, &self.config.esp_path).install(&entry, &uuid)?;
        self.bootloader().sync_entry(&entry, &installed, &uuid)?;
        self.store.save(&self.host, &entry.descriptor())?;

        log::info!("installed entry {} ({})", entry.index(), entry.entry_id());
        Ok(entry)
    }

    fn make_default(&mut self, entry_id: &str) -> Result<(), Error> {
        log::info!("setting {entry_id} as the default entry");
        self.config.set_default_entry(&self.host, Some(entry_id.to_string()))?;
        Ok(())
    }

    /// Create and install a new entry
    ///
    /// The first entry created becomes the default.
    pub fn create(&mut self, request: CreateRequest) -> Result<BootEntry, Error> {
        let existing = self.store.load_all(&self.host)?;

        let index = match request.index {
            Some(index) => {
                let index = truncate_index(&index);
                if existing.iter().any(|d| d.index == index) {
                    return DuplicateIndexSnafu { index }.fail();
                }
                index
            }
            None => unique_index(&existing),
        };

        let mut builder = EntryBuilder::new().with_index(index);
        if let Some(entry_id) = request.entry_id {
            let entry_id = sanitize(&entry_id);
            if existing.iter().any(|d| d.entry_id == entry_id) {
                return DuplicateEntrySnafu { entry_id }.fail();
            }
            builder = builder.with_entry_id(entry_id);
        }
        if let Some(title) = request.title {
            builder = builder.with_title(title);
        }
        if let Some(exec_path) = request.exec_path {
            builder = builder.with_exec_path(exec_path);
        }
        if let Some(cmdline) = request.options {
            builder = builder.with_options(options::parse(&cmdline));
        }

        let mut drive = Drive::resolve(&self.probe, request.node.as_deref(), request.mount_point.as_deref())?;
        let entry = self.deploy(builder, &mut drive)?;

        if request.make_default || self.config.default_entry.is_none() {
            self.make_default(entry.entry_id())?;
        }
        self.bootloader().sync_defaults(&self.config)?;

        Ok(entry)
    }

    /// Modify an entry and reinstall it
    pub fn edit(&mut self, index: &str, request: EditRequest) -> Result<BootEntry, Error> {
        let descriptor = self.find(index)?;
        let mut builder = descriptor.builder();

        if let Some(title) = request.title {
            builder = builder.with_title(title);
        }
        if let Some(exec_path) = request.exec_path {
            builder = builder.with_exec_path(exec_path);
        }

        if request.options.is_some() || request.add_options.is_some() || request.remove_options.is_some() {
            let mut current = match &request.options {
                Some(cmdline) => options::parse(cmdline),
                None => descriptor.options.clone(),
            };
            if let Some(extra) = &request.add_options {
                options::add(&mut current, extra);
            }
            if let Some(unwanted) = &request.remove_options {
                options::remove(&mut current, unwanted);
            }
            builder = builder.with_options(current);
        }

        let old_label = self.label_before_change(&descriptor)?;
        let node = request.node.unwrap_or_else(|| descriptor.root_partition.clone());
        let mount_point = request.mount_point.unwrap_or_else(|| descriptor.mount_point.clone());
        let mut drive = Drive::resolve(&self.probe, Some(node.as_path()), Some(mount_point.as_path()))?;
        let entry = self.deploy(builder, &mut drive)?;
        self.retire(&descriptor, old_label.as_deref(), &entry)?;

        if request.make_default {
            self.make_default(entry.entry_id())?;
        }
        self.bootloader().sync_defaults(&self.config)?;

        Ok(entry)
    }

    /// Remove an entry. With `retain` the installed boot files stay in place.
    pub fn delete(&mut self, index: &str, retain: bool) -> Result<(), Error> {
        let descriptor = self.find(index)?;

        if retain {
            log::info!("keeping boot files of {}", descriptor.entry_id);
        } else {
            let label = self.label_before_change(&descriptor)?;
            self.bootloader().remove_entry(&descriptor.entry_id, label.as_deref())?;
        }
        self.store.remove(&self.host, &descriptor.entry_id)?;

        if self.config.default_entry.as_deref() == Some(descriptor.entry_id.as_str()) {
            log::info!("{} was the default entry, clearing the default", descriptor.entry_id);
            self.config.set_default_entry(&self.host, None)?;
        }
        self.bootloader().sync_defaults(&self.config)?;

        log::info!("deleted entry {index}");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<EntrySummary>, Error> {
        let default = self.config.default_entry.as_deref();
        Ok(self
            .store
            .load_all(&self.host)?
            .into_iter()
            .map(|d| EntrySummary {
                is_default: default == Some(d.entry_id.as_str()),
                kind: d.kind(),
                index: d.index,
                title: d.title,
                entry_id: d.entry_id,
            })
            .collect())
    }

    /// Human readable details of one entry, in display order
    pub fn show(&self, index: &str) -> Result<Vec<(String, String)>, Error> {
        let d = self.find(index)?;
        let mut rows = vec![
            ("Entry".to_string(), d.index.clone()),
            ("Title".to_string(), d.title.clone()),
            ("Root Partition".to_string(), d.root_partition.display().to_string()),
        ];

        if let Ok(parent) = self.probe.get_device_parent(&d.root_partition) {
            if let Some(guid) = self.probe.get_device_guid(&parent, &d.root_partition) {
                rows.push(("PartUUID".to_string(), guid));
            }
        }
        rows.push(("Mount Point".to_string(), d.mount_point.display().to_string()));

        match d.exec_path.as_slice() {
            [kernel, initrd] => {
                rows.push(("Kernel".to_string(), describe_link(&d.mount_point, kernel)));
                rows.push(("Initramfs".to_string(), describe_link(&d.mount_point, initrd)));
                rows.push(("Kernel Options".to_string(), options::join(&d.options)));
            }
            paths => {
                let loader = paths.first().map(|p| p.display().to_string()).unwrap_or_default();
                rows.push(("Loader".to_string(), loader));
            }
        }

        rows.push(("ID".to_string(), d.entry_id.clone()));
        Ok(rows)
    }

    /// Reinstall one entry, or all of them
    ///
    /// Updating everything carries on past failures and reports the first one.
    pub fn update(&mut self, index: Option<&str>) -> Result<usize, Error> {
        let descriptors = match index {
            Some(index) => vec![self.find(index)?],
            None => self.store.load_all(&self.host)?,
        };

        let mut updated = 0;
        let mut first_error = None;
        for descriptor in descriptors {
            let result = self.label_before_change(&descriptor).and_then(|old_label| {
                let mut drive = Drive::resolve(
                    &self.probe,
                    Some(descriptor.root_partition.as_path()),
                    Some(descriptor.mount_point.as_path()),
                )?;
                let entry = self.deploy(descriptor.builder(), &mut drive)?;
                self.retire(&descriptor, old_label.as_deref(), &entry)?;
                Ok(entry)
            });

            match result {
                Ok(_) => updated += 1,
                Err(e) => {
                    log::error!("failed to update entry {}: {e}", descriptor.index);
                    first_error.get_or_insert(e);
                }
            }
        }

        self.bootloader().sync_defaults(&self.config)?;

        match first_error {
            Some(e) => Err(e),
            None => Ok(updated),
        }
    }

    /// Change system wide settings
    pub fn system(&mut self, changes: SystemChanges) -> Result<(), Error> {
        if let Some(seconds) = changes.menu_timeout {
            self.config.set_menu_timeout(&self.host, seconds)?;
        }
        if let Some(esp_path) = changes.esp_path {
            self.config.set_esp_path(&self.host, esp_path)?;
        }
        if let Some(backend) = changes.backend {
            self.config.set_backend(&self.host, backend)?;
        }
        self.bootloader().sync_defaults(&self.config)?;
        Ok(())
    }
}

fn unique_index(existing: &[Descriptor]) -> String {
    loop {
        let candidate = random_index();
        if !existing.iter().any(|d| d.index == candidate) {
            return candidate;
        }
        log::debug!("index {candidate} is taken, picking another");
    }
}

/// `path`, followed by where it points when it is a link
fn describe_link(root: &Path, path: &Path) -> String {
    let resolved = fs::canonicalize(under_root(root, path)).ok().and_then(|real| {
        let root = fs::canonicalize(root).ok()?;
        let rel = real.strip_prefix(&root).ok()?;
        Some(Path::new("/").join(rel))
    });
    match resolved {
        Some(real) if real != path => format!("{} => {}", path.display(), real.display()),
        _ => path.display().to_string(),
    }
}
