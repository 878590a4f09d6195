// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Entry descriptors under `<config>/entries.d`

use std::path::{Path, PathBuf};

use fs_err as fs;
use snafu::ResultExt as _;

use crate::{
    config::{self, migrate_entry, read_json, write_json, ParseSnafu, ReadSnafu, WriteSnafu},
    entry::Descriptor,
    file_utils::sanitize,
    host::Host,
};

#[derive(Debug)]
pub struct EntryStore {
    dir: PathBuf,
}

impl EntryStore {
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: config_dir.as_ref().join("entries.d"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, entry_id: &str) -> PathBuf {
        self.dir.join(sanitize(entry_id))
    }

    /// Every descriptor, ordered by file name. Older revisions are upgraded on disk.
    pub fn load_all(&self, host: &Host) -> Result<Vec<Descriptor>, config::Error> {
        if !self.dir.is_dir() {
            return Ok(vec![]);
        }

        let mut paths = fs::read_dir(&self.dir)
            .context(ReadSnafu { path: &self.dir })?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file() && !matches!(p.extension(), Some(ext) if ext == "new"))
            .collect::<Vec<_>>();
        paths.sort();

        paths.iter().map(|path| self.load(host, path)).collect()
    }

    fn load(&self, host: &Host, path: &Path) -> Result<Descriptor, config::Error> {
        let mut value = read_json(path)?;
        let migrated = migrate_entry(&mut value, path)?;
        let descriptor: Descriptor = serde_json::from_value(value).context(ParseSnafu { path })?;
        if migrated {
            log::info!("upgraded entry {} to the current revision", descriptor.entry_id);
            write_json(host, path, &descriptor)?;
        }
        Ok(descriptor)
    }

    /// Look an entry up by its short index
    pub fn find(&self, host: &Host, index: &str) -> Result<Option<Descriptor>, config::Error> {
        Ok(self.load_all(host)?.into_iter().find(|d| d.index == index))
    }

    pub fn save(&self, host: &Host, descriptor: &Descriptor) -> Result<(), config::Error> {
        let path = self.path_for(&descriptor.entry_id);
        log::debug!("saving entry {} to {}", descriptor.index, path.display());
        write_json(host, &path, descriptor)
    }

    pub fn remove(&self, host: &Host, entry_id: &str) -> Result<(), config::Error> {
        let path = self.path_for(entry_id);
        if !path.exists() {
            log::debug!("no descriptor at {}", path.display());
            return Ok(());
        }
        host.remove_file(&path).context(WriteSnafu { path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CURRENT_REVISION;

    fn descriptor(index: &str, entry_id: &str) -> Descriptor {
        Descriptor {
            index: index.into(),
            entry_id: entry_id.into(),
            title: "Pop!_OS 22.04 (pop-os)".into(),
            root_partition: "/dev/sda2".into(),
            mount_point: "/".into(),
            exec_path: vec!["/boot/vmlinuz".into(), "/boot/initrd.img".into()],
            options: vec!["quiet".into(), "splash".into()],
            label: None,
            config_rev: CURRENT_REVISION,
        }
    }

    #[test]
    fn save_find_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let host = Host::new(false);
        let store = EntryStore::new(tmp.path());

        store.save(&host, &descriptor("ab12", "pop-ab12")).unwrap();
        store.save(&host, &descriptor("cd34", "pop-cd34")).unwrap();
        assert!(tmp.path().join("entries.d").join("pop-ab12").is_file());

        let found = store.find(&host, "cd34").unwrap().unwrap();
        assert_eq!(found.entry_id, "pop-cd34");
        assert!(store.find(&host, "zz99").unwrap().is_none());

        store.remove(&host, "pop-ab12").unwrap();
        assert_eq!(store.load_all(&host).unwrap().len(), 1);
    }

    #[test]
    fn upgrades_old_descriptors() {
        let tmp = tempfile::tempdir().unwrap();
        let host = Host::new(false);
        let store = EntryStore::new(tmp.path());
        fs::create_dir_all(store.dir()).unwrap();
        fs::write(
            store.dir().join("pop-ab12"),
            r#"{
  "index": "ab12",
  "entry_id": "pop-ab12",
  "title": "Pop!_OS 22.04 (pop-os)",
  "root_partition": "/dev/sda2",
  "exec_path": ["/boot/vmlinuz", "/boot/initrd.img"],
  "options": "quiet splash",
  "config_rev": 3
}"#,
        )
        .unwrap();

        let loaded = store.load_all(&host).unwrap();
        assert_eq!(loaded, [descriptor("ab12", "pop-ab12")]);

        let raw = fs::read_to_string(store.dir().join("pop-ab12")).unwrap();
        assert!(raw.contains("\"config_rev\": 4"));
    }

    #[test]
    fn simulated_saves_leave_disk_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let store = EntryStore::new(tmp.path());
        store.save(&Host::new(true), &descriptor("ab12", "pop-ab12")).unwrap();
        assert!(!store.dir().exists());
    }
}
