// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! System configuration and schema migration
//!
//! Revision 3 files (and files predating the revision marker) are upgraded to
//! [`CURRENT_REVISION`] in place. Any other revision is refused.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use fs_err as fs;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use snafu::{ResultExt as _, Snafu};

use crate::{host::Host, options};

/// Schema revision written by this version
pub const CURRENT_REVISION: u32 = 4;

/// The only older revision that can be upgraded
const MIGRATABLE_REVISION: u64 = 3;

pub const DEFAULT_CONFIG_DIR: &str = "/etc/stubforme";
pub const DEFAULT_ESP_PATH: &str = "/boot/efi";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("unable to read {path:?}: {source}"))]
    Read { path: PathBuf, source: std::io::Error },

    #[snafu(display("malformed configuration in {path:?}: {source}"))]
    Parse { path: PathBuf, source: serde_json::Error },

    #[snafu(display("{path:?} is not a configuration object"))]
    NotAnObject { path: PathBuf },

    #[snafu(display("{path:?} has unsupported revision {revision}"))]
    UnknownRevision { path: PathBuf, revision: String },

    #[snafu(display("unable to write {path:?}: {source}"))]
    Write { path: PathBuf, source: std::io::Error },

    #[snafu(display("unknown backend {name:?}, expected systemd-boot or efistub"))]
    UnknownBackend { name: String },
}

impl Error {
    /// The file the error is about, when there is one
    pub fn path(&self) -> Option<&Path> {
        match self {
            Error::Read { path, .. }
            | Error::Parse { path, .. }
            | Error::NotAnObject { path }
            | Error::UnknownRevision { path, .. }
            | Error::Write { path, .. } => Some(path),
            Error::UnknownBackend { .. } => None,
        }
    }
}

/// How entries reach the firmware
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// `loader/entries` files read by systemd-boot
    #[default]
    SystemdBoot,

    /// Firmware boot variables pointing straight at the kernel
    Efistub,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::SystemdBoot => f.write_str("systemd-boot"),
            Backend::Efistub => f.write_str("efistub"),
        }
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "systemd-boot" => Ok(Backend::SystemdBoot),
            "efistub" => Ok(Backend::Efistub),
            _ => UnknownBackendSnafu { name: s }.fail(),
        }
    }
}

/// Persisted system-wide settings, stored at `<config>/system`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemConfiguration {
    pub esp_path: PathBuf,

    /// `entry_id` of the default entry
    pub default_entry: Option<String>,

    pub menu_timeout: u32,

    #[serde(default)]
    pub backend: Backend,

    pub config_rev: u32,

    #[serde(skip)]
    path: PathBuf,
}

impl SystemConfiguration {
    fn defaults(path: PathBuf) -> Self {
        Self {
            esp_path: DEFAULT_ESP_PATH.into(),
            default_entry: None,
            menu_timeout: 0,
            backend: Backend::default(),
            config_rev: CURRENT_REVISION,
            path,
        }
    }

    /// Load `<config_dir>/system`, writing defaults when it does not exist
    pub fn load(host: &Host, config_dir: impl AsRef<Path>) -> Result<Self, Error> {
        let path = config_dir.as_ref().join("system");

        if !path.exists() {
            log::info!("no system configuration at {}, writing defaults", path.display());
            let config = Self::defaults(path);
            config.save(host)?;
            return Ok(config);
        }

        let mut value = read_json(&path)?;
        let migrated = migrate_system(&mut value, &path)?;
        let mut config: Self = serde_json::from_value(value).context(ParseSnafu { path: &path })?;
        config.path = path;

        if migrated {
            log::info!("upgraded {} to revision {CURRENT_REVISION}", config.path.display());
            config.save(host)?;
        }

        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, host: &Host) -> Result<(), Error> {
        write_json(host, &self.path, self)
    }

    pub fn set_esp_path(&mut self, host: &Host, esp_path: impl Into<PathBuf>) -> Result<(), Error> {
        self.esp_path = esp_path.into();
        self.save(host)
    }

    pub fn set_default_entry(&mut self, host: &Host, entry_id: Option<String>) -> Result<(), Error> {
        self.default_entry = entry_id;
        self.save(host)
    }

    pub fn set_menu_timeout(&mut self, host: &Host, seconds: u32) -> Result<(), Error> {
        self.menu_timeout = seconds;
        self.save(host)
    }

    pub fn set_backend(&mut self, host: &Host, backend: Backend) -> Result<(), Error> {
        self.backend = backend;
        self.save(host)
    }
}

pub(crate) fn read_json(path: &Path) -> Result<Value, Error> {
    let contents = fs::read_to_string(path).context(ReadSnafu { path })?;
    serde_json::from_str(&contents).context(ParseSnafu { path })
}

pub(crate) fn write_json(host: &Host, path: &Path, value: &impl Serialize) -> Result<(), Error> {
    let mut contents = serde_json::to_string_pretty(value).context(ParseSnafu { path })?;
    contents.push('\n');
    if let Some(parent) = path.parent() {
        host.create_dir_all(parent).context(WriteSnafu { path })?;
    }
    host.write(path, contents).context(WriteSnafu { path })
}

/// Check the revision of a loaded document, returning whether it needs migrating
fn check_revision(value: &Value, path: &Path) -> Result<bool, Error> {
    match value.get("config_rev") {
        None => Ok(true),
        Some(rev) => match rev.as_u64() {
            Some(r) if r == u64::from(CURRENT_REVISION) => Ok(false),
            Some(MIGRATABLE_REVISION) => Ok(true),
            _ => UnknownRevisionSnafu {
                path,
                revision: rev.to_string(),
            }
            .fail(),
        },
    }
}

/// Upgrade a system document in place
pub fn migrate_system(value: &mut Value, path: &Path) -> Result<bool, Error> {
    if !check_revision(value, path)? {
        return Ok(false);
    }
    let Some(object) = value.as_object_mut() else {
        return NotAnObjectSnafu { path }.fail();
    };

    object.entry("esp_path").or_insert_with(|| json!(DEFAULT_ESP_PATH));
    object.entry("default_entry").or_insert(Value::Null);
    let timeout = match object.get("menu_timeout") {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    };
    object.insert("menu_timeout".into(), json!(timeout));
    object.entry("backend").or_insert_with(|| json!(Backend::default()));
    object.insert("config_rev".into(), json!(CURRENT_REVISION));

    Ok(true)
}

/// Upgrade an entry descriptor in place
pub fn migrate_entry(value: &mut Value, path: &Path) -> Result<bool, Error> {
    if !check_revision(value, path)? {
        return Ok(false);
    }
    let Some(object) = value.as_object_mut() else {
        return NotAnObjectSnafu { path }.fail();
    };

    if let Some(Value::String(joined)) = object.get("options") {
        let tokens = options::parse(joined);
        object.insert("options".into(), json!(tokens));
    }
    object.entry("options").or_insert_with(|| json!([]));
    object.entry("mount_point").or_insert_with(|| json!("/"));
    object.insert("config_rev".into(), json!(CURRENT_REVISION));

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_configuration_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let host = Host::new(false);
        let config = SystemConfiguration::load(&host, tmp.path()).unwrap();
        assert_eq!(config.esp_path, PathBuf::from("/boot/efi"));
        assert_eq!(config.backend, Backend::SystemdBoot);
        assert!(tmp.path().join("system").exists());
    }

    #[test]
    fn setters_persist() {
        let tmp = tempfile::tempdir().unwrap();
        let host = Host::new(false);
        let mut config = SystemConfiguration::load(&host, tmp.path()).unwrap();
        config.set_menu_timeout(&host, 5).unwrap();
        config.set_backend(&host, Backend::Efistub).unwrap();
        config.set_default_entry(&host, Some("pop-1234".into())).unwrap();

        let reloaded = SystemConfiguration::load(&host, tmp.path()).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn migrates_previous_revision() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("system");
        fs::write(
            &path,
            r#"{"esp_path": "/efi", "default_entry": "pop-ab12", "menu_timeout": "3", "config_rev": 3}"#,
        )
        .unwrap();

        let host = Host::new(false);
        let config = SystemConfiguration::load(&host, tmp.path()).unwrap();
        assert_eq!(config.esp_path, PathBuf::from("/efi"));
        assert_eq!(config.default_entry.as_deref(), Some("pop-ab12"));
        assert_eq!(config.menu_timeout, 3);
        assert_eq!(config.config_rev, CURRENT_REVISION);

        let on_disk = read_json(&path).unwrap();
        assert_eq!(on_disk["config_rev"], json!(4));
        assert_eq!(on_disk["backend"], json!("systemd-boot"));
    }

    #[test]
    fn refuses_unknown_revision() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("system"), r#"{"config_rev": 2}"#).unwrap();
        let err = SystemConfiguration::load(&Host::new(false), tmp.path()).unwrap_err();
        assert!(matches!(err, Error::UnknownRevision { .. }));
        assert_eq!(err.path(), Some(tmp.path().join("system").as_path()));
    }

    #[test]
    fn malformed_json() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("system"), "{ not json").unwrap();
        let err = SystemConfiguration::load(&Host::new(false), tmp.path()).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn entry_options_become_a_list() {
        let mut value = json!({
            "index": "ab12",
            "entry_id": "pop",
            "title": "Pop",
            "root_partition": "/dev/sda2",
            "exec_path": ["/boot/vmlinuz", "/boot/initrd.img"],
            "options": "quiet splash acpi.osname=\"Linux here\"",
        });
        assert!(migrate_entry(&mut value, Path::new("pop")).unwrap());
        assert_eq!(value["options"], json!(["quiet", "splash", "acpi.osname=\"Linux here\""]));
        assert_eq!(value["mount_point"], json!("/"));
        assert_eq!(value["config_rev"], json!(4));
        assert_eq!(value["title"], json!("Pop"));

        assert!(!migrate_entry(&mut value, Path::new("pop")).unwrap());
    }

    #[test]
    fn backend_names() {
        assert_eq!("efistub".parse::<Backend>().unwrap(), Backend::Efistub);
        assert_eq!(Backend::SystemdBoot.to_string(), "systemd-boot");
        assert!("grub".parse::<Backend>().is_err());
    }
}
