// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Boot entries and their on-disk descriptors

use std::{
    fmt,
    path::{Path, PathBuf},
};

use fs_err as fs;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};

use crate::{
    config::CURRENT_REVISION,
    drive::{self, Drive},
    file_utils::{sanitize, under_root},
    host::Host,
    kernel,
    options::{self, DEFAULT_OPTIONS},
    os_release::OsInfo,
};

/// Longest index a user may pick
pub const MAX_INDEX_LEN: usize = 10;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("no kernel or loader found under {root:?}"))]
    NoExecutable { root: PathBuf },

    #[snafu(display("an entry needs at least one executable path"))]
    EmptyExecutable,

    #[snafu(display("kernel {kernel:?} has no initrd at {initrd:?}"))]
    MissingInitrd { kernel: PathBuf, initrd: PathBuf },

    #[snafu(display("{count} executable paths given, at most 2 are supported"))]
    TooManyPaths { count: usize },

    #[snafu(display("unable to read machine id from {path:?}: {source}"))]
    MachineId { path: PathBuf, source: std::io::Error },

    #[snafu(display("empty machine id in {path:?}"))]
    EmptyMachineId { path: PathBuf },

    #[snafu(context(false), display("drive: {source}"))]
    Drive { source: drive::Error },
}

/// What the firmware or loader ends up starting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Executable {
    /// A kernel booted with its initrd
    Linux { kernel: PathBuf, initrd: PathBuf },

    /// Any other EFI binary, chainloaded as-is
    Efi { loader: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Linux,
    Efi,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Linux => f.write_str("linux"),
            Kind::Efi => f.write_str("efi"),
        }
    }
}

impl Executable {
    pub fn kind(&self) -> Kind {
        match self {
            Executable::Linux { .. } => Kind::Linux,
            Executable::Efi { .. } => Kind::Efi,
        }
    }

    /// The persisted form: one path for efi, two for linux
    pub fn paths(&self) -> Vec<PathBuf> {
        match self {
            Executable::Linux { kernel, initrd } => vec![kernel.clone(), initrd.clone()],
            Executable::Efi { loader } => vec![loader.clone()],
        }
    }

    /// Classify executable paths, relative to the entry's `root`
    ///
    /// `None` autodetects a kernel. More than two paths are trimmed once
    /// before giving up.
    pub fn classify(paths: Option<Vec<PathBuf>>, root: &Path) -> Result<Self, Error> {
        let Some(mut paths) = paths else {
            return Self::autodetect(root);
        };

        let count = paths.len();
        if count > 2 {
            log::warn!("{count} executable paths given, dropping {:?}", paths[count - 1]);
            paths.truncate(count - 1);
        }

        match paths.as_slice() {
            [] => EmptyExecutableSnafu.fail(),
            [single] => Self::from_single(single, root),
            [kernel, initrd] => Self::from_pair(kernel, initrd, root),
            _ => TooManyPathsSnafu { count }.fail(),
        }
    }

    fn autodetect(root: &Path) -> Result<Self, Error> {
        for (kernel, initrd) in [("/boot/vmlinuz", "/boot/initrd.img"), ("/vmlinuz", "/initrd.img")] {
            if under_root(root, Path::new(kernel)).exists() && under_root(root, Path::new(initrd)).exists() {
                log::debug!("autodetected {kernel} and {initrd}");
                return Ok(Executable::Linux {
                    kernel: kernel.into(),
                    initrd: initrd.into(),
                });
            }
        }

        let pair = kernel::newest(root).ok_or_else(|| Error::NoExecutable { root: root.into() })?;
        log::debug!("using newest installed kernel {}", pair.version);
        Ok(Executable::Linux {
            kernel: pair.kernel,
            initrd: pair.initrd,
        })
    }

    fn from_single(path: &Path, root: &Path) -> Result<Self, Error> {
        let is_efi = path
            .extension()
            .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case("efi"));
        if is_efi {
            return Ok(Executable::Efi { loader: path.into() });
        }

        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let Some(pattern) = ["vmlinuz", "vmlinux"].into_iter().find(|p| name.contains(p)) else {
            log::warn!("{} does not look like a kernel, treating it as an EFI loader", path.display());
            return Ok(Executable::Efi { loader: path.into() });
        };

        let initrd = path.with_file_name(name.replacen(pattern, "initrd.img", 1));
        if !under_root(root, &initrd).exists() {
            return MissingInitrdSnafu {
                kernel: path,
                initrd,
            }
            .fail();
        }

        Ok(Executable::Linux {
            kernel: path.into(),
            initrd,
        })
    }

    fn from_pair(kernel: &Path, initrd: &Path, root: &Path) -> Result<Self, Error> {
        if !under_root(root, kernel).exists() {
            log::warn!(
                "{} does not exist under {}, treating it as an EFI loader",
                kernel.display(),
                root.display()
            );
            return Ok(Executable::Efi { loader: kernel.into() });
        }
        if !under_root(root, initrd).exists() {
            return MissingInitrdSnafu { kernel, initrd }.fail();
        }
        Ok(Executable::Linux {
            kernel: kernel.into(),
            initrd: initrd.into(),
        })
    }
}

/// A short random handle: the last 4 characters of a v4 UUID
pub fn random_index() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    uuid[uuid.len() - 4..].to_string()
}

/// Clamp a user supplied index to [`MAX_INDEX_LEN`] characters
pub fn truncate_index(index: &str) -> String {
    index.chars().take(MAX_INDEX_LEN).collect()
}

/// Deterministic on-disk name of an entry
pub fn derive_entry_id(title: &str, machine_id: &str, index: &str) -> String {
    sanitize(&format!("{}-{machine_id}-{index}", title.replace(" - ", "-")))
}

/// Collects the optional parts of an entry before validation
#[derive(Debug, Clone, Default)]
pub struct EntryBuilder {
    index: Option<String>,
    entry_id: Option<String>,
    title: Option<String>,
    exec_path: Option<Vec<PathBuf>>,
    options: Option<Vec<String>>,
}

impl EntryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_index(self, index: impl Into<String>) -> Self {
        Self {
            index: Some(index.into()),
            ..self
        }
    }

    pub fn with_entry_id(self, entry_id: impl Into<String>) -> Self {
        Self {
            entry_id: Some(entry_id.into()),
            ..self
        }
    }

    pub fn with_title(self, title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..self
        }
    }

    pub fn with_exec_path(self, exec_path: Vec<PathBuf>) -> Self {
        Self {
            exec_path: Some(exec_path),
            ..self
        }
    }

    pub fn with_options(self, options: Vec<String>) -> Self {
        Self {
            options: Some(options),
            ..self
        }
    }

    pub fn options(&self) -> Option<&[String]> {
        self.options.as_deref()
    }

    /// Validate everything against `drive`, which must be mounted
    pub fn build(self, drive: &Drive, host: &Host) -> Result<BootEntry, Error> {
        let root = drive.mount_point();

        let executable = Executable::classify(self.exec_path, root)?;

        let options = match executable.kind() {
            Kind::Linux => self.options.unwrap_or_else(|| options::parse(DEFAULT_OPTIONS)),
            Kind::Efi => vec![],
        };

        let os = OsInfo::from_root(root);

        let machine_id = match executable.kind() {
            Kind::Linux => read_machine_id(root)?,
            Kind::Efi => drive.uuid(host)?.to_string(),
        };

        let title = self.title.unwrap_or_else(|| os.default_title());

        let index = self
            .index
            .map(|i| truncate_index(&i))
            .unwrap_or_else(random_index);

        let entry_id = match self.entry_id {
            Some(id) => sanitize(&id),
            None => derive_entry_id(&title, &machine_id, &index),
        };

        log::debug!("built {} entry {entry_id} ({index})", executable.kind());

        Ok(BootEntry {
            index,
            entry_id,
            title,
            drive: drive.clone(),
            executable,
            options,
            machine_id,
            os,
        })
    }
}

fn read_machine_id(root: &Path) -> Result<String, Error> {
    let path = root.join("etc").join("machine-id");
    let contents = fs::read_to_string(&path).context(MachineIdSnafu { path: &path })?;
    match contents.lines().next().map(str::trim) {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => EmptyMachineIdSnafu { path }.fail(),
    }
}

/// A fully validated boot entry
#[derive(Debug, Clone)]
pub struct BootEntry {
    index: String,
    entry_id: String,
    title: String,
    drive: Drive,
    executable: Executable,
    options: Vec<String>,
    machine_id: String,
    os: OsInfo,
}

impl BootEntry {
    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn drive(&self) -> &Drive {
        &self.drive
    }

    pub fn executable(&self) -> &Executable {
        &self.executable
    }

    pub fn kind(&self) -> Kind {
        self.executable.kind()
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn os(&self) -> &OsInfo {
        &self.os
    }

    /// Kernel release taken from the resolved kernel file name, i.e. `6.9.3-generic`
    pub fn version(&self) -> Option<String> {
        let Executable::Linux { kernel, .. } = &self.executable else {
            return None;
        };
        let path = under_root(self.drive.mount_point(), kernel);
        let resolved = fs::canonicalize(&path).unwrap_or(path);
        let name = resolved.file_name()?.to_string_lossy().into_owned();
        ["vmlinuz-", "vmlinux-"]
            .into_iter()
            .find_map(|prefix| name.strip_prefix(prefix))
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    /// Name of the firmware boot variable for this entry
    pub fn label(&self) -> String {
        firmware_label(self.kind(), &self.title, &self.os)
    }

    /// Kernel command line: `root=UUID=<uuid> ro <options>`
    pub fn cmdline(&self, uuid: &str) -> String {
        let mut cmdline = format!("root=UUID={uuid} ro");
        for option in &self.options {
            cmdline.push(' ');
            cmdline.push_str(option);
        }
        cmdline
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor {
            index: self.index.clone(),
            entry_id: self.entry_id.clone(),
            title: self.title.clone(),
            root_partition: self.drive.node().to_path_buf(),
            mount_point: self.drive.mount_point().to_path_buf(),
            exec_path: self.executable.paths(),
            options: self.options.clone(),
            label: Some(self.label()),
            config_rev: CURRENT_REVISION,
        }
    }
}

/// Firmware labels are per OS for linux entries and per title otherwise
pub fn firmware_label(kind: Kind, title: &str, os: &OsInfo) -> String {
    match kind {
        Kind::Linux => os.label(),
        Kind::Efi => title.to_string(),
    }
}

/// Persisted form of a [`BootEntry`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub index: String,
    pub entry_id: String,
    pub title: String,
    pub root_partition: PathBuf,
    pub mount_point: PathBuf,
    pub exec_path: Vec<PathBuf>,
    pub options: Vec<String>,

    /// Firmware boot variable label at the last install
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    pub config_rev: u32,
}

impl Descriptor {
    /// Kind implied by the number of persisted paths
    pub fn kind(&self) -> Kind {
        if self.exec_path.len() == 2 {
            Kind::Linux
        } else {
            Kind::Efi
        }
    }

    /// Builder that reproduces this entry, identity included
    pub fn builder(&self) -> EntryBuilder {
        let builder = EntryBuilder::new()
            .with_index(&self.index)
            .with_entry_id(&self.entry_id)
            .with_title(&self.title)
            .with_exec_path(self.exec_path.clone());
        if self.kind() == Kind::Linux {
            builder.with_options(self.options.clone())
        } else {
            builder
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_with(files: &[&str]) -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        for file in files {
            let path = under_root(tmp.path(), Path::new(file));
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, b"payload").unwrap();
        }
        tmp
    }

    fn paths(p: &[&str]) -> Option<Vec<PathBuf>> {
        Some(p.iter().map(PathBuf::from).collect())
    }

    #[test]
    fn single_efi_path() {
        let tmp = root_with(&[]);
        let exec = Executable::classify(paths(&["/EFI/Microsoft/Boot/bootmgfw.EFI"]), tmp.path()).unwrap();
        assert_eq!(exec.kind(), Kind::Efi);
    }

    #[test]
    fn single_kernel_finds_initrd() {
        let tmp = root_with(&["/boot/vmlinuz-6.9.3", "/boot/initrd.img-6.9.3"]);
        let exec = Executable::classify(paths(&["/boot/vmlinuz-6.9.3"]), tmp.path()).unwrap();
        assert_eq!(
            exec,
            Executable::Linux {
                kernel: "/boot/vmlinuz-6.9.3".into(),
                initrd: "/boot/initrd.img-6.9.3".into(),
            }
        );
    }

    #[test]
    fn single_kernel_without_initrd_is_an_error() {
        let tmp = root_with(&["/boot/vmlinuz-6.9.3"]);
        let err = Executable::classify(paths(&["/boot/vmlinuz-6.9.3"]), tmp.path()).unwrap_err();
        assert!(matches!(err, Error::MissingInitrd { .. }));
    }

    #[test]
    fn unrecognised_single_path_is_efi() {
        let tmp = root_with(&[]);
        let exec = Executable::classify(paths(&["/boot/bzImage"]), tmp.path()).unwrap();
        assert_eq!(exec, Executable::Efi { loader: "/boot/bzImage".into() });
    }

    #[test]
    fn pair_with_missing_kernel_downgrades() {
        let tmp = root_with(&["/boot/initrd.img"]);
        let exec = Executable::classify(paths(&["/EFI/tool.efi", "/boot/initrd.img"]), tmp.path()).unwrap();
        assert_eq!(exec, Executable::Efi { loader: "/EFI/tool.efi".into() });
    }

    #[test]
    fn pair_with_missing_initrd_is_an_error() {
        let tmp = root_with(&["/boot/vmlinuz"]);
        let err = Executable::classify(paths(&["/boot/vmlinuz", "/boot/initrd.img"]), tmp.path()).unwrap_err();
        assert!(matches!(err, Error::MissingInitrd { .. }));
    }

    #[test]
    fn too_many_paths() {
        let tmp = root_with(&["/boot/vmlinuz", "/boot/initrd.img"]);
        let exec = Executable::classify(paths(&["/boot/vmlinuz", "/boot/initrd.img", "/extra"]), tmp.path()).unwrap();
        assert_eq!(exec.kind(), Kind::Linux);

        let err = Executable::classify(paths(&["/a", "/b", "/c", "/d"]), tmp.path()).unwrap_err();
        assert!(matches!(err, Error::TooManyPaths { count: 4 }));
    }

    #[test]
    fn empty_paths() {
        let tmp = root_with(&[]);
        let err = Executable::classify(Some(vec![]), tmp.path()).unwrap_err();
        assert!(matches!(err, Error::EmptyExecutable));
    }

    #[test]
    fn autodetect_order() {
        let tmp = root_with(&["/vmlinuz", "/initrd.img", "/boot/vmlinuz-6.1", "/boot/initrd.img-6.1"]);
        let exec = Executable::classify(None, tmp.path()).unwrap();
        assert_eq!(exec.paths(), [PathBuf::from("/vmlinuz"), PathBuf::from("/initrd.img")]);

        let tmp = root_with(&["/boot/vmlinuz-6.1", "/boot/initrd.img-6.1"]);
        let exec = Executable::classify(None, tmp.path()).unwrap();
        assert_eq!(exec.paths()[0], PathBuf::from("/boot/vmlinuz-6.1"));

        let tmp = root_with(&[]);
        assert!(matches!(
            Executable::classify(None, tmp.path()),
            Err(Error::NoExecutable { .. })
        ));
    }

    #[test]
    fn entry_id_is_pure() {
        let a = derive_entry_id("Pop!_OS 22.04 - Recovery (pop-os)", "3f1c0de0", "ab12");
        let b = derive_entry_id("Pop!_OS 22.04 - Recovery (pop-os)", "3f1c0de0", "ab12");
        assert_eq!(a, b);
        assert_eq!(a, "Pop_OS_22.04-Recovery_pop-os-3f1c0de0-ab12");
    }

    #[test]
    fn indices() {
        assert_eq!(random_index().len(), 4);
        assert_eq!(truncate_index("abcdefghijklmnop"), "abcdefghij");
        assert_eq!(truncate_index("short"), "short");
    }

    fn linux_root() -> tempfile::TempDir {
        let tmp = root_with(&["/boot/vmlinuz-6.9.3-generic", "/boot/initrd.img-6.9.3-generic"]);
        fs::create_dir_all(tmp.path().join("etc")).unwrap();
        fs::write(tmp.path().join("etc/machine-id"), "0123456789abcdef\n").unwrap();
        fs::write(tmp.path().join("etc/os-release"), "NAME=\"Pop!_OS\"\nVERSION_ID=\"22.04\"\n").unwrap();
        fs::write(tmp.path().join("etc/hostname"), "pop-os\n").unwrap();
        tmp
    }

    #[test]
    fn builds_linux_entry() {
        let tmp = linux_root();
        let drive = Drive::new("/dev/sda2", tmp.path(), true).with_uuid("f00d");
        let host = Host::new(true);

        let entry = EntryBuilder::new().with_index("x1").build(&drive, &host).unwrap();
        assert_eq!(entry.kind(), Kind::Linux);
        assert_eq!(entry.title(), "Pop!_OS 22.04 (pop-os)");
        assert_eq!(entry.machine_id(), "0123456789abcdef");
        assert_eq!(entry.options(), ["quiet", "splash"]);
        assert_eq!(entry.entry_id(), "Pop_OS_22.04_pop-os-0123456789abcdef-x1");
        assert_eq!(entry.version().as_deref(), Some("6.9.3-generic"));
        assert_eq!(entry.label(), "Pop!_OS 22.04");
        assert_eq!(entry.cmdline("f00d"), "root=UUID=f00d ro quiet splash");
    }

    #[test]
    fn descriptor_reproduces_entry() {
        let tmp = linux_root();
        let drive = Drive::new("/dev/sda2", tmp.path(), true).with_uuid("f00d");
        let host = Host::new(true);

        let entry = EntryBuilder::new()
            .with_title("Custom")
            .with_options(options::parse("ro quiet"))
            .build(&drive, &host)
            .unwrap();
        let descriptor = entry.descriptor();
        let rebuilt = descriptor.builder().build(&drive, &host).unwrap();
        assert_eq!(rebuilt.descriptor(), descriptor);
        assert_eq!(descriptor.label.as_deref(), Some("Pop!_OS 22.04"));
    }

    #[test]
    fn efi_entry_uses_drive_uuid() {
        let tmp = root_with(&[]);
        let drive = Drive::new("/dev/sda1", tmp.path(), true).with_uuid("8A1B-2C3D");
        let host = Host::new(true);

        let entry = EntryBuilder::new()
            .with_index("win")
            .with_title("Windows")
            .with_exec_path(vec!["/EFI/Microsoft/Boot/bootmgfw.efi".into()])
            .with_options(vec!["ignored".into()])
            .build(&drive, &host)
            .unwrap();
        assert_eq!(entry.machine_id(), "8A1B-2C3D");
        assert!(entry.options().is_empty());
        assert_eq!(entry.entry_id(), "Windows-8A1B-2C3D-win");
        assert_eq!(entry.label(), "Windows");
        assert_eq!(entry.version(), None);
    }
}
