// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Materializes entries on the ESP

use std::path::{Path, PathBuf};

use snafu::ResultExt as _;

use crate::{
    bootloader::{CreateDirSnafu, Error, InitrdCopySnafu, KernelCopySnafu},
    entry::{BootEntry, Executable},
    file_utils::{is_unchanged, is_unchanged_payload, under_root, PathExt},
    host::Host,
    kernel,
};

pub const KERNEL_NAME: &str = "vmlinuz.efi";
pub const INITRD_NAME: &str = "initrd.img";
pub const PREVIOUS_KERNEL_NAME: &str = "vmlinuz-previous.efi";
pub const PREVIOUS_INITRD_NAME: &str = "initrd-previous.img";

/// Firmware on these architectures cannot start a compressed kernel image
const DECOMPRESS_KERNEL: bool = cfg!(any(
    target_arch = "aarch64",
    target_arch = "riscv64",
    target_arch = "loongarch64"
));

/// Result of preserving the previously installed kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    /// A previous slot is in place
    Done,

    /// Nothing to preserve
    Skipped,

    Failed(String),
}

/// ESP-relative paths of an installed entry, `/EFI/...` style
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installed {
    /// Kernel or EFI loader
    pub loader: String,

    pub initrd: Option<String>,

    /// Previous kernel and initrd, present when the backup is in place
    pub previous: Option<(String, String)>,

    pub backup: BackupOutcome,
}

#[derive(Debug)]
pub struct Installer<'a> {
    host: &'a Host,
    esp: &'a Path,
    decompress: bool,
}

impl<'a> Installer<'a> {
    pub fn new(host: &'a Host, esp: &'a Path) -> Self {
        Self {
            host,
            esp,
            decompress: DECOMPRESS_KERNEL,
        }
    }

    /// Override kernel decompression, normally decided by the target architecture
    pub fn with_decompress(self, decompress: bool) -> Self {
        Self { decompress, ..self }
    }

    /// `EFI/<entry_id>` on the ESP
    pub fn entry_dir(&self, entry_id: &str) -> PathBuf {
        self.esp.join_insensitive("EFI").join_insensitive(entry_id)
    }

    fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(self.esp).unwrap_or(path);
        format!("/{}", rel.to_string_lossy().trim_start_matches('/'))
    }

    /// Copy the entry's files to the ESP
    ///
    /// Kernel and initrd failures are fatal. Backup and `cmdline` failures
    /// are logged and ignored.
    pub fn install(&self, entry: &BootEntry, uuid: &str) -> Result<Installed, Error> {
        let (kernel, initrd) = match entry.executable() {
            Executable::Efi { loader } => {
                log::debug!("{} is an EFI loader, nothing to copy", loader.display());
                return Ok(Installed {
                    loader: loader.to_string_lossy().into_owned(),
                    initrd: None,
                    previous: None,
                    backup: BackupOutcome::Skipped,
                });
            }
            Executable::Linux { kernel, initrd } => (kernel, initrd),
        };

        let root = entry.drive().mount_point();
        let kernel_src = under_root(root, kernel);
        let initrd_src = under_root(root, initrd);

        let dir = self.entry_dir(entry.entry_id());
        self.host.create_dir_all(&dir).context(CreateDirSnafu { path: &dir })?;

        let kernel_dest = dir.join_insensitive(KERNEL_NAME);
        let initrd_dest = dir.join_insensitive(INITRD_NAME);

        let backup = self.backup(&dir, root, (&kernel_src, &initrd_src));
        match &backup {
            BackupOutcome::Failed(reason) => log::error!("unable to back up the previous kernel: {reason}"),
            BackupOutcome::Skipped => log::debug!("no previous kernel to back up"),
            BackupOutcome::Done => {}
        }

        if self.decompress {
            self.host
                .copy_decompressed(&kernel_src, &kernel_dest)
                .context(KernelCopySnafu { path: &kernel_src })?;
        } else {
            self.host
                .copy(&kernel_src, &kernel_dest)
                .context(KernelCopySnafu { path: &kernel_src })?;
        }
        self.host
            .copy(&initrd_src, &initrd_dest)
            .context(InitrdCopySnafu { path: &initrd_src })?;

        let cmdline_path = dir.join_insensitive("cmdline");
        if let Err(e) = self.host.write(&cmdline_path, entry.cmdline(uuid)) {
            log::error!("unable to save cmdline reference {}: {e}", cmdline_path.display());
        }

        let previous = (backup == BackupOutcome::Done).then(|| {
            (
                self.relative(&dir.join_insensitive(PREVIOUS_KERNEL_NAME)),
                self.relative(&dir.join_insensitive(PREVIOUS_INITRD_NAME)),
            )
        });

        Ok(Installed {
            loader: self.relative(&kernel_dest),
            initrd: Some(self.relative(&initrd_dest)),
            previous,
            backup,
        })
    }

    /// Preserve whatever is about to be replaced as the previous slot
    ///
    /// An ESP without a current slot falls back to the second newest kernel
    /// installed in the root.
    fn backup(&self, dir: &Path, root: &Path, incoming: (&Path, &Path)) -> BackupOutcome {
        let current = (dir.join_insensitive(KERNEL_NAME), dir.join_insensitive(INITRD_NAME));
        let previous = (
            dir.join_insensitive(PREVIOUS_KERNEL_NAME),
            dir.join_insensitive(PREVIOUS_INITRD_NAME),
        );

        let sources = if current.0.is_file() && current.1.is_file() {
            let kernel_unchanged = if self.decompress {
                is_unchanged_payload(incoming.0, &current.0)
            } else {
                is_unchanged(incoming.0, &current.0)
            };
            if kernel_unchanged && is_unchanged(incoming.1, &current.1) {
                return if previous.0.is_file() && previous.1.is_file() {
                    BackupOutcome::Done
                } else {
                    BackupOutcome::Skipped
                };
            }
            (current, false)
        } else if let Some(pair) = kernel::previous(root) {
            log::debug!("backing up installed kernel {}", pair.version);
            ((under_root(root, &pair.kernel), under_root(root, &pair.initrd)), self.decompress)
        } else {
            return BackupOutcome::Skipped;
        };
        let ((kernel, initrd), decompress) = sources;

        let kernel_copy = if decompress {
            self.host.copy_decompressed(&kernel, &previous.0).map(|_| ())
        } else {
            self.host.copy(&kernel, &previous.0)
        };
        let result = kernel_copy.and_then(|_| self.host.copy(&initrd, &previous.1));
        match result {
            Ok(()) => BackupOutcome::Done,
            Err(e) => BackupOutcome::Failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use fs_err as fs;

    use super::*;
    use crate::{drive::Drive, entry::EntryBuilder};

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        esp: PathBuf,
    }

    fn fixture(kernels: &[&str]) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        let esp = tmp.path().join("esp");
        fs::create_dir_all(root.join("boot")).unwrap();
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::create_dir_all(esp.join("EFI")).unwrap();
        fs::write(root.join("etc/machine-id"), "feedface\n").unwrap();
        for version in kernels {
            fs::write(root.join(format!("boot/vmlinuz-{version}")), format!("kernel {version}")).unwrap();
            fs::write(root.join(format!("boot/initrd.img-{version}")), format!("initrd {version}")).unwrap();
        }
        Fixture { _tmp: tmp, root, esp }
    }

    fn entry(fixture: &Fixture, version: &str) -> BootEntry {
        let drive = Drive::new("/dev/sda2", &fixture.root, true).with_uuid("f00d");
        EntryBuilder::new()
            .with_index("ab12")
            .with_entry_id("pop-ab12")
            .with_exec_path(vec![
                format!("/boot/vmlinuz-{version}").into(),
                format!("/boot/initrd.img-{version}").into(),
            ])
            .build(&drive, &Host::new(false))
            .unwrap()
    }

    #[test]
    fn installs_linux_entry() {
        let fixture = fixture(&["6.9.3"]);
        let host = Host::new(false);
        let installer = Installer::new(&host, &fixture.esp).with_decompress(false);

        let installed = installer.install(&entry(&fixture, "6.9.3"), "f00d").unwrap();
        assert_eq!(installed.loader, "/EFI/pop-ab12/vmlinuz.efi");
        assert_eq!(installed.initrd.as_deref(), Some("/EFI/pop-ab12/initrd.img"));
        assert_eq!(installed.backup, BackupOutcome::Skipped);
        assert_eq!(installed.previous, None);

        let dir = fixture.esp.join("EFI/pop-ab12");
        assert_eq!(fs::read_to_string(dir.join("vmlinuz.efi")).unwrap(), "kernel 6.9.3");
        assert_eq!(fs::read_to_string(dir.join("initrd.img")).unwrap(), "initrd 6.9.3");
        assert_eq!(
            fs::read_to_string(dir.join("cmdline")).unwrap(),
            "root=UUID=f00d ro quiet splash"
        );
    }

    #[test]
    fn backs_up_replaced_kernel() {
        let fixture = fixture(&["6.8.0", "6.9.3"]);
        let host = Host::new(false);
        let installer = Installer::new(&host, &fixture.esp).with_decompress(false);

        installer.install(&entry(&fixture, "6.8.0"), "f00d").unwrap();
        let installed = installer.install(&entry(&fixture, "6.9.3"), "f00d").unwrap();
        assert_eq!(installed.backup, BackupOutcome::Done);
        assert_eq!(
            installed.previous,
            Some((
                "/EFI/pop-ab12/vmlinuz-previous.efi".to_string(),
                "/EFI/pop-ab12/initrd-previous.img".to_string()
            ))
        );

        let dir = fixture.esp.join("EFI/pop-ab12");
        assert_eq!(fs::read_to_string(dir.join("vmlinuz-previous.efi")).unwrap(), "kernel 6.8.0");
        assert_eq!(fs::read_to_string(dir.join("vmlinuz.efi")).unwrap(), "kernel 6.9.3");

        // a repeat run keeps the slot it already has
        let again = installer.install(&entry(&fixture, "6.9.3"), "f00d").unwrap();
        assert_eq!(again.backup, BackupOutcome::Done);
        assert_eq!(fs::read_to_string(dir.join("vmlinuz-previous.efi")).unwrap(), "kernel 6.8.0");
    }

    #[test]
    fn decompressed_kernels_keep_their_backup() {
        use std::io::Write as _;

        let fixture = fixture(&[]);
        for version in ["6.8.0", "6.9.3"] {
            let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(format!("kernel {version}").as_bytes()).unwrap();
            fs::write(
                fixture.root.join(format!("boot/vmlinuz-{version}")),
                encoder.finish().unwrap(),
            )
            .unwrap();
            fs::write(fixture.root.join(format!("boot/initrd.img-{version}")), format!("initrd {version}")).unwrap();
        }
        let host = Host::new(false);
        let installer = Installer::new(&host, &fixture.esp).with_decompress(true);
        let dir = fixture.esp.join("EFI/pop-ab12");

        installer.install(&entry(&fixture, "6.8.0"), "f00d").unwrap();
        assert_eq!(fs::read_to_string(dir.join("vmlinuz.efi")).unwrap(), "kernel 6.8.0");
        assert_eq!(fs::read_to_string(dir.join("vmlinuz-previous.efi")).unwrap(), "kernel 6.8.0");

        installer.install(&entry(&fixture, "6.9.3"), "f00d").unwrap();
        assert_eq!(fs::read_to_string(dir.join("vmlinuz.efi")).unwrap(), "kernel 6.9.3");
        assert_eq!(fs::read_to_string(dir.join("vmlinuz-previous.efi")).unwrap(), "kernel 6.8.0");

        let again = installer.install(&entry(&fixture, "6.9.3"), "f00d").unwrap();
        assert_eq!(again.backup, BackupOutcome::Done);
        assert_eq!(fs::read_to_string(dir.join("vmlinuz.efi")).unwrap(), "kernel 6.9.3");
        assert_eq!(fs::read_to_string(dir.join("vmlinuz-previous.efi")).unwrap(), "kernel 6.8.0");
    }

    #[test]
    fn first_install_backs_up_older_root_kernel() {
        let fixture = fixture(&["6.8.0", "6.9.3"]);
        let host = Host::new(false);
        let installer = Installer::new(&host, &fixture.esp).with_decompress(false);

        let installed = installer.install(&entry(&fixture, "6.9.3"), "f00d").unwrap();
        assert_eq!(installed.backup, BackupOutcome::Done);
        let dir = fixture.esp.join("EFI/pop-ab12");
        assert_eq!(fs::read_to_string(dir.join("initrd-previous.img")).unwrap(), "initrd 6.8.0");
    }

    #[test]
    fn reuses_existing_case_on_the_esp() {
        let fixture = fixture(&["6.9.3"]);
        fs::create_dir_all(fixture.esp.join("EFI/POP-AB12")).unwrap();
        let host = Host::new(false);
        let installer = Installer::new(&host, &fixture.esp).with_decompress(false);

        let installed = installer.install(&entry(&fixture, "6.9.3"), "f00d").unwrap();
        assert_eq!(installed.loader, "/EFI/POP-AB12/vmlinuz.efi");
    }

    #[test]
    fn missing_kernel_is_fatal() {
        let fixture = fixture(&["6.9.3"]);
        let host = Host::new(false);
        let installer = Installer::new(&host, &fixture.esp).with_decompress(false);
        let entry = entry(&fixture, "6.9.3");
        fs::remove_file(fixture.root.join("boot/vmlinuz-6.9.3")).unwrap();

        let err = installer.install(&entry, "f00d").unwrap_err();
        assert!(matches!(err, Error::KernelCopy { .. }));
    }

    #[test]
    fn efi_entries_are_not_copied() {
        let fixture = fixture(&[]);
        let drive = Drive::new("/dev/sda1", &fixture.esp, true).with_uuid("8A1B-2C3D");
        let host = Host::new(false);
        let entry = EntryBuilder::new()
            .with_exec_path(vec!["/EFI/tool/tool.efi".into()])
            .build(&drive, &host)
            .unwrap();

        let installed = Installer::new(&host, &fixture.esp).install(&entry, "8A1B-2C3D").unwrap();
        assert_eq!(installed.loader, "/EFI/tool/tool.efi");
        assert_eq!(installed.initrd, None);
    }
}
