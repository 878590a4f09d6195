// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Discovery of installed kernels in a root's `/boot`

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use crate::version;

const KERNEL_PREFIXES: &[&str] = &["vmlinuz-", "vmlinux-"];
const INITRD_PREFIX: &str = "initrd.img-";

/// A kernel and its matching initrd, both as absolute paths inside the root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelPair {
    pub version: String,
    pub kernel: PathBuf,
    pub initrd: PathBuf,
}

fn matching(pattern: &Path) -> Vec<PathBuf> {
    let pattern = pattern.to_string_lossy();
    match glob::glob(&pattern) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(e) => {
            log::warn!("bad kernel search pattern {pattern}: {e}");
            vec![]
        }
    }
}

/// All complete kernel/initrd pairs under `<root>/boot`, newest first
pub fn discover(root: &Path) -> Vec<KernelPair> {
    let boot = root.join("boot");
    let escaped = PathBuf::from(glob::Pattern::escape(&boot.to_string_lossy()));

    let mut kernels = BTreeMap::new();
    for prefix in KERNEL_PREFIXES {
        for path in matching(&escaped.join(format!("{prefix}*"))) {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if let Some(version) = name.strip_prefix(prefix) {
                kernels.entry(version.to_string()).or_insert(name);
            }
        }
    }

    let mut pairs = kernels
        .into_iter()
        .filter_map(|(version, kernel)| {
            let initrd = format!("{INITRD_PREFIX}{version}");
            if !boot.join(&initrd).is_file() {
                log::debug!("kernel {version} has no initrd, ignoring");
                return None;
            }
            Some(KernelPair {
                kernel: Path::new("/boot").join(kernel),
                initrd: Path::new("/boot").join(initrd),
                version,
            })
        })
        .collect::<Vec<_>>();

    pairs.sort_by(|a, b| version::compare(&b.version, &a.version));
    pairs
}

/// The most recent kernel pair
pub fn newest(root: &Path) -> Option<KernelPair> {
    discover(root).into_iter().next()
}

/// The kernel pair installed before the newest one
pub fn previous(root: &Path) -> Option<KernelPair> {
    discover(root).into_iter().nth(1)
}

#[cfg(test)]
mod tests {
    use fs_err as fs;

    use super::*;

    fn boot_with(files: &[&str]) -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let boot = tmp.path().join("boot");
        fs::create_dir_all(&boot).unwrap();
        for file in files {
            fs::write(boot.join(file), file.as_bytes()).unwrap();
        }
        tmp
    }

    #[test]
    fn orders_by_version() {
        let tmp = boot_with(&[
            "vmlinuz-5.15.0-91-generic",
            "initrd.img-5.15.0-91-generic",
            "vmlinuz-5.15.0-101-generic",
            "initrd.img-5.15.0-101-generic",
            "vmlinuz-6.1.0-rc1",
            "initrd.img-6.1.0-rc1",
        ]);
        let versions = discover(tmp.path())
            .into_iter()
            .map(|p| p.version)
            .collect::<Vec<_>>();
        assert_eq!(versions, ["6.1.0-rc1", "5.15.0-101-generic", "5.15.0-91-generic"]);
    }

    #[test]
    fn newest_and_previous() {
        let tmp = boot_with(&[
            "vmlinuz-6.2.6-76060206-generic",
            "initrd.img-6.2.6-76060206-generic",
            "vmlinuz-6.9.3-76060903-generic",
            "initrd.img-6.9.3-76060903-generic",
        ]);
        let newest = newest(tmp.path()).unwrap();
        assert_eq!(newest.kernel, PathBuf::from("/boot/vmlinuz-6.9.3-76060903-generic"));
        assert_eq!(newest.initrd, PathBuf::from("/boot/initrd.img-6.9.3-76060903-generic"));
        assert_eq!(previous(tmp.path()).unwrap().version, "6.2.6-76060206-generic");
    }

    #[test]
    fn kernels_without_initrd_are_skipped() {
        let tmp = boot_with(&["vmlinuz-6.9.3", "vmlinuz-6.2.0", "initrd.img-6.2.0", "vmlinuz"]);
        let found = discover(tmp.path());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].version, "6.2.0");
        assert!(previous(tmp.path()).is_none());
    }

    #[test]
    fn empty_root() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(newest(tmp.path()).is_none());
    }
}
