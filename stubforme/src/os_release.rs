// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! `os-release` and hostname lookups for an OS root

use std::path::Path;

use fs_err as fs;

/// Identity of the operating system installed in a root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsInfo {
    /// `NAME=`
    pub name: String,

    /// `PRETTY_NAME=`, falls back to `name`
    pub pretty_name: String,

    /// `VERSION_ID=`
    pub version: String,

    pub hostname: String,
}

impl Default for OsInfo {
    fn default() -> Self {
        Self {
            name: "Linux".into(),
            pretty_name: "Linux".into(),
            version: "1.0".into(),
            hostname: "localhost".into(),
        }
    }
}

impl OsInfo {
    /// Load identity for the OS mounted at `root`
    ///
    /// Missing files are not an error: the OS gets the generic `Linux 1.0` identity.
    pub fn from_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let mut info = ["etc/os-release", "usr/lib/os-release"]
            .iter()
            .find_map(|candidate| fs::read_to_string(root.join(candidate)).ok())
            .map(|contents| Self::parse(&contents))
            .unwrap_or_else(|| {
                log::debug!("no os-release under {}, using defaults", root.display());
                Self::default()
            });
        info.hostname = hostname(root);
        info
    }

    /// Parse `KEY=value` os-release text
    pub fn parse(contents: &str) -> Self {
        let mut info = Self::default();
        let mut pretty = None;

        for line in contents.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = strip_quotes(value.trim()).to_string();
            match key.trim() {
                "NAME" => info.name = value,
                "PRETTY_NAME" => pretty = Some(value),
                "VERSION_ID" => info.version = value,
                _ => {}
            }
        }

        info.pretty_name = pretty.unwrap_or_else(|| info.name.clone());
        info
    }

    /// Firmware boot variable label, `"<name> <version>"`
    pub fn label(&self) -> String {
        format!("{} {}", self.name, self.version)
    }

    /// Boot menu title, `"<name> <version> (<hostname>)"`
    pub fn default_title(&self) -> String {
        format!("{} {} ({})", self.name, self.version, self.hostname)
    }
}

fn strip_quotes(value: &str) -> &str {
    let value = value.strip_prefix(['"', '\'']).unwrap_or(value);
    value.strip_suffix(['"', '\'']).unwrap_or(value)
}

/// The running hostname for `/`, `etc/hostname` for any other root
fn hostname(root: &Path) -> String {
    if root == Path::new("/") {
        if let Ok(name) = nix::unistd::gethostname() {
            return name.to_string_lossy().into_owned();
        }
    }
    fs::read_to_string(root.join("etc").join("hostname"))
        .ok()
        .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".into())
}
