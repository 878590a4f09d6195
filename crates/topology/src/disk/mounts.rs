// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Mount table (`/proc/self/mounts`) parsing

use std::{io, path::Path};

use fs_err as fs;

/// A single line of the mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Source device, i.e. `/dev/nvme0n1p2`
    pub device: String,

    /// Absolute mountpoint
    pub mountpoint: String,

    /// Filesystem type
    pub fstype: String,

    /// Comma separated mount options
    pub options: String,
}

/// Snapshot of the mount table
#[derive(Debug, Default, Clone)]
pub struct Table {
    mounts: Vec<Mount>,
}

impl Table {
    /// Read a table from `/proc/self/mounts` or a compatible file
    pub fn new_from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        Ok(Self::parse(&contents))
    }

    /// Parse mount table text. Malformed lines are skipped.
    pub fn parse(contents: &str) -> Self {
        let mounts = contents
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let device = unescape(fields.next()?);
                let mountpoint = unescape(fields.next()?);
                let fstype = fields.next()?.to_string();
                let options = fields.next().unwrap_or_default().to_string();
                Some(Mount {
                    device,
                    mountpoint,
                    fstype,
                    options,
                })
            })
            .collect();
        Self { mounts }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mount> {
        self.mounts.iter()
    }

    /// Exact mountpoint match. Later lines shadow earlier ones, as the kernel does.
    pub fn find_by_mountpoint(&self, mountpoint: &str) -> Option<&Mount> {
        self.mounts.iter().rev().find(|m| m.mountpoint == mountpoint)
    }

    /// First mount of the given device node
    pub fn find_by_device(&self, device: &str) -> Option<&Mount> {
        self.mounts.iter().find(|m| m.device == device)
    }
}

/// Decode the octal escapes (`\040` etc) the kernel uses for whitespace
fn unescape(field: &str) -> String {
    if !field.contains('\\') {
        return field.to_string();
    }

    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = bytes.get(i + 1..i + 4).filter(|d| d.iter().all(|b| (b'0'..=b'7').contains(b)));
        if let (b'\\', Some(digits)) = (bytes[i], octal) {
            let value = digits.iter().fold(0u16, |acc, d| acc * 8 + u16::from(d - b'0'));
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
