// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! File helpers shared by the installer, the loader writer and the stores

use std::{
    io::{self, Read},
    path::{Path, PathBuf},
};

use fs_err as fs;

/// Literal replacements applied to anything that becomes a path segment
const REPLACEMENTS: &[(&str, &str)] = &[
    (" ", "_"),
    ("~", "-"),
    ("!", ""),
    ("'", ""),
    ("<", ""),
    (">", ""),
    (":", ""),
    ("\"", ""),
    ("/", ""),
    ("\\", ""),
    ("|", ""),
    ("?", ""),
    ("*", ""),
    ("(", ""),
    (")", ""),
];

/// Device names that FAT (and firmware shells) refuse as file names
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8", "COM9", "LPT1",
    "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Make a name safe for use as a single path segment on the ESP
///
/// Replacements are applied until nothing changes, so removing one reserved
/// name can never leave another one behind and `sanitize(sanitize(x)) == sanitize(x)`.
pub fn sanitize(name: &str) -> String {
    let mut current = name.to_string();
    loop {
        let mut next = REPLACEMENTS
            .iter()
            .fold(current.clone(), |acc, (from, to)| acc.replace(from, to));
        next = RESERVED_NAMES.iter().fold(next, |acc, reserved| acc.replace(reserved, ""));
        if next == current {
            return next;
        }
        current = next;
    }
}

/// Case-insensitive path joins, required for vfat
pub trait PathExt {
    /// Join `component`, reusing an existing entry that differs only in case
    fn join_insensitive(&self, component: impl AsRef<Path>) -> PathBuf;
}

impl PathExt for Path {
    fn join_insensitive(&self, component: impl AsRef<Path>) -> PathBuf {
        let component = component.as_ref();
        let wanted = component.to_string_lossy();

        if let Ok(entries) = std::fs::read_dir(self) {
            for entry in entries.filter_map(Result::ok) {
                let name = entry.file_name();
                if name.to_string_lossy().eq_ignore_ascii_case(&wanted) {
                    return self.join(name);
                }
            }
        }

        self.join(component)
    }
}

impl PathExt for PathBuf {
    fn join_insensitive(&self, component: impl AsRef<Path>) -> PathBuf {
        self.as_path().join_insensitive(component)
    }
}

/// Resolve an absolute path from a foreign root, i.e. `/boot/vmlinuz` under `/mnt`
pub fn under_root(root: &Path, path: &Path) -> PathBuf {
    root.join(path.strip_prefix("/").unwrap_or(path))
}

/// Compression of a kernel payload, detected by magic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Sniff the compression of the file at `path`
pub fn detect_compression(path: impl AsRef<Path>) -> io::Result<Compression> {
    let mut header = [0u8; 4];
    let mut file = fs::File::open(path.as_ref())?;
    let read = file.read(&mut header)?;
    let header = &header[..read];

    if header.starts_with(&ZSTD_MAGIC) {
        Ok(Compression::Zstd)
    } else if header.starts_with(&GZIP_MAGIC) {
        Ok(Compression::Gzip)
    } else {
        Ok(Compression::None)
    }
}

fn file_hash(path: &Path) -> io::Result<blake3::Hash> {
    let mut hasher = blake3::Hasher::new();
    hasher.update_mmap_rayon(path)?;
    Ok(hasher.finalize())
}

/// Stream the payload of `source` into `output`, decompressing it on the way
fn decode_into(source: &Path, compression: Compression, output: &mut impl io::Write) -> io::Result<()> {
    let mut input = fs::File::open(source)?;
    match compression {
        Compression::None => {
            io::copy(&mut input, output)?;
        }
        Compression::Gzip => {
            io::copy(&mut flate2::read::GzDecoder::new(input), output)?;
        }
        Compression::Zstd => zstd::stream::copy_decode(input, output)?,
    }
    Ok(())
}

/// Digest of the decompressed payload of `path`
fn payload_hash(path: &Path) -> io::Result<blake3::Hash> {
    let compression = detect_compression(path)?;
    if compression == Compression::None {
        return file_hash(path);
    }
    let mut hasher = blake3::Hasher::new();
    decode_into(path, compression, &mut hasher)?;
    Ok(hasher.finalize())
}

/// True when `dest` holds the decompressed payload of `source`
///
/// This is the check for kernels installed with [`decompress_atomic_vfat`].
pub fn is_unchanged_payload(source: impl AsRef<Path>, dest: impl AsRef<Path>) -> bool {
    let dest = dest.as_ref();
    if !dest.exists() {
        return false;
    }
    match (payload_hash(source.as_ref()), file_hash(dest)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// True when `dest` exists with the same content as `source`
pub fn is_unchanged(source: impl AsRef<Path>, dest: impl AsRef<Path>) -> bool {
    let dest = dest.as_ref();
    if !dest.exists() {
        return false;
    }
    match (file_hash(source.as_ref()), file_hash(dest)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Sibling path used to stage a write before renaming it into place
fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".new");
    dest.with_file_name(name)
}

fn commit_staged(staging: &Path, dest: &Path) -> io::Result<()> {
    let result = fs::File::open(staging)
        .and_then(|f| f.sync_all())
        .and_then(|_| fs::rename(staging, dest));
    if result.is_err() {
        let _ = fs::remove_file(staging);
    }
    result
}

/// Copy a file by staging it beside the target and renaming over it
pub fn copy_atomic_vfat(source: impl AsRef<Path>, dest: impl AsRef<Path>) -> io::Result<()> {
    let dest = dest.as_ref();
    let staging = staging_path(dest);
    if let Err(e) = fs::copy(source.as_ref(), &staging) {
        let _ = fs::remove_file(&staging);
        return Err(e);
    }
    commit_staged(&staging, dest)
}

/// Copy a kernel, decompressing gzip or zstd payloads on the way
pub fn decompress_atomic_vfat(source: impl AsRef<Path>, dest: impl AsRef<Path>) -> io::Result<Compression> {
    let (source, dest) = (source.as_ref(), dest.as_ref());
    let compression = detect_compression(source)?;
    if compression == Compression::None {
        copy_atomic_vfat(source, dest)?;
        return Ok(compression);
    }

    let staging = staging_path(dest);
    let result = fs::File::create(&staging).and_then(|mut output| decode_into(source, compression, &mut output));
    if let Err(e) = result {
        let _ = fs::remove_file(&staging);
        return Err(e);
    }

    commit_staged(&staging, dest)?;
    Ok(compression)
}

/// Write `contents` to `path` through a staging file
pub fn write_atomic(path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> io::Result<()> {
    let path = path.as_ref();
    let staging = staging_path(path);
    if let Err(e) = fs::write(&staging, contents) {
        let _ = fs::remove_file(&staging);
        return Err(e);
    }
    commit_staged(&staging, path)
}
