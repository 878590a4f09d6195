// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Gateway for every mutation and external command
//!
//! All filesystem writes, mounts and firmware edits flow through [`Host`].
//! In simulate mode each mutation is logged and skipped, returning the same
//! shape a real run would.

use std::{
    fmt, io,
    path::Path,
    process::Command,
};

use fs_err as fs;

use crate::file_utils::{self, Compression};

/// Captured result of an external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status, `-1` when killed by a signal
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Executes external programs
pub trait Runner: fmt::Debug {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;
}

/// Runs programs on the live system
#[derive(Debug, Default)]
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[derive(Debug)]
pub struct Host {
    runner: Box<dyn Runner>,
    simulate: bool,
}

impl Host {
    /// Host backed by the live system
    pub fn new(simulate: bool) -> Self {
        Self::with_runner(Box::new(SystemRunner), simulate)
    }

    /// Host with a custom command runner
    pub fn with_runner(runner: Box<dyn Runner>, simulate: bool) -> Self {
        Self { runner, simulate }
    }

    pub fn is_simulated(&self) -> bool {
        self.simulate
    }

    /// Run a read-only query. Queries run in simulate mode too.
    pub fn query(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        log::trace!("query: {program} {}", args.join(" "));
        self.runner.run(program, args)
    }

    /// Run a privileged, mutating helper such as `mount` or `efibootmgr`
    pub fn privileged(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        if self.simulate {
            log::info!("simulate: {program} {}", args.join(" "));
            return Ok(CommandOutput::default());
        }
        log::debug!("running: {program} {}", args.join(" "));
        self.runner.run(program, args)
    }

    pub fn create_dir_all(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let path = path.as_ref();
        if path.is_dir() {
            return Ok(());
        }
        if self.simulate {
            log::info!("simulate: create directory {}", path.display());
            return Ok(());
        }
        log::debug!("creating directory {}", path.display());
        fs::create_dir_all(path)
    }

    /// Atomically replace the contents of `path`
    pub fn write(&self, path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> io::Result<()> {
        let path = path.as_ref();
        if self.simulate {
            log::info!("simulate: write {}", path.display());
            log::trace!("contents: {}", String::from_utf8_lossy(contents.as_ref()));
            return Ok(());
        }
        log::debug!("writing {}", path.display());
        file_utils::write_atomic(path, contents)
    }

    /// Copy `source` to `dest` unless the content is already identical
    pub fn copy(&self, source: impl AsRef<Path>, dest: impl AsRef<Path>) -> io::Result<()> {
        let (source, dest) = (source.as_ref(), dest.as_ref());
        ensure_source(source)?;
        if file_utils::is_unchanged(source, dest) {
            log::debug!("{} is up to date", dest.display());
            return Ok(());
        }
        if self.simulate {
            log::info!("simulate: copy {} -> {}", source.display(), dest.display());
            return Ok(());
        }
        log::info!("copying {} -> {}", source.display(), dest.display());
        file_utils::copy_atomic_vfat(source, dest)
    }

    /// Copy `source` to `dest`, decompressing a compressed kernel payload
    pub fn copy_decompressed(&self, source: impl AsRef<Path>, dest: impl AsRef<Path>) -> io::Result<Compression> {
        let (source, dest) = (source.as_ref(), dest.as_ref());
        ensure_source(source)?;
        let compression = file_utils::detect_compression(source)?;
        if compression == Compression::None {
            self.copy(source, dest)?;
            return Ok(compression);
        }
        if file_utils::is_unchanged_payload(source, dest) {
            log::debug!("{} is up to date", dest.display());
            return Ok(compression);
        }
        if self.simulate {
            log::info!(
                "simulate: decompress ({compression:?}) {} -> {}",
                source.display(),
                dest.display()
            );
            return Ok(compression);
        }
        log::info!("decompressing ({compression:?}) {} -> {}", source.display(), dest.display());
        file_utils::decompress_atomic_vfat(source, dest)
    }

    pub fn remove_file(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let path = path.as_ref();
        if self.simulate {
            log::info!("simulate: remove {}", path.display());
            return Ok(());
        }
        log::info!("removing {}", path.display());
        fs::remove_file(path)
    }

    pub fn remove_dir_all(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let path = path.as_ref();
        if self.simulate {
            log::info!("simulate: remove tree {}", path.display());
            return Ok(());
        }
        log::info!("removing tree {}", path.display());
        fs::remove_dir_all(path)
    }
}

/// Copies check their source in both modes
fn ensure_source(source: &Path) -> io::Result<()> {
    if source.is_file() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no such file: {}", source.display()),
        ))
    }
}
