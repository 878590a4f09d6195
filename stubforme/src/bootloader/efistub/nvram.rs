// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Firmware boot variables, managed through `efibootmgr`

use std::path::PathBuf;

use crate::{
    bootloader::{Error, NvramCreateSnafu, NvramDeleteSnafu, NvramQuerySnafu},
    host::{CommandOutput, Host},
};

const EFIBOOTMGR: &str = "efibootmgr";

/// One `BootXXXX` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootVariable {
    /// Four hex digits
    pub id: String,

    /// Marked with `*` in the listing
    pub active: bool,

    pub label: String,

    /// Device path text after the tab, empty when not listed
    pub device_path: String,
}

/// The boot variables listed by a single query, in firmware order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub variables: Vec<BootVariable>,
}

impl Snapshot {
    pub fn parse(listing: &str) -> Self {
        let variables = listing
            .lines()
            .filter_map(|line| {
                let id = line.get(4..8)?;
                if !line.starts_with("Boot") || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return None;
                }
                let rest = &line[8..];
                let active = rest.starts_with('*');
                let rest = rest.trim_start_matches('*').trim_start();
                let (label, device_path) = rest.split_once('\t').unwrap_or((rest, ""));
                Some(BootVariable {
                    id: id.to_string(),
                    active,
                    label: label.trim_end().to_string(),
                    device_path: device_path.trim().to_string(),
                })
            })
            .collect();
        Self { variables }
    }

    /// Variables labelled exactly `label`
    pub fn matching<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a BootVariable> + 'a {
        self.variables.iter().filter(move |v| v.label == label.trim_end())
    }
}

/// A boot variable to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVariable {
    pub disk: PathBuf,
    pub partition: u32,
    pub label: String,

    /// Firmware style loader path, `\EFI\...`
    pub loader: String,

    /// Kernel command line, linux entries only
    pub cmdline: Option<String>,
}

impl NewVariable {
    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-c".to_string(),
            "-d".to_string(),
            self.disk.to_string_lossy().into_owned(),
            "-p".to_string(),
            self.partition.to_string(),
            "-L".to_string(),
            self.label.clone(),
            "-l".to_string(),
            self.loader.clone(),
        ];
        if let Some(cmdline) = &self.cmdline {
            args.push("-u".to_string());
            args.push(cmdline.clone());
        }
        args
    }
}

/// Reconciles firmware boot variables against an entry
///
/// Listing variables is privileged too, so a simulated run sees an empty
/// firmware and never invokes `efibootmgr`.
#[derive(Debug)]
pub struct Nvram<'a> {
    host: &'a Host,
}

fn describe(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        format!("exit code {}", output.status)
    } else {
        format!("exit code {}: {stderr}", output.status)
    }
}

impl<'a> Nvram<'a> {
    pub fn new(host: &'a Host) -> Self {
        Self { host }
    }

    pub fn query(&self) -> Result<Snapshot, Error> {
        let output = self
            .host
            .privileged(EFIBOOTMGR, &[])
            .map_err(|e| NvramQuerySnafu { reason: e.to_string() }.build())?;
        if !output.success() {
            return NvramQuerySnafu {
                reason: describe(&output),
            }
            .fail();
        }
        Ok(Snapshot::parse(&output.stdout))
    }

    pub fn delete(&self, id: &str) -> Result<(), Error> {
        log::info!("deleting boot variable Boot{id}");
        let args = ["-B".to_string(), "-b".to_string(), id.to_string()];
        let output = self
            .host
            .privileged(EFIBOOTMGR, &args)
            .map_err(|e| NvramDeleteSnafu { id, reason: e.to_string() }.build())?;
        if !output.success() {
            return NvramDeleteSnafu {
                id,
                reason: describe(&output),
            }
            .fail();
        }
        Ok(())
    }

    /// Delete every variable mentioning `label`, re-reading the firmware after each
    pub fn delete_matching(&self, label: &str) -> Result<usize, Error> {
        let mut removed: Vec<String> = vec![];
        loop {
            let snapshot = self.query()?;
            let Some(variable) = snapshot.matching(label).next() else {
                break;
            };
            if removed.contains(&variable.id) {
                return NvramDeleteSnafu {
                    id: variable.id.as_str(),
                    reason: "variable is still present after deletion",
                }
                .fail();
            }
            self.delete(&variable.id)?;
            removed.push(variable.id.clone());
        }
        Ok(removed.len())
    }

    pub fn create(&self, variable: &NewVariable) -> Result<(), Error> {
        log::info!("creating boot variable {:?}", variable.label);
        let output = self
            .host
            .privileged(EFIBOOTMGR, &variable.args())
            .map_err(|e| {
                NvramCreateSnafu {
                    label: variable.label.as_str(),
                    reason: e.to_string(),
                }
                .build()
            })?;
        if !output.success() {
            return NvramCreateSnafu {
                label: variable.label.as_str(),
                reason: describe(&output),
            }
            .fail();
        }
        Ok(())
    }

    /// Replace all variables carrying the label with exactly one new one
    pub fn reconcile(&self, variable: &NewVariable) -> Result<Snapshot, Error> {
        let removed = self.delete_matching(&variable.label)?;
        log::debug!("removed {removed} stale boot variables for {:?}", variable.label);
        self.create(variable)?;
        let snapshot = self.query()?;
        log::info!(
            "firmware boot variables: {}",
            snapshot
                .variables
                .iter()
                .map(|v| format!("Boot{} {}", v.id, v.label))
                .collect::<Vec<_>>()
                .join("; ")
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, io, rc::Rc};

    use super::*;
    use crate::host::Runner;

    const LISTING: &str = "BootCurrent: 0002
Timeout: 1 seconds
BootOrder: 0002,0000,0001
Boot0000* Windows Boot Manager\tHD(1,GPT,...)/File(\\EFI\\Microsoft\\Boot\\bootmgfw.efi)
Boot0001* Pop!_OS 22.04\tHD(1,GPT,...)/File(\\EFI\\old\\vmlinuz.efi)
Boot0002* Pop!_OS 22.04\tHD(1,GPT,...)/File(\\EFI\\pop\\vmlinuz.efi)
";

    /// An in-memory firmware answering like `efibootmgr`
    #[derive(Debug, Default)]
    struct Firmware {
        variables: RefCell<Vec<(String, String)>>,
        calls: RefCell<Vec<Vec<String>>>,
    }

    impl Firmware {
        fn with(variables: &[(&str, &str)]) -> Rc<Self> {
            Rc::new(Self {
                variables: RefCell::new(variables.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()),
                calls: RefCell::default(),
            })
        }

        fn labels(&self) -> Vec<String> {
            self.variables.borrow().iter().map(|(_, l)| l.clone()).collect()
        }
    }

    impl Runner for Rc<Firmware> {
        fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
            assert_eq!(program, "efibootmgr");
            self.calls.borrow_mut().push(args.to_vec());
            let mut variables = self.variables.borrow_mut();
            match args.first().map(String::as_str) {
                Some("-B") => variables.retain(|(id, _)| id != &args[2]),
                Some("-c") => {
                    let label = args[args.iter().position(|a| a == "-L").unwrap() + 1].clone();
                    let next = variables.len() + 10;
                    variables.push((format!("{next:04X}"), label));
                }
                _ => {}
            }
            let stdout = variables
                .iter()
                .map(|(id, label)| format!("Boot{id}* {label}\tHD(1,GPT)\n"))
                .collect();
            Ok(CommandOutput {
                status: 0,
                stdout,
                stderr: String::new(),
            })
        }
    }

    fn pop() -> NewVariable {
        NewVariable {
            disk: "/dev/nvme0n1".into(),
            partition: 1,
            label: "Pop!_OS 22.04".into(),
            loader: "\\EFI\\pop-ab12\\vmlinuz.efi".into(),
            cmdline: Some("root=UUID=f00d ro initrd=\\EFI\\pop-ab12\\initrd.img quiet".into()),
        }
    }

    #[test]
    fn parses_listing() {
        let snapshot = Snapshot::parse(LISTING);
        let ids = snapshot.variables.iter().map(|v| v.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, ["0000", "0001", "0002"]);
        assert_eq!(snapshot.matching("Pop!_OS 22.04").count(), 2);
        assert!(snapshot.variables[0].active);
        assert_eq!(snapshot.variables[0].label, "Windows Boot Manager");
        assert!(snapshot.variables[0].device_path.starts_with("HD(1,GPT"));
    }

    #[test]
    fn labels_match_exactly() {
        let snapshot = Snapshot::parse(
            "Boot0000* Windows Boot Manager\tHD(1,GPT,...)/File(\\EFI\\Microsoft\\Boot\\bootmgfw.efi)
Boot0001  Windows\tHD(1,GPT,...)/File(\\EFI\\tool\\tool.efi)
Boot0002* Pop!_OS 22.04 Beta\tHD(1,GPT,...)
Boot0003* Pop!_OS 22.04
",
        );
        let ids = |label| snapshot.matching(label).map(|v| v.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids("Windows"), ["0001"]);
        assert_eq!(ids("Pop!_OS 22.04"), ["0003"]);
        assert!(ids("EFI").is_empty());
        assert!(!snapshot.variables[1].active);
    }

    #[test]
    fn delete_spares_look_alikes() {
        let firmware = Firmware::with(&[
            ("0000", "Windows Boot Manager"),
            ("0001", "Windows"),
            ("0002", "Pop!_OS 22.04 Beta"),
        ]);
        let host = Host::with_runner(Box::new(firmware.clone()), false);
        assert_eq!(Nvram::new(&host).delete_matching("Windows").unwrap(), 1);
        assert_eq!(firmware.labels(), ["Windows Boot Manager", "Pop!_OS 22.04 Beta"]);
    }

    #[test]
    fn reconcile_leaves_exactly_one() {
        let firmware = Firmware::with(&[
            ("0000", "Windows Boot Manager"),
            ("0001", "Pop!_OS 22.04"),
            ("0003", "Pop!_OS 22.04"),
        ]);
        let host = Host::with_runner(Box::new(firmware.clone()), false);

        let snapshot = Nvram::new(&host).reconcile(&pop()).unwrap();
        assert_eq!(snapshot.matching("Pop!_OS 22.04").count(), 1);
        assert_eq!(firmware.labels(), ["Windows Boot Manager", "Pop!_OS 22.04"]);

        let create = firmware
            .calls
            .borrow()
            .iter()
            .find(|c| c.first().map(String::as_str) == Some("-c"))
            .cloned()
            .unwrap();
        assert_eq!(
            create,
            [
                "-c",
                "-d",
                "/dev/nvme0n1",
                "-p",
                "1",
                "-L",
                "Pop!_OS 22.04",
                "-l",
                "\\EFI\\pop-ab12\\vmlinuz.efi",
                "-u",
                "root=UUID=f00d ro initrd=\\EFI\\pop-ab12\\initrd.img quiet",
            ]
        );
    }

    #[test]
    fn reconcile_is_idempotent() {
        let firmware = Firmware::with(&[]);
        let host = Host::with_runner(Box::new(firmware.clone()), false);
        let nvram = Nvram::new(&host);
        nvram.reconcile(&pop()).unwrap();
        nvram.reconcile(&pop()).unwrap();
        assert_eq!(firmware.labels(), ["Pop!_OS 22.04"]);
    }

    #[test]
    fn simulate_never_touches_firmware() {
        let firmware = Firmware::with(&[("0001", "Pop!_OS 22.04")]);
        let host = Host::with_runner(Box::new(firmware.clone()), true);
        let snapshot = Nvram::new(&host).reconcile(&pop()).unwrap();
        assert_eq!(snapshot, Snapshot::default());
        assert!(firmware.calls.borrow().is_empty());
    }

    #[derive(Debug)]
    struct Stubborn;

    impl Runner for Stubborn {
        fn run(&self, _program: &str, _args: &[String]) -> io::Result<CommandOutput> {
            Ok(CommandOutput {
                status: 0,
                stdout: "Boot0001* Pop!_OS 22.04\n".into(),
                stderr: String::new(),
            })
        }
    }

    #[test]
    fn undeletable_variable_is_an_error() {
        let host = Host::with_runner(Box::new(Stubborn), false);
        let err = Nvram::new(&host).delete_matching("Pop!_OS 22.04").unwrap_err();
        assert!(matches!(err, Error::NvramDelete { .. }));
    }

    #[test]
    fn failed_query() {
        #[derive(Debug)]
        struct NoEfi;
        impl Runner for NoEfi {
            fn run(&self, _: &str, _: &[String]) -> io::Result<CommandOutput> {
                Ok(CommandOutput {
                    status: 2,
                    stdout: String::new(),
                    stderr: "EFI variables are not supported on this system.".into(),
                })
            }
        }
        let host = Host::with_runner(Box::new(NoEfi), false);
        let err = Nvram::new(&host).query().unwrap_err();
        assert!(matches!(err, Error::NvramQuery { .. }));
    }
}
