// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use log::LevelFilter;
use stubforme::{
    config::DEFAULT_CONFIG_DIR, disk::Builder, Backend, CreateRequest, EditRequest, Error, ExitStatus, Host,
    Manager, SystemChanges,
};

/// Manage boot entries for the Linux kernel EFI stub
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// More output, repeat for more detail
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Only report errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Configuration directory
    #[arg(short, long, default_value = DEFAULT_CONFIG_DIR)]
    config: PathBuf,

    /// Log what would change without changing anything
    #[arg(short, long)]
    simulate: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show or change system settings
    System {
        /// Seconds the boot menu waits
        #[arg(short, long)]
        menu_timeout: Option<u32>,

        /// Mount point of the EFI System Partition
        #[arg(short, long)]
        esp_path: Option<PathBuf>,

        /// `systemd-boot` or `efistub`
        #[arg(short, long)]
        backend: Option<Backend>,
    },

    /// Create and install a new entry
    Create {
        /// On-disk name of the entry
        #[arg(short = 'n', long)]
        entry_id: Option<String>,

        #[arg(short, long)]
        title: Option<String>,

        /// Device node of the entry's root filesystem
        #[arg(short = 'r', long)]
        root_partition: Option<PathBuf>,

        #[arg(short, long)]
        mount_point: Option<PathBuf>,

        /// Kernel or EFI loader, relative to the mount point
        #[arg(short, long)]
        exec: Option<PathBuf>,

        #[arg(short, long)]
        initrd: Option<PathBuf>,

        /// Kernel command line
        #[arg(short, long, allow_hyphen_values = true)]
        options: Option<String>,

        /// Short handle, at most 10 characters
        #[arg(short = 'x', long)]
        index: Option<String>,

        /// Make this the default entry
        #[arg(short = 's', long)]
        set_default: bool,
    },

    /// List entries, or show one in detail
    List { index: Option<String> },

    /// Reinstall one entry, or all of them
    Update { index: Option<String> },

    /// Change an existing entry
    Edit {
        index: String,

        #[arg(short, long)]
        title: Option<String>,

        #[arg(short = 'r', long)]
        root_partition: Option<PathBuf>,

        #[arg(short, long)]
        mount_point: Option<PathBuf>,

        #[arg(short, long)]
        exec: Option<PathBuf>,

        #[arg(short, long)]
        initrd: Option<PathBuf>,

        /// Replace the kernel command line
        #[arg(short, long, allow_hyphen_values = true)]
        options: Option<String>,

        /// Options to add
        #[arg(short, long, allow_hyphen_values = true)]
        add_options: Option<String>,

        /// Options to remove
        #[arg(short, long, allow_hyphen_values = true)]
        delete_options: Option<String>,

        #[arg(short = 's', long)]
        set_default: bool,
    },

    /// Remove an entry
    Delete {
        index: String,

        /// Keep the installed boot files
        #[arg(short, long)]
        retain: bool,
    },
}

fn exec_path(exec: Option<PathBuf>, initrd: Option<PathBuf>) -> Option<Vec<PathBuf>> {
    match (exec, initrd) {
        (Some(exec), Some(initrd)) => Some(vec![exec, initrd]),
        (Some(exec), None) => Some(vec![exec]),
        (None, Some(initrd)) => {
            log::warn!("ignoring initrd {} without a kernel", initrd.display());
            None
        }
        (None, None) => None,
    }
}

fn init_logging(cli: &Cli) {
    let level = match (cli.quiet, cli.verbose) {
        (true, _) => LevelFilter::Error,
        (false, 0) if cli.simulate => LevelFilter::Info,
        (false, 0) => LevelFilter::Warn,
        (false, 1) => LevelFilter::Info,
        (false, 2) => LevelFilter::Debug,
        (false, _) => LevelFilter::Trace,
    };

    let mut builder = pretty_env_logger::formatted_builder();
    builder.filter_level(level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

fn print_list(manager: &Manager) -> Result<(), Error> {
    let entries = manager.list()?;
    if entries.is_empty() {
        println!("No entries configured");
        return Ok(());
    }

    let width = entries.iter().map(|e| e.index.len()).max().unwrap_or(0).max(5);
    println!("{:<width$}  {:<5}  Title", "Index", "Type");
    for entry in entries {
        let marker = if entry.is_default { " (default)" } else { "" };
        println!("{:<width$}  {:<5}  {}{marker}", entry.index, entry.kind, entry.title);
    }
    Ok(())
}

fn print_entry(manager: &Manager, index: &str) -> Result<(), Error> {
    let rows = manager.show(index)?;
    let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    for (key, value) in rows {
        println!("{key:>width$}: {value}");
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), Error> {
    let probe = Builder::default().build()?;
    let mut manager = Manager::new(Host::new(cli.simulate), probe, &cli.config)?;

    match cli.command {
        None => {
            manager.update(None)?;
            print_list(&manager)?;
        }
        Some(Command::System {
            menu_timeout,
            esp_path,
            backend,
        }) => {
            if menu_timeout.is_some() || esp_path.is_some() || backend.is_some() {
                manager.system(SystemChanges {
                    menu_timeout,
                    esp_path,
                    backend,
                })?;
            }
            let config = manager.config();
            println!("ESP path:      {}", config.esp_path.display());
            println!("Backend:       {}", config.backend);
            println!("Menu timeout:  {}", config.menu_timeout);
            println!("Default entry: {}", config.default_entry.as_deref().unwrap_or("none"));
        }
        Some(Command::Create {
            entry_id,
            title,
            root_partition,
            mount_point,
            exec,
            initrd,
            options,
            index,
            set_default,
        }) => {
            let entry = manager.create(CreateRequest {
                index,
                entry_id,
                title,
                node: root_partition,
                mount_point,
                exec_path: exec_path(exec, initrd),
                options,
                make_default: set_default,
            })?;
            println!("Created entry {} ({})", entry.index(), entry.entry_id());
        }
        Some(Command::List { index: Some(index) }) => print_entry(&manager, &index)?,
        Some(Command::List { index: None }) => print_list(&manager)?,
        Some(Command::Update { index }) => {
            let count = manager.update(index.as_deref())?;
            log::info!("updated {count} entries");
        }
        Some(Command::Edit {
            index,
            title,
            root_partition,
            mount_point,
            exec,
            initrd,
            options,
            add_options,
            delete_options,
            set_default,
        }) => {
            manager.edit(
                &index,
                EditRequest {
                    title,
                    node: root_partition,
                    mount_point,
                    exec_path: exec_path(exec, initrd),
                    options,
                    add_options,
                    remove_options: delete_options,
                    make_default: set_default,
                },
            )?;
            print_entry(&manager, &index)?;
        }
        Some(Command::Delete { index, retain }) => manager.delete(&index, retain)?,
    }

    Ok(())
}

fn report(err: Error) -> ExitStatus {
    let status = err.exit_status();

    if let Error::Config { source } = &err {
        if let Some(path) = source.path() {
            log::error!(
                "check {} for mistakes, or delete it to regenerate the defaults",
                path.display()
            );
        }
    }
    if err.is_install_failure() {
        log::error!("the boot files on the ESP may be incomplete, do not reboot until this is fixed");
    }

    log::error!("{:?}", color_eyre::Report::new(err));
    status
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);
    if let Err(e) = color_eyre::install() {
        log::debug!("unable to install error reporting hooks: {e}");
    }

    if !cli.simulate && !nix::unistd::geteuid().is_root() {
        log::error!("stubctl must be run as root, or with --simulate");
        std::process::exit(ExitStatus::NotRoot.code());
    }

    let status = match run(cli) {
        Ok(()) => ExitStatus::Success,
        Err(err) => report(err),
    };
    std::process::exit(status.code());
}
