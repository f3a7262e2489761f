use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::engine::libvirt::DEFAULT_URI;

/// Largest disk whose size in bytes still fits a `u64`.
pub const MAX_DISK_SIZE_GB: u64 = u64::MAX >> 30;

#[derive(Parser, Debug)]
#[command(name = "vmctl", about = "Install, boot and clone UEFI virtual machines")]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// libvirt connection URI
    #[arg(long, global = true, default_value = DEFAULT_URI)]
    pub connect: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a fresh bundle and install the guest OS into it
    Install {
        /// Path to the JSON config document
        #[arg(short, long)]
        config: PathBuf,

        /// Bundle directory to create
        #[arg(short, long)]
        bundle: PathBuf,

        /// Installer image: local path or http(s) URL
        #[arg(short, long)]
        restore_image: String,

        /// Size of the boot disk in GB
        #[arg(
            long,
            default_value_t = 50,
            value_parser = clap::value_parser!(u64).range(1..=MAX_DISK_SIZE_GB)
        )]
        disk_size_gb: u64,
    },

    /// Boot an installed bundle
    Start {
        /// Path to the JSON config document
        #[arg(short, long)]
        config: PathBuf,

        /// Bundle directory
        #[arg(short, long)]
        bundle: PathBuf,

        /// Key script to type into the guest once its display is up
        #[arg(short, long)]
        key_script: Option<PathBuf>,

        /// Boot into firmware recovery
        #[arg(long)]
        recovery: bool,
    },

    /// Copy a bundle, replacing the destination
    Clone {
        /// Source bundle
        src: PathBuf,

        /// Destination bundle
        dst: PathBuf,
    },

    /// Print the latest restore image for this host
    Ipsw,
}

impl Command {
    /// Bundle whose neighbouring log file captures this command's tracing.
    pub fn bundle(&self) -> Option<&PathBuf> {
        match self {
            Command::Install { bundle, .. } | Command::Start { bundle, .. } => Some(bundle),
            Command::Clone { .. } | Command::Ipsw => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn install_defaults_disk_size() {
        let cli = Cli::parse_from([
            "vmctl",
            "install",
            "--config",
            "vm.json",
            "--bundle",
            "vm",
            "--restore-image",
            "fedora.iso",
        ]);
        match cli.command {
            Command::Install { disk_size_gb, .. } => assert_eq!(disk_size_gb, 50),
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(cli.connect, DEFAULT_URI);
    }

    #[test]
    fn install_rejects_disk_sizes_out_of_range() {
        for size in ["0", "17179869184", "18446744073709551615"] {
            let parsed = Cli::try_parse_from([
                "vmctl",
                "install",
                "-c",
                "vm.json",
                "-b",
                "vm",
                "-r",
                "fedora.iso",
                "--disk-size-gb",
                size,
            ]);
            assert!(parsed.is_err(), "accepted --disk-size-gb {size}");
        }
    }

    #[test]
    fn install_accepts_largest_disk_size() {
        let max = MAX_DISK_SIZE_GB.to_string();
        let cli = Cli::parse_from([
            "vmctl", "install", "-c", "vm.json", "-b", "vm", "-r", "fedora.iso",
            "--disk-size-gb", &max,
        ]);
        match cli.command {
            Command::Install { disk_size_gb, .. } => {
                assert!(disk_size_gb.checked_mul(1 << 30).is_some());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn start_accepts_script_and_recovery() {
        let cli = Cli::parse_from([
            "vmctl", "start", "-c", "vm.json", "-b", "vm", "-k", "boot.json", "--recovery",
        ]);
        match cli.command {
            Command::Start {
                key_script,
                recovery,
                ..
            } => {
                assert_eq!(key_script, Some(PathBuf::from("boot.json")));
                assert!(recovery);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn clone_has_no_bundle_log() {
        let cli = Cli::parse_from(["vmctl", "clone", "a", "b"]);
        assert!(cli.command.bundle().is_none());
    }
}
