//! Witness CLI Module
//! Command-line interface for witness device operations

pub mod formatter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::engine::firmware::{Component, Version};

#[derive(Parser, Debug)]
#[command(name = "witness-cli")]
#[command(version)]
#[command(about = "Checkpoint storage and verified firmware updates for a witness device", long_about = None)]
pub struct Cli {
    /// Device directory holding witness.config.json (defaults to current directory)
    #[arg(short, long, global = true)]
    pub device: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a device directory with config, slot storage and install layout
    Init {
        /// Base URL of the firmware log
        #[arg(long)]
        log_url: String,

        /// Checkpoint origin of the firmware log
        #[arg(long)]
        origin: String,

        /// Note verifier key of the firmware log
        #[arg(long)]
        verifier_key: String,

        /// Number of storage slots, including the directory slot
        #[arg(long, default_value = "64")]
        num_slots: u32,
    },

    /// Run the periodic update loop and the status API until Ctrl-C
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
    },

    /// Scan the log once and install any newer firmware
    Update,

    /// Verify a firmware bundle against the configured log
    Verify {
        /// Bundle JSON file (checkpoint, index, inclusion_proof, manifest)
        bundle: PathBuf,

        /// Firmware image, if not embedded in the bundle
        #[arg(long)]
        firmware: Option<PathBuf>,
    },

    /// Emit a release manifest for a firmware image
    Manifest {
        /// Component (os or applet)
        #[arg(long)]
        component: Component,

        /// Release version (git tag)
        #[arg(long)]
        version: Version,

        /// Git commit the release was built from
        #[arg(long)]
        commit: String,

        /// TamaGo toolchain version used for the build
        #[arg(long)]
        tamago_version: Version,

        /// Firmware image to digest
        firmware: PathBuf,
    },

    /// Read or write stored checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// List the log ID to slot mapping
    Directory,

    /// Erase every slot of the partition
    Erase {
        /// Confirm erasing all stored checkpoints
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum CheckpointAction {
    /// Print the latest checkpoint of a log
    Get {
        /// Log identity
        log_id: String,
    },

    /// Store a checkpoint for a log
    Put {
        /// Log identity
        log_id: String,

        /// File holding the checkpoint
        file: PathBuf,
    },
}

impl Cli {
    pub fn get_device_dir(&self) -> PathBuf {
        self.device
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}
