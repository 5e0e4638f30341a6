//! Command-line interface for tapnet
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// tapnet - TAP networking for unikernel sandboxes
#[derive(Parser)]
#[command(name = "tapnet")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path (defaults apply when omitted)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Create and wire a TAP device for a sandbox
    Setup {
        /// Addressing scheme: static or dynamic (overrides config)
        #[arg(short, long)]
        mode: Option<String>,

        /// Owner of the TAP device (defaults to the current user)
        #[arg(long)]
        uid: Option<u32>,

        /// Group of the TAP device (defaults to the current group)
        #[arg(long)]
        gid: Option<u32>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Tear down a sandbox's TAP device and its rules
    Cleanup {
        /// TAP device name (e.g., tap0_urunc)
        tap: String,

        /// Succeed when the device is already gone
        #[arg(long)]
        ignore_missing: bool,
    },

    /// Show the addressing of an interface
    Info {
        /// Interface name
        #[arg(default_value = "eth0")]
        iface: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Print the next free TAP index
    Index,

    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "tapnet", &mut std::io::stdout());
    }
}
