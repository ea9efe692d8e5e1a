//! Command-line interface for weft
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// weft - container network fabric plumbing
#[derive(Parser)]
#[command(name = "weft")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path (defaults to /etc/weft/weft.toml when present)
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
    /// Create the fabric bridge (no-op if it exists)
    CreateBridge,

    /// Delete the fabric bridge
    DestroyBridge,

    /// Masquerade traffic leaving or entering the fabric subnet
    SetupMasquerading {
        /// Fabric subnet in CIDR form, e.g. 10.32.0.0/12
        subnet: String,
    },

    /// Remove the masquerade chain
    StopMasquerading,

    /// Attach a container to the fabric with an address
    Attach {
        /// Address in CIDR form, e.g. 10.32.0.1/12
        cidr: String,

        /// Container reference known to the orchestrator
        container: String,

        /// In-container device whose tx offload is disabled
        #[arg(long)]
        offload_device: Option<String>,
    },

    /// Remove an address from a container, and its interface with the last one
    Detach {
        /// Address in CIDR form
        cidr: String,

        /// Container reference known to the orchestrator
        container: String,
    },

    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "weft", &mut std::io::stdout());
    }
}
