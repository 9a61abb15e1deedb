//! # Bassline CLI Module
//!
//! ## Available Commands
//!
//! - `server` - Serve the kernel to remote bridges
//! - `exec` - Execute command envelopes, locally or against a peer
//! - `export` - Export a group as a template
//! - `import` - Instantiate a template
//! - `primitives` - List registered primitive gadgets
//! - `status` - Show kernel status
//! - `init` - Write a default `bassline.toml`

mod commands;

use bassline::AppConfig;
use bassline::AppError;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Bassline - propagation network kernel
///
/// Contacts hold values, wires carry them, gadgets compute.
#[derive(Parser, Debug)]
#[command(name = "bassline")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the configuration file (default: ./bassline.toml if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the peer server
    Server {
        /// Host to bind to (overrides the config file)
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Execute command envelopes (one JSON object or an array of them)
    Exec {
        /// Inline JSON
        #[arg(conflicts_with = "file")]
        command: Option<String>,

        /// Read the JSON from a file
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Peer server URL; the local kernel is used when absent
        #[arg(short, long)]
        remote: Option<String>,
    },

    /// Export a group as a template
    Export {
        /// Group ID
        #[arg(short, long)]
        group: u64,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Export format (json, binary)
        #[arg(short = 't', long, default_value = "json")]
        format: String,
    },

    /// Instantiate a template (JSON or binary)
    Import {
        /// Input file path
        #[arg(short, long)]
        input: PathBuf,

        /// Parent group ID; a new root group when absent
        #[arg(short, long)]
        parent: Option<u64>,
    },

    /// List registered primitive gadgets
    Primitives,

    /// Show kernel status
    Status,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), AppError> {
    let json_mode = cli.json_mode;

    // `init` must work before any config file exists.
    if let Some(Commands::Init { force }) = cli.command {
        return cmd_init(cli.config.as_deref(), force);
    }

    let config = AppConfig::load(cli.config.as_deref())?;
    if cli.verbose {
        tracing::info!(?config, "effective configuration");
    }

    match cli.command {
        Some(Commands::Server { host, port }) => cmd_server(config, host, port).await,
        Some(Commands::Exec {
            command,
            file,
            remote,
        }) => cmd_exec(&config, json_mode, command, file, remote).await,
        Some(Commands::Export {
            group,
            output,
            format,
        }) => cmd_export(&config, group, &output, &format),
        Some(Commands::Import { input, parent }) => cmd_import(&config, json_mode, &input, parent),
        Some(Commands::Primitives) => cmd_primitives(&config, json_mode),
        Some(Commands::Init { .. }) | Some(Commands::Status) | None => {
            cmd_status(&config, json_mode)
        }
    }
}
