//! CLI command definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Converge - declarative reconciliation engine
#[derive(Parser, Debug)]
#[command(name = "converge")]
#[command(version)]
#[command(about = "Drive declared resources to their desired state")]
#[command(
    long_about = "Converge reads a manifest of resources, runs the reconciliation loop against an in-memory cluster until every resource converges or fails, and reports the result."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Reconcile every resource in a manifest
    Run {
        /// Manifest file path
        #[arg(short, long)]
        manifest: PathBuf,

        /// Give up after this many seconds
        #[arg(short, long, default_value_t = 30)]
        timeout_secs: u64,

        /// Print the final report as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Parse and validate a manifest without running it
    Validate {
        /// Manifest file path
        #[arg(short, long)]
        manifest: PathBuf,
    },
}
