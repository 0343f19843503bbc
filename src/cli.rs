use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "autorun",
    about = "Launch an interactive application, run its in-app test suite, and report PASS/FAIL",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Use this config file instead of searching for .autorun/config.toml
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Launch the application, trigger its tests and write the verdict
    Run {
        /// Do not inject any keys (log-only input backend)
        #[arg(long)]
        no_input: bool,

        /// Override the test completion timeout, in seconds
        #[arg(long, value_name = "SECS")]
        completion_timeout: Option<u64>,
    },

    /// Show the effective configuration
    Config {
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Read the last verdict; exits 0 on PASS, 1 otherwise
    Verdict,
}
