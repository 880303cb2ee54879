//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{RunCommand, StatusCommand, ValidateCommand};
use std::ffi::OsString;

/// Workflow orchestration for payroll batch files
#[derive(Debug, Parser, Clone)]
#[command(name = "payflow")]
#[command(version)]
#[command(about = "Workflow orchestration for payroll batch files", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run or resume a batch
    Run(RunCommand),

    /// Validate pipeline definitions
    Validate(ValidateCommand),

    /// Show batch state
    Status(StatusCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
