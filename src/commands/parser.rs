//! Command-line arguments
//!
//! The role stays a bare positional argument (`taskmem 1`) because copies are
//! launched that way; everything else is an optional override of [`Settings`].

use crate::config::Settings;
use crate::roles::Role;
use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;

/// taskmem - shared counter coordinated across processes through shared memory
#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "taskmem",
    about = "Shared-memory counter with leader election and copy processes",
    version
)]
pub struct Cli {
    /// Role to run: none or 0 = main, 1 = copy 1, 2 = copy 2
    #[arg(value_name = "ROLE")]
    pub role: Option<String>,

    /// Configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Logical shared segment name
    #[arg(long, value_name = "NAME")]
    pub segment: Option<String>,

    /// Shared task log file
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Diagnostic log filter (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Also write diagnostic logs to this file
    #[arg(long, value_name = "FILE")]
    pub diag_log: Option<PathBuf>,

    /// Do not launch copy processes from this main process
    #[arg(long)]
    pub no_spawn: bool,
}

impl Cli {
    /// Parses `std::env::args_os`, exiting on errors.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Parses a custom argv (used by tests)
    pub fn try_parse_args_from<I, T>(iter: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Self::try_parse_from(iter)
    }

    pub fn role(&self) -> Role {
        Role::from_arg(self.role.as_deref())
    }

    /// Applies command-line overrides on top of loaded settings.
    pub fn apply(&self, mut settings: Settings) -> Settings {
        if let Some(segment) = &self.segment {
            settings.segment_name = segment.clone();
        }
        if let Some(log_file) = &self.log_file {
            settings.log_file = log_file.clone();
        }
        if let Some(level) = &self.log_level {
            settings.log_level = Some(level.clone());
        }
        if let Some(path) = &self.diag_log {
            settings.diag_log = Some(path.clone());
        }
        if self.no_spawn {
            settings.spawn_copies = false;
        }
        settings
    }
}
