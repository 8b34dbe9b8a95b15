use std::path::PathBuf;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct CLI {
    /// Base directory entry points are delivered to (defaults to the
    /// directory holding this executable)
    #[clap(long, global = true)]
    pub base: Option<PathBuf>,
    /// Config file starting the configuration chain
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,
    /// Index to query for latest versions
    #[clap(long, global = true)]
    pub index: Option<String>,
    /// Delivery method: symlink, wrap or copy
    #[clap(long, global = true)]
    pub delivery: Option<String>,
    /// Python interpreter used to build virtual environments
    #[clap(long, global = true)]
    pub python: Option<String>,
    /// Report what would be done without doing any of it
    #[clap(long, global = true)]
    pub dry_run: bool,
    #[command(subcommand)]
    pub(crate) command: PipkinCommand,
}

#[derive(Debug, Subcommand, Clone, PartialEq)]
pub enum PipkinCommand {
    /// Install packages. Accepts `name`, `name==version`, a local project
    /// folder, a VCS url, or `bundle:<name>`
    Install {
        #[clap(required = true)]
        packages: Vec<String>,
        /// Reinstall even when already up-to-date
        #[clap(long)]
        force: bool,
    },
    /// Upgrade already-installed packages to their desired version
    Upgrade {
        #[clap(required = true)]
        packages: Vec<String>,
        #[clap(long)]
        force: bool,
    },
    /// Remove packages installed by pipkin, entry points included
    Uninstall {
        #[clap(required = true)]
        packages: Vec<String>,
    },
    /// Report installed vs desired versions. Defaults to all installed
    Check {
        packages: Vec<String>,
    },
    /// List everything currently installed by pipkin
    List,
    /// Background upgrade check, spawned by generated wrappers
    #[clap(hide = true)]
    AutoUpgrade {
        package: String,
    },
}
