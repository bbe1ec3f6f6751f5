use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

use vhostd_api::constants::CONFIG_PATH;

#[derive(Parser, Debug)]
#[command(version, about = "Virtualization host agent")]
pub struct Cli {
    /// Logging verbosity [OFF, ERROR, WARN, INFO, DEBUG, TRACE]
    #[arg(global = true, short, long, default_value_t = LevelFilter::Info)]
    pub verbosity: LevelFilter,

    /// Agent configuration file
    #[arg(global = true, short, long, default_value = CONFIG_PATH)]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Reconcile host networks and bondings to a request file
    SetupNetworks {
        /// JSON file with the requested networks, bondings and options
        #[clap(index = 1)]
        request: PathBuf,
    },

    /// Probe kernel bonding option defaults and value tables and dump them
    /// as JSON artifacts
    DumpBondingOptions,

    /// Declare the current running network configuration safe
    StoreNetConfig,
}
