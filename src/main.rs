use std::fs;
use std::process::ExitCode;

use anyhow::{Context, Error};
use clap::Parser;
use log::error;

use vhostd::cli::{Cli, Commands};
use vhostd::net::{bond_options, running_config, setup};
use vhostd_api::config::AgentConfig;
use vhostd_api::constants::{CONF_DIR, CONF_SAFE_DIR};
use vhostd_api::error::NetError;
use vhostd_api::request::SetupRequest;

fn main() -> ExitCode {
    let cli = Cli::parse();
    vhostd::logging::init(cli.verbosity);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            match e.downcast_ref::<NetError>() {
                Some(net) => ExitCode::from(net.code().code() as u8),
                None => ExitCode::FAILURE,
            }
        }
    }
}

fn run(cli: &Cli) -> Result<(), Error> {
    let config = AgentConfig::load(&cli.config)?;

    match &cli.command {
        Commands::SetupNetworks { request } => {
            let content = fs::read_to_string(request)
                .with_context(|| format!("Failed to read request file {}", request.display()))?;
            let request: SetupRequest =
                serde_json::from_str(&content).context("Failed to parse setup request")?;
            setup::setup_networks(request, &config)
        }
        Commands::DumpBondingOptions => bond_options::dump_bonding_options(),
        Commands::StoreNetConfig => {
            let mode = running_config::PersistenceMode::from_key(&config.net_persistence);
            let running = running_config::RunningConfig::load(CONF_DIR, mode)?;
            running.save_to(std::path::Path::new(CONF_SAFE_DIR))
        }
    }
}
