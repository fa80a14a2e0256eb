mod config;
mod log_setup;

pub mod driver;
pub mod events;
pub mod network;
pub mod node;
pub mod ring;
pub mod storage;

use anyhow::Result;
use log::info;

pub fn run() -> Result<()> {
    let config::SystemConfig(node_config, emulator_config, sim_config, log_config) =
        config::initialize_config()?;

    log_setup::setup(log_config);

    info!("Initializing swimkv...");

    driver::run_scenario(node_config, emulator_config, sim_config)?;

    info!("Goodbye!");

    Ok(())
}
