use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};

use crate::driver::SimConfig;
use crate::log_setup::LogConfig;
use crate::network::emulator::EmulatorConfig;
use crate::node::NodeConfig;

pub struct SystemConfig(
    pub NodeConfig,
    pub EmulatorConfig,
    pub SimConfig,
    pub LogConfig,
);

pub fn initialize_config() -> Result<SystemConfig> {
    let defaults = vec![
        ("log.level", "info"),
        ("membership.t_fail", "5"),
        ("membership.t_remove", "20"),
        ("membership.gossip_fanout", "3"),
        ("ring.size", "512"),
        ("storage.transaction_timeout", "10"),
        ("emulator.drop_rate", "0.0"),
        ("sim.node_count", "10"),
        ("sim.ticks", "300"),
        ("sim.seed", "42"),
    ];

    let env = Environment::default()
        .prefix("SWIMKV")
        .prefix_separator("__")
        .keep_prefix(false)
        .separator("__")
        .try_parsing(true);

    let mut builder = Config::builder();

    for (key, val) in defaults {
        builder = builder
            .set_default(key, val)
            .context("Failed to add default config")?;
    }

    builder = builder.add_source(File::new("swimkv-conf.yaml", FileFormat::Yaml).required(false));

    builder = builder.add_source(env);

    let config = builder
        .build()
        .context("Failed to initialize configuration")?;

    let membership = config
        .get("membership")
        .context("Invalid membership config")?;

    let ring = config.get("ring").context("Invalid ring config")?;

    let storage = config.get("storage").context("Invalid storage config")?;

    let emulator = config.get("emulator").context("Invalid emulator config")?;

    let sim = config.get("sim").context("Invalid sim config")?;

    let log = config.get("log").context("Invalid log config")?;

    Ok(SystemConfig(
        NodeConfig {
            membership,
            ring,
            storage,
        },
        emulator,
        sim,
        log,
    ))
}
