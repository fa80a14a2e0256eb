use env_logger::Builder;
use log::LevelFilter;
use serde::Deserialize;

/// Logging for a simulation run. The protocol layers get noisy at debug
/// level with any realistic cluster size, so each one can be tuned away
/// from the base level separately.
#[derive(Deserialize)]
pub struct LogConfig {
    pub level: LevelFilter,
    #[serde(default)]
    pub membership: Option<LevelFilter>,
    #[serde(default)]
    pub storage: Option<LevelFilter>,
    #[serde(default)]
    pub emulator: Option<LevelFilter>,
}

pub fn setup(config: LogConfig) {
    let mut builder = Builder::new();

    builder.filter_level(config.level);

    let subsystems = [
        ("swimkv::network::membership", config.membership),
        ("swimkv::storage", config.storage),
        ("swimkv::network::emulator", config.emulator),
    ];
    for (module, level) in subsystems {
        if let Some(level) = level {
            builder.filter(Some(module), level);
        }
    }

    builder.init();
}
