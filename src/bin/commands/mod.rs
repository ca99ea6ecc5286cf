pub mod baselines;
pub mod check;
pub mod config;
pub mod events;
pub mod run;

pub use baselines::handle_baselines_command;
pub use check::handle_check_command;
pub use config::handle_config_command;
pub use events::handle_events_command;
pub use run::handle_run_command;

use crate::error::{CliError, CliResult};
use clap::ArgMatches;
use log::debug;
use std::path::Path;
use std::sync::Arc;
use warden::Warden;
use warden::clock::SystemClock;
use warden::config::{WardenConfig, load_config_from_path};
use warden::governor::SysinfoProbe;
use warden::store::{FileStore, MemoryStore, MonitorStore};

/// Effective configuration: the `--config` file (or defaults) with environment
/// overrides applied.
pub fn load_config(matches: &ArgMatches) -> CliResult<WardenConfig> {
    let mut config = match matches.value_of("config") {
        Some(path) => load_config_from_path(Path::new(path))?,
        None => WardenConfig::default(),
    };
    config.apply_env_overrides();
    Ok(config)
}

pub fn open_store(matches: &ArgMatches) -> CliResult<Arc<dyn MonitorStore>> {
    match matches.value_of("store") {
        Some(dir) if dir.trim().is_empty() => Err(CliError::ParseError {
            field: "store".to_string(),
            message: "Store directory cannot be empty.".to_string(),
        }),
        Some(dir) => {
            debug!("Opening file store: dir={}", dir);
            Ok(Arc::new(FileStore::open(dir)?))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

pub fn build_warden(matches: &ArgMatches) -> CliResult<Warden> {
    let config = load_config(matches)?;
    let store = open_store(matches)?;
    Ok(Warden::new(
        config,
        store,
        Arc::new(SysinfoProbe::new()),
        Arc::new(SystemClock),
    )?)
}

pub fn parse_number<T: std::str::FromStr>(
    matches: &ArgMatches,
    field: &str,
    default: T,
) -> CliResult<T>
where
    T::Err: std::fmt::Display,
{
    match matches.value_of(field) {
        Some(raw) => raw.parse().map_err(|e| CliError::ParseError {
            field: field.to_string(),
            message: format!("Invalid value '{}': {}", raw, e),
        }),
        None => Ok(default),
    }
}
