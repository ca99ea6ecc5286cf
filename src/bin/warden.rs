use clap::{Arg, Command};
use log::LevelFilter;
use simplelog::{Config, WriteLogger};
use std::error::Error;

mod commands;
mod error;

use commands::*;
use error::CliError;

fn init_logging(level: &str) {
    let level = level.parse().unwrap_or(LevelFilter::Info);
    if WriteLogger::init(level, Config::default(), std::io::stderr()).is_err() {
        eprintln!("Logger already initialised");
    }
}

fn cli() -> Command<'static> {
    Command::new("warden")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Self-monitoring and resource governance for background tasks")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (.toml or .json)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::new("store")
                .short('s')
                .long("store")
                .value_name("DIR")
                .help("Directory of the file-backed store. Defaults to an in-memory store")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Overrides the configured log level")
                .takes_value(true)
                .global(true),
        )
        .subcommand(
            Command::new("run")
                .about("Run the scheduler loop: health checks, retries and cleanup")
                .arg(
                    Arg::new("once")
                        .long("once")
                        .help("Run a single tick and print the status"),
                )
                .arg(
                    Arg::new("interval")
                        .short('i')
                        .long("interval")
                        .value_name("SECONDS")
                        .help("Seconds between ticks before load scaling")
                        .takes_value(true),
                ),
        )
        .subcommand(
            Command::new("check")
                .about("Run one health check and print the report")
                .arg(
                    Arg::new("status")
                        .long("status")
                        .help("Also print the status of every component"),
                ),
        )
        .subcommand(
            Command::new("events")
                .about("List stored events, newest first")
                .arg(
                    Arg::new("type")
                        .short('t')
                        .long("type")
                        .value_name("TYPE")
                        .help("Only events of this type")
                        .takes_value(true),
                )
                .arg(
                    Arg::new("source")
                        .long("source")
                        .value_name("SOURCE")
                        .help("Only events from this source")
                        .takes_value(true),
                )
                .arg(
                    Arg::new("limit")
                        .short('l')
                        .long("limit")
                        .value_name("N")
                        .help("Maximum number of events (default 20)")
                        .takes_value(true),
                )
                .arg(
                    Arg::new("offset")
                        .long("offset")
                        .value_name("N")
                        .help("Number of events to skip")
                        .takes_value(true),
                )
                .arg(
                    Arg::new("counts")
                        .long("counts")
                        .help("Print per-type counts instead of events"),
                ),
        )
        .subcommand(
            Command::new("baselines")
                .about("List recorded metric baselines")
                .arg(
                    Arg::new("metric")
                        .short('m')
                        .long("metric")
                        .value_name("METRIC")
                        .help("Only baselines of this metric")
                        .takes_value(true),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Print the effective configuration")
                .arg(Arg::new("json").long("json").help("Print as JSON instead of TOML"))
                .arg(
                    Arg::new("validate")
                        .long("validate")
                        .help("Only validate the configuration"),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let matches = cli().get_matches();

    let level = match matches.value_of("log-level") {
        Some(level) => level.to_string(),
        None => commands::load_config(&matches)
            .map(|config| config.logging.level)
            .unwrap_or_else(|_| "info".to_string()),
    };
    init_logging(&level);

    let result = match matches.subcommand() {
        Some(("run", sub_matches)) => handle_run_command(sub_matches).await,
        Some(("check", sub_matches)) => handle_check_command(sub_matches).await,
        Some(("events", sub_matches)) => handle_events_command(sub_matches).await,
        Some(("baselines", sub_matches)) => handle_baselines_command(sub_matches).await,
        Some(("config", sub_matches)) => handle_config_command(sub_matches).await,
        Some((cmd, _)) => Err(CliError::UnknownCommand(cmd.to_string())),
        None => Err(CliError::NoCommand),
    };

    if let Err(err) = result {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        cli().debug_assert();
    }

    #[test]
    fn test_global_options_reach_subcommands() {
        let matches = cli().get_matches_from(vec![
            "warden", "events", "--store", "/tmp/w", "--limit", "5",
        ]);
        let Some(("events", sub)) = matches.subcommand() else {
            panic!("events subcommand expected");
        };
        assert_eq!(sub.value_of("store"), Some("/tmp/w"));
        assert_eq!(commands::parse_number(sub, "limit", 20usize).unwrap(), 5);
    }
}
