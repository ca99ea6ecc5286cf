use super::load_config;
use crate::error::{CliError, CliResult};
use clap::ArgMatches;

pub async fn handle_config_command(matches: &ArgMatches) -> CliResult<()> {
    let config = load_config(matches)?;

    if matches.is_present("validate") {
        return match config.validate() {
            Ok(()) => {
                println!("Configuration is valid");
                Ok(())
            }
            Err(problems) => Err(CliError::ParseError {
                field: "config".to_string(),
                message: problems.join("; "),
            }),
        };
    }

    if matches.is_present("json") {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        let rendered = toml::to_string_pretty(&config).map_err(|e| CliError::ParseError {
            field: "config".to_string(),
            message: e.to_string(),
        })?;
        println!("{}", rendered);
    }
    Ok(())
}
