use super::build_warden;
use crate::error::CliResult;
use clap::ArgMatches;

pub async fn handle_check_command(matches: &ArgMatches) -> CliResult<()> {
    let warden = build_warden(matches)?;
    let report = warden.health().run_check();
    println!("{}", serde_json::to_string_pretty(&report)?);
    if matches.is_present("status") {
        println!("{}", serde_json::to_string_pretty(&warden.status())?);
    }
    Ok(())
}
