use super::open_store;
use crate::error::CliResult;
use clap::ArgMatches;
use warden::store::MonitorStore;

pub async fn handle_baselines_command(matches: &ArgMatches) -> CliResult<()> {
    let store = open_store(matches)?;
    let metric = matches.value_of("metric");

    let mut baselines = store.baselines()?;
    baselines.retain(|b| metric.is_none_or(|m| b.metric_name == m));
    baselines.sort_by(|a, b| a.key().cmp(&b.key()));

    if baselines.is_empty() {
        println!("No baselines recorded");
        return Ok(());
    }
    println!(
        "{:<24} {:<24} {:>14} {:>8}  {}",
        "METRIC", "CONTEXT", "VALUE", "SAMPLES", "UPDATED"
    );
    for baseline in baselines {
        println!(
            "{:<24} {:<24} {:>14.3} {:>8}  {}",
            baseline.metric_name,
            baseline.metric_context,
            baseline.value,
            baseline.sample_count,
            baseline.last_updated.to_rfc3339()
        );
    }
    Ok(())
}
