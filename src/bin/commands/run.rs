use super::{build_warden, parse_number};
use crate::error::CliResult;
use clap::ArgMatches;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use warden::Warden;

/// One scheduler tick: health check, retry report, retention cleanup.
fn tick(warden: &Warden) {
    match warden.scheduled_check() {
        Some(report) => info!(
            "Health: status={}, stuck={}, failed={}",
            report.status,
            report.stuck.len(),
            report.failed.len()
        ),
        None => warn!("Health check skipped"),
    }

    // Retries stay queued for the host that executes them.
    match warden.pending_retries() {
        Ok(pending) => {
            let now = warden.bus().now();
            for task in pending.iter().filter(|task| task.run_at <= now) {
                info!(
                    "Retry due: task={}, attempt={}, reason={}",
                    task.task_name, task.attempt, task.reason
                );
            }
        }
        Err(e) => error!("Failed to read pending retries: {}", e),
    }

    if let Err(e) = warden.cleanup() {
        error!("Cleanup failed: {}", e);
    }
}

pub async fn handle_run_command(matches: &ArgMatches) -> CliResult<()> {
    let warden = build_warden(matches)?;

    if matches.is_present("once") {
        tick(&warden);
        println!("{}", serde_json::to_string_pretty(&warden.status())?);
        return Ok(());
    }

    let interval_secs = parse_number(
        matches,
        "interval",
        warden.config().health.check_interval_secs,
    )?;
    let base = Duration::from_secs(interval_secs.max(1));

    let stop = Arc::new(Notify::new());
    let signal = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || signal.notify_one()) {
        warn!("Failed to install Ctrl-C handler: {}", e);
    }

    info!("Scheduler started: interval={}s", base.as_secs());
    loop {
        tick(&warden);
        let delay = warden.governor().scaled_delay(base);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.notified() => break,
        }
    }

    info!("Scheduler stopped: stats={:?}", warden.stats());
    Ok(())
}
