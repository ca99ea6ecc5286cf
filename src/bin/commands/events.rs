use super::{open_store, parse_number};
use crate::error::CliResult;
use clap::ArgMatches;
use warden::event::EventType;
use warden::store::{EventQuery, MonitorStore};

pub async fn handle_events_command(matches: &ArgMatches) -> CliResult<()> {
    let store = open_store(matches)?;

    let limit = parse_number(matches, "limit", 20usize)?;
    let offset = parse_number(matches, "offset", 0usize)?;
    let mut query = EventQuery::new().page(limit, offset);
    if let Some(event_type) = matches.value_of("type") {
        query = query.with_type(EventType::parse(event_type));
    }
    if let Some(source) = matches.value_of("source") {
        query = query.with_source(source);
    }

    if matches.is_present("counts") {
        let mut counts: Vec<_> = store.event_counts(None)?.into_iter().collect();
        counts.sort();
        for (event_type, count) in counts {
            println!("{:<12} {}", event_type, count);
        }
        return Ok(());
    }

    for event in store.get_events(&query)? {
        println!("{}", serde_json::to_string(&event.to_value())?);
    }
    Ok(())
}
