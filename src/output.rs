use std::io::{self, Write};

use serde::Serialize;
use tracing::info;

use crate::app::{PopulateResult, ProgressEvent, ProgressSink, UpdateResult};
use crate::crawler::CrawlSummary;
use crate::road_reference::RouteKeyOutcome;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_catalog(summary: &CrawlSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_populate(results: &[PopulateResult]) -> io::Result<()> {
        Self::print_json(&results)
    }

    pub fn print_update(results: &[UpdateResult]) -> io::Result<()> {
        Self::print_json(&results)
    }

    pub fn print_route_keys(outcome: &RouteKeyOutcome) -> io::Result<()> {
        Self::print_json(outcome)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}
