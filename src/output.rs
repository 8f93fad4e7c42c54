use std::io::{self, Write};

use serde::Serialize;

use crate::batch::{BatchReport, ItemStatus, ProgressEvent, ProgressSink};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &BatchReport) -> io::Result<()> {
        Self::print_json(report)
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
    fn event(&self, _event: ProgressEvent) {}
}

/// One line per finished item on stderr.
pub struct LineProgress;

impl ProgressSink for LineProgress {
    fn event(&self, event: ProgressEvent) {
        let mut stderr = io::stderr().lock();
        let _ = writeln!(
            stderr,
            "[{}/{}] {} {} ({:.1}s)",
            event.index + 1,
            event.total,
            event.key,
            event.status.as_str(),
            event.elapsed.as_secs_f64()
        );
    }
}

pub fn print_summary(report: &BatchReport) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("{cyan}taxon-enrich summary{reset}");
    println!(
        "{green}ok: {}{reset}  {red}failed: {}{reset}  {yellow}skipped: {}{reset}  total: {}",
        report.ok, report.failed, report.skipped, report.total
    );

    for item in &report.items {
        let color = match item.status {
            ItemStatus::Ok => green,
            ItemStatus::Failed => red,
            ItemStatus::Skipped => yellow,
        };
        match item.taxon_id {
            Some(id) => println!("{color}• {} (taxon {id}) {}{reset}", item.key, item.status.as_str()),
            None => println!("{color}• {} {}{reset}", item.key, item.status.as_str()),
        }
        for entry in &item.outcomes {
            let color = if entry.outcome.is_failed() { red } else { cyan };
            println!("{color}    {}: {}{reset}", entry.source, entry.outcome);
        }
        if let Some(error) = &item.error {
            println!("{red}    error: {error}{reset}");
        }
    }
}
