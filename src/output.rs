use std::io::{self, Write};

use serde::Serialize;

use crate::app::{
    CheckResult, DatasetStatus, ExportResult, LoadResult, ProgressEvent, ProgressSink, UpdateResult,
};
use crate::fetch::DownloadAction;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_check(result: &CheckResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_update(result: &UpdateResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_load(result: &LoadResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_export(result: &ExportResult) -> io::Result<()> {
        Self::print_json(result)
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

/// Human-readable progress on stderr and summaries on stdout.
pub struct TextOutput;

impl TextOutput {
    pub fn print_check(result: &CheckResult) {
        for check in &result.sources {
            let current = if check.current.is_empty() {
                "none"
            } else {
                check.current.as_str()
            };
            match (&check.remote, &check.error) {
                (Some(remote), _) => {
                    let state = if check.up_to_date == Some(true) {
                        "up to date"
                    } else {
                        "update available"
                    };
                    println!("{}: {state} (local {current}, remote {remote})", check.source);
                }
                (None, Some(error)) => println!("{}: check failed: {error}", check.source),
                (None, None) => println!("{}: local {current}", check.source),
            }
        }
    }

    pub fn print_update(result: &UpdateResult) {
        for source in &result.sources {
            let downloaded = source
                .files
                .iter()
                .filter(|file| matches!(file.action, DownloadAction::Downloaded { .. }))
                .count();
            println!(
                "{}: revision {} ({downloaded} of {} files downloaded)",
                source.source,
                source.revision,
                source.files.len()
            );
            if let Some(error) = &source.error {
                println!("  error: {error}");
            }
        }
        Self::print_datasets(&result.datasets);
    }

    pub fn print_load(result: &LoadResult) {
        Self::print_datasets(&result.datasets);
    }

    pub fn print_export(result: &ExportResult) {
        println!("Wrote {} files.", result.written.len());
    }

    fn print_datasets(datasets: &[DatasetStatus]) {
        for status in datasets {
            match (&status.error, status.upto) {
                (Some(error), _) => println!("{}: unavailable ({error})", status.dataset),
                (None, Some(upto)) => println!("{}: data up to {upto}", status.dataset),
                (None, None) => println!("{}: no data", status.dataset),
            }
            for failure in &status.failures {
                println!("  skipped {failure}");
            }
        }
    }
}

impl ProgressSink for TextOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => eprintln!("{}", event.message),
        }
    }
}
