use std::io::{self, Write};

use serde::Serialize;
use tracing::info;

use crate::pipeline::{ProgressEvent, ProgressSink};
use crate::publish::{GenerationInfo, PruneOutcome};
use crate::report::RunReport;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &RunReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_generations(generations: &[GenerationInfo]) -> io::Result<()> {
        Self::print_json(&generations)
    }

    pub fn print_prune(outcome: &PruneOutcome) -> io::Result<()> {
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
    fn event(&self, _event: ProgressEvent) {}
}

pub struct TextOutput;

impl TextOutput {
    pub fn print_report(report: &RunReport) -> io::Result<()> {
        let mut stdout = io::stdout();
        stdout.write_all(report.summary().as_bytes())
    }

    pub fn print_generations(generations: &[GenerationInfo]) -> io::Result<()> {
        let mut stdout = io::stdout();
        if generations.is_empty() {
            writeln!(stdout, "no generations")?;
        }
        for generation in generations {
            let marker = if generation.aliased { "*" } else { " " };
            writeln!(stdout, "{marker} {}  {}", generation.name, generation.timestamp)?;
        }
        Ok(())
    }

    pub fn print_prune(outcome: &PruneOutcome) -> io::Result<()> {
        let mut stdout = io::stdout();
        for name in &outcome.deleted {
            writeln!(stdout, "deleted {name}")?;
        }
        for name in &outcome.kept {
            writeln!(stdout, "kept    {name}")?;
        }
        for failure in &outcome.failures {
            writeln!(stdout, "failed  {failure}")?;
        }
        Ok(())
    }
}

/// Progress as log lines on stderr.
impl ProgressSink for TextOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}
