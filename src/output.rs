use std::io::{self, Write};

use serde::Serialize;

use crate::dispatcher::RunOutcome;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_outcome(outcome: &RunOutcome) -> io::Result<()> {
        Self::print_json(outcome)
    }

    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub struct SummaryOutput;

impl SummaryOutput {
    pub fn print_outcome(outcome: &RunOutcome) -> io::Result<()> {
        let mut out = io::stdout().lock();
        match outcome {
            RunOutcome::NothingToDo => writeln!(out, "Nothing to register."),
            RunOutcome::Declined => writeln!(out, "Registration declined."),
            RunOutcome::TestRun { summary, entries } => {
                writeln!(
                    out,
                    "Test run: {} directories, {} files, {} bytes from {} into {}",
                    summary.directories,
                    summary.files,
                    summary.total_bytes,
                    summary.source.display(),
                    summary.destination
                )?;
                for entry in entries {
                    let marker = if entry.is_directory { "d" } else { "f" };
                    writeln!(out, "  {marker} {} ({} bytes)", entry.relative_path, entry.size_bytes)?;
                }
                Ok(())
            }
            RunOutcome::Completed {
                report,
                logs,
                cancelled,
            } => {
                writeln!(
                    out,
                    "Registered {} of {} items: {} failed, {} skipped{}",
                    report.success,
                    report.total,
                    report.error,
                    report.skipped,
                    if *cancelled { " (cancelled)" } else { "" }
                )?;
                if let Some(rate) = report.throughput_bytes_per_sec {
                    writeln!(
                        out,
                        "Transferred {} bytes in {:.1}s ({:.0} bytes/s)",
                        report.bytes_attempted, report.elapsed_seconds, rate
                    )?;
                }
                if let Some(path) = &logs.error_log {
                    writeln!(out, "Error log: {}", path.display())?;
                }
                if let Some(path) = &logs.failed_records {
                    writeln!(out, "Failed items (replay with --file-list): {}", path.display())?;
                }
                Ok(())
            }
        }
    }
}
