use std::io::{self, Write};

use serde::Serialize;

use crate::app::{ProgressEvent, ProgressSink};
use crate::domain::DatasetStatus;
use crate::summary::RunSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

/// Prints the run summary; progress events are dropped since tracing
/// already reports every stage on stderr.
pub struct JsonOutput;

impl JsonOutput {
    pub fn print_summary(summary: &RunSummary) -> io::Result<()> {
        Self::print_json(summary)
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

/// One line per status, as shown after an interactive run.
pub fn status_lines(summary: &RunSummary) -> Vec<String> {
    DatasetStatus::ALL
        .iter()
        .map(|status| {
            format!(
                "{} {:<10} {}",
                status.icon(),
                status.to_string(),
                summary.counts.get(*status)
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::summary::{LifecycleReport, StageResults};

    #[test]
    fn status_lines_cover_every_status() {
        let summary = RunSummary::build(
            Utc::now(),
            Duration::ZERO,
            &[crate::domain::Record::manual("A", "t1", "d2")],
            0,
            StageResults::default(),
            LifecycleReport::default(),
            false,
        );
        let lines = status_lines(&summary);
        assert_eq!(lines.len(), 5);
        assert!(lines.iter().any(|line| line.contains("manual") && line.ends_with('1')));
    }
}
