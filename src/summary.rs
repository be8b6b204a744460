use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::confirm::DestructiveAction;
use crate::domain::{DatasetStatus, Record, RecordId};
use crate::extract::ExtractOutcome;
use crate::fetch::FetchOutcome;
use crate::reconcile::Probe;
use crate::scratch::{BuildReport, SweepReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Fetch,
    Extract,
    Reconcile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub id: RecordId,
    pub stage: FailureStage,
    pub cause: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub downloaded: usize,
    pub warning: usize,
    pub error: usize,
    pub unknown: usize,
    pub manual: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: DatasetStatus) {
        match status {
            DatasetStatus::Downloaded => self.downloaded += 1,
            DatasetStatus::Warning => self.warning += 1,
            DatasetStatus::Error => self.error += 1,
            DatasetStatus::Unknown => self.unknown += 1,
            DatasetStatus::Manual => self.manual += 1,
        }
    }

    pub fn get(&self, status: DatasetStatus) -> usize {
        match status {
            DatasetStatus::Downloaded => self.downloaded,
            DatasetStatus::Warning => self.warning,
            DatasetStatus::Error => self.error,
            DatasetStatus::Unknown => self.unknown,
            DatasetStatus::Manual => self.manual,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sweep {
    pub action: DestructiveAction,
    pub report: SweepReport,
}

/// What the lifecycle and deletion actions did, including the ones the user
/// declined.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleReport {
    pub built: Option<BuildReport>,
    pub sweeps: Vec<Sweep>,
    pub declined: Vec<DestructiveAction>,
}

impl LifecycleReport {
    pub fn sweep(&mut self, action: DestructiveAction, report: SweepReport) {
        self.sweeps.push(Sweep { action, report });
    }

    pub fn failed_paths(&self) -> usize {
        let built = self.built.as_ref().map_or(0, |report| report.failed.len());
        built
            + self
                .sweeps
                .iter()
                .map(|sweep| sweep.report.failed.len())
                .sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordSummary {
    pub id: RecordId,
    pub status: DatasetStatus,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch: Option<FetchOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extract: Option<ExtractOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub selected: usize,
    pub dropped: usize,
    pub counts: StatusCounts,
    pub bytes_transferred: u64,
    pub cancelled: bool,
    pub records: Vec<RecordSummary>,
    pub failures: Vec<Failure>,
    pub lifecycle: LifecycleReport,
}

/// Per-stage results gathered by the pipeline.
#[derive(Debug, Default)]
pub struct StageResults<'a> {
    pub fetch: Option<&'a BTreeMap<RecordId, FetchOutcome>>,
    pub extract: Option<&'a BTreeMap<RecordId, ExtractOutcome>>,
    pub probes: Option<&'a BTreeMap<RecordId, Probe>>,
}

impl RunSummary {
    pub fn build(
        started_at: DateTime<Utc>,
        elapsed: Duration,
        records: &[Record],
        dropped: usize,
        stages: StageResults<'_>,
        lifecycle: LifecycleReport,
        cancelled: bool,
    ) -> Self {
        let mut counts = StatusCounts::default();
        let mut failures = Vec::new();
        let mut bytes_transferred = 0u64;
        let mut summaries = Vec::with_capacity(records.len());

        for record in records {
            let id = record.id();
            counts.add(record.status());
            let fetch = stages.fetch.and_then(|map| map.get(&id)).cloned();
            let extract = stages.extract.and_then(|map| map.get(&id)).cloned();
            if let Some(outcome) = &fetch {
                bytes_transferred += outcome.bytes_transferred();
            }

            if let Some(FetchOutcome::Failed { error, cancelled: false, .. }) = &fetch {
                failures.push(Failure {
                    id: id.clone(),
                    stage: FailureStage::Fetch,
                    cause: error.clone(),
                });
            } else if let Some(ExtractOutcome::Failed { archive, error }) = &extract {
                failures.push(Failure {
                    id: id.clone(),
                    stage: FailureStage::Extract,
                    cause: format!("{archive}: {error}"),
                });
            } else if record.status() == DatasetStatus::Error {
                let cause = stages
                    .probes
                    .and_then(|map| map.get(&id))
                    .and_then(|probe| probe.detail.clone())
                    .unwrap_or_else(|| "unreadable target directory".to_string());
                failures.push(Failure {
                    id: id.clone(),
                    stage: FailureStage::Reconcile,
                    cause,
                });
            }

            summaries.push(RecordSummary {
                id,
                status: record.status(),
                size_bytes: record.total_size_bytes,
                fetch,
                extract,
            });
        }
        summaries.sort_by(|a, b| a.id.cmp(&b.id));

        Self {
            started_at,
            elapsed_secs: elapsed.as_secs_f64(),
            selected: records.len(),
            dropped,
            counts,
            bytes_transferred,
            cancelled,
            records: summaries,
            failures,
            lifecycle,
        }
    }

    /// Whether the run ended with failed records or paths; drives exit code 4.
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty() || self.lifecycle.failed_paths() > 0
    }

    pub fn status_of(&self, id: &RecordId) -> Option<DatasetStatus> {
        self.records
            .iter()
            .find(|record| &record.id == id)
            .map(|record| record.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::SkipReason;

    #[test]
    fn failures_are_attributed_to_their_stage() {
        let mut fetched = Record::from_url_field("A", "t1", "d1", "http://x/a.zip");
        fetched.set_status(DatasetStatus::Downloaded);
        let mut broken = Record::from_url_field("A", "t1", "d2", "http://x/b.zip");
        broken.set_status(DatasetStatus::Error);
        let mut unreadable = Record::from_url_field("A", "t1", "d3", "http://x/c.zip");
        unreadable.set_status(DatasetStatus::Error);
        let manual = Record::manual("A", "t1", "d4");

        let fetch = BTreeMap::from([
            (fetched.id(), FetchOutcome::Success {
                bytes_transferred: 10,
                downloaded: vec!["a.zip".to_string()],
                reused: Vec::new(),
            }),
            (broken.id(), FetchOutcome::Failed {
                error: "404".to_string(),
                partial: None,
                cancelled: false,
                bytes_transferred: 3,
            }),
            (manual.id(), FetchOutcome::Skipped {
                reason: SkipReason::Manual,
            }),
        ]);
        let records = vec![fetched, broken, unreadable, manual];
        let summary = RunSummary::build(
            Utc::now(),
            Duration::from_millis(5),
            &records,
            2,
            StageResults {
                fetch: Some(&fetch),
                ..StageResults::default()
            },
            LifecycleReport::default(),
            false,
        );

        assert_eq!(summary.bytes_transferred, 13);
        assert_eq!(summary.counts.error, 2);
        assert_eq!(summary.counts.manual, 1);
        assert_eq!(summary.dropped, 2);
        let stages = summary
            .failures
            .iter()
            .map(|failure| failure.stage)
            .collect::<Vec<_>>();
        assert_eq!(stages, vec![FailureStage::Fetch, FailureStage::Reconcile]);
        assert!(summary.has_failures());
    }

    #[test]
    fn declined_actions_are_not_failures() {
        let lifecycle = LifecycleReport {
            declined: vec![DestructiveAction::EraseScratch],
            ..LifecycleReport::default()
        };
        let summary = RunSummary::build(
            Utc::now(),
            Duration::ZERO,
            &[],
            0,
            StageResults::default(),
            lifecycle,
            false,
        );
        assert!(!summary.has_failures());
        assert_eq!(summary.lifecycle.declined, vec![DestructiveAction::EraseScratch]);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["lifecycle"]["declined"][0]["action"], "erase_scratch");
    }

    #[test]
    fn cancelled_transfer_is_not_a_failure() {
        let mut record = Record::from_url_field("A", "t1", "d1", "http://x/a.zip");
        record.set_status(DatasetStatus::Warning);
        let fetch = BTreeMap::from([(record.id(), FetchOutcome::Failed {
            error: "cancelled".to_string(),
            partial: Some("a.zip.part".to_string()),
            cancelled: true,
            bytes_transferred: 7,
        })]);
        let summary = RunSummary::build(
            Utc::now(),
            Duration::ZERO,
            &[record],
            0,
            StageResults {
                fetch: Some(&fetch),
                ..StageResults::default()
            },
            LifecycleReport::default(),
            true,
        );
        assert!(summary.failures.is_empty());
        assert!(!summary.has_failures());
        assert_eq!(summary.counts.warning, 1);
        assert_eq!(summary.bytes_transferred, 7);
    }
}
