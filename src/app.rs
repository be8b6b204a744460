use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::config::{Actions, CleanScope, RunConfig};
use crate::confirm::{Confirm, ConfirmationToken, DestructiveAction};
use crate::domain::{DatasetStatus, Record, RecordId, ScratchRoot};
use crate::error::SyncError;
use crate::extract::{ExtractJob, ExtractOutcome, Extractor, delete_extracted_archives};
use crate::fetch::{FetchOutcome, FetchScheduler, FetchSettings, Fetcher};
use crate::manifest::ManifestSource;
use crate::reconcile::Reconciler;
use crate::scratch::ScratchLayout;
use crate::selection::select;
use crate::summary::{LifecycleReport, RunSummary, StageResults};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Manifest,
    Select,
    Lifecycle,
    Reconcile,
    Fetch,
    Extract,
    Summary,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Manifest,
        Stage::Select,
        Stage::Lifecycle,
        Stage::Reconcile,
        Stage::Fetch,
        Stage::Extract,
        Stage::Summary,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Stage::Manifest => "Manifest",
            Stage::Select => "Select",
            Stage::Lifecycle => "Lifecycle",
            Stage::Reconcile => "Reconcile",
            Stage::Fetch => "Fetch",
            Stage::Extract => "Extract",
            Stage::Summary => "Summary",
        }
    }

    pub fn index(self) -> usize {
        Stage::ALL
            .iter()
            .position(|stage| *stage == self)
            .unwrap_or(0)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub record: Option<RecordId>,
    pub message: String,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    pub fn stage(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            record: None,
            message: message.into(),
            elapsed: None,
        }
    }

    pub fn record(stage: Stage, id: &RecordId, message: &str) -> Self {
        Self {
            stage,
            record: Some(id.clone()),
            message: message.to_string(),
            elapsed: None,
        }
    }
}

/// Receives progress from every stage, possibly from several worker threads.
pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

/// Confirmations for the destructive actions a run will attempt, asked
/// before the run starts.
#[derive(Debug, Default)]
pub struct Grants {
    erase_scratch: Option<ConfirmationToken>,
    erase_datasets: Option<ConfirmationToken>,
    clean: Vec<(ScratchRoot, CleanScope, ConfirmationToken)>,
    delete_archives: Option<ConfirmationToken>,
    declined: Vec<DestructiveAction>,
}

impl Grants {
    pub fn request(config: &RunConfig, confirm: &dyn Confirm) -> Self {
        let actions = &config.actions;
        let mut grants = Self::default();
        if actions.erase_scratch {
            grants.erase_scratch = grants.ask(confirm, DestructiveAction::EraseScratch);
        } else if actions.erase_datasets && !actions.build_scratch {
            grants.erase_datasets =
                grants.ask(confirm, DestructiveAction::Erase(ScratchRoot::Datasets));
        }
        for (root, scope) in clean_requests(actions) {
            if let Some(token) = grants.ask(confirm, DestructiveAction::Clean(root)) {
                grants.clean.push((root, scope.clone(), token));
            }
        }
        if actions.delete_zip_all || (config.unzip && config.delete_zip) {
            grants.delete_archives = grants.ask(confirm, DestructiveAction::DeleteArchives);
        }
        grants
    }

    pub fn declined(&self) -> &[DestructiveAction] {
        &self.declined
    }

    fn ask(
        &mut self,
        confirm: &dyn Confirm,
        action: DestructiveAction,
    ) -> Option<ConfirmationToken> {
        let token = confirm.confirm(action);
        if token.is_none() {
            info!(%action, "declined, leaving files in place");
            self.declined.push(action);
        }
        token
    }
}

fn clean_requests(actions: &Actions) -> Vec<(ScratchRoot, &CleanScope)> {
    [
        (ScratchRoot::Checkpoints, actions.clean_checkpoints.as_ref()),
        (ScratchRoot::Logs, actions.clean_logs.as_ref()),
        (ScratchRoot::Outputs, actions.clean_outputs.as_ref()),
    ]
    .into_iter()
    .filter_map(|(root, scope)| scope.map(|scope| (root, scope)))
    .collect()
}

/// Runs manifest, selection, lifecycle, reconcile, fetch, extraction and
/// summary strictly in that order.
#[derive(Clone)]
pub struct App<M: ManifestSource, F: Fetcher> {
    manifest: M,
    fetcher: F,
}

impl<M: ManifestSource, F: Fetcher> App<M, F> {
    pub fn new(manifest: M, fetcher: F) -> Self {
        Self { manifest, fetcher }
    }

    /// Asks for confirmations and runs.
    pub fn sync(
        &self,
        config: &RunConfig,
        confirm: &dyn Confirm,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, SyncError> {
        let grants = Grants::request(config, confirm);
        self.run(config, grants, cancel, sink)
    }

    /// Only manifest and configuration errors are returned; everything else
    /// ends up in the summary.
    pub fn run(
        &self,
        config: &RunConfig,
        grants: Grants,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, SyncError> {
        let started_at = Utc::now();
        let started = Instant::now();
        let layout = ScratchLayout::new(&config.root);

        sink.event(ProgressEvent::stage(Stage::Manifest, "loading manifest"));
        let records = self.manifest.load()?;

        let selection = select(records, &config.filters)?;
        info!(
            selected = selection.len(),
            dropped = selection.dropped(),
            "selection ready"
        );
        sink.event(ProgressEvent::stage(
            Stage::Select,
            format!("selected={} dropped={}", selection.len(), selection.dropped()),
        ));
        let dropped = selection.dropped();
        let selected_projects = selection.projects();
        let mut records = selection.into_records();

        let Grants {
            erase_scratch,
            erase_datasets,
            clean,
            delete_archives,
            declined,
        } = grants;
        let mut lifecycle = LifecycleReport {
            declined,
            ..LifecycleReport::default()
        };
        if config.actions.any_lifecycle() {
            sink.event(ProgressEvent::stage(Stage::Lifecycle, "updating scratch"));
            if let Some(token) = erase_scratch {
                let report = layout.erase_scratch(token)?;
                lifecycle.sweep(DestructiveAction::EraseScratch, report);
            } else if let Some(token) = erase_datasets {
                let action = token.action();
                let report = layout.erase(ScratchRoot::Datasets, token)?;
                lifecycle.sweep(action, report);
            }
            if config.actions.build_scratch {
                let projects = scratch_projects(
                    selected_projects,
                    &config.extra_projects,
                    layout.discover_projects(),
                );
                lifecycle.built = Some(layout.build(&projects));
            }
            for (root, scope, token) in clean {
                let report = layout.clean(root, &scope, token)?;
                lifecycle.sweep(DestructiveAction::Clean(root), report);
            }
        }

        sink.event(ProgressEvent::stage(Stage::Reconcile, "probing datasets"));
        let reconciler = Reconciler::new(&layout, config.unzip);
        let mut probes = reconciler.reconcile(&mut records);

        sink.event(ProgressEvent::stage(Stage::Fetch, "fetching datasets"));
        let scheduler = FetchScheduler::new(
            &self.fetcher,
            &layout,
            FetchSettings {
                max_concurrency: config.max_concurrency,
                bandwidth_limit: config.bandwidth_limit,
            },
        );
        let fetched = scheduler.run(&records, cancel, sink);

        sink.event(ProgressEvent::stage(Stage::Extract, "extracting archives"));
        let extracted = self.extract(
            config,
            &layout,
            &records,
            &fetched,
            delete_archives.as_ref(),
            cancel,
            sink,
        )?;
        if config.actions.delete_zip_all {
            if let Some(token) = &delete_archives {
                let report = delete_extracted_archives(&layout, &records, token)?;
                info!(removed = report.removed.len(), "deleted extracted archives");
                lifecycle.sweep(DestructiveAction::DeleteArchives, report);
            }
        }

        let touched = fetched
            .iter()
            .filter(|(_, outcome)| !matches!(outcome, FetchOutcome::Skipped { .. }))
            .map(|(id, _)| id.clone())
            .chain(extracted.keys().cloned())
            .collect::<BTreeSet<_>>();
        for record in records.iter_mut().filter(|record| touched.contains(&record.id())) {
            probes.extend(reconciler.reconcile(std::slice::from_mut(record)));
        }
        for record in records.iter_mut() {
            let id = record.id();
            let fetch_failed = matches!(
                fetched.get(&id),
                Some(FetchOutcome::Failed {
                    cancelled: false,
                    ..
                })
            );
            let extract_failed = matches!(extracted.get(&id), Some(ExtractOutcome::Failed { .. }));
            if fetch_failed || extract_failed {
                record.set_status(DatasetStatus::Error);
            }
        }

        let cancelled = cancel.is_cancelled();
        if cancelled {
            warn!("run cancelled, unfinished records are left for the next run");
        }
        let summary = RunSummary::build(
            started_at,
            started.elapsed(),
            &records,
            dropped,
            StageResults {
                fetch: Some(&fetched),
                extract: Some(&extracted),
                probes: Some(&probes),
            },
            lifecycle,
            cancelled,
        );
        info!(
            downloaded = summary.counts.downloaded,
            warning = summary.counts.warning,
            error = summary.counts.error,
            unknown = summary.counts.unknown,
            manual = summary.counts.manual,
            bytes = summary.bytes_transferred,
            "run finished"
        );
        sink.event(ProgressEvent {
            stage: Stage::Summary,
            record: None,
            message: format!(
                "downloaded={} warning={} error={} failures={}",
                summary.counts.downloaded,
                summary.counts.warning,
                summary.counts.error,
                summary.failures.len()
            ),
            elapsed: Some(started.elapsed()),
        });
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    fn extract(
        &self,
        config: &RunConfig,
        layout: &ScratchLayout,
        records: &[Record],
        fetched: &BTreeMap<RecordId, FetchOutcome>,
        delete_archives: Option<&ConfirmationToken>,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<BTreeMap<RecordId, ExtractOutcome>, SyncError> {
        if !config.unzip && !config.actions.unzip_all {
            return Ok(BTreeMap::new());
        }
        let jobs = records
            .iter()
            .filter(|record| !record.is_manual())
            .filter_map(|record| {
                if config.actions.unzip_all {
                    return ExtractJob::for_files(layout, record, &record.expected_files(), true);
                }
                match fetched.get(&record.id()) {
                    Some(outcome) if outcome.is_success() => {
                        ExtractJob::for_files(layout, record, &outcome.files(), false)
                    }
                    _ => None,
                }
            })
            .collect::<Vec<_>>();

        let mut extractor = Extractor::new(config.max_concurrency);
        if config.delete_zip {
            if let Some(token) = delete_archives {
                extractor = extractor.deleting_archives(token)?;
            }
        }
        Ok(extractor.run(&jobs, cancel, sink))
    }
}

/// Projects the scratch hierarchy is built for: the selected ones, the
/// configured extras and the project folders found next to `scratch/`.
fn scratch_projects(
    selected: Vec<String>,
    extra: &[String],
    discovered: Vec<String>,
) -> Vec<String> {
    selected
        .into_iter()
        .chain(extra.iter().cloned())
        .chain(discovered)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::config::ManifestLocation;
    use crate::confirm::{AlwaysDecline, AssumeYes};
    use crate::selection::FilterCriteria;

    fn config(actions: Actions) -> RunConfig {
        RunConfig {
            root: Utf8PathBuf::from("/tmp/unused"),
            manifest: ManifestLocation::File(Utf8PathBuf::from("index.csv")),
            filters: FilterCriteria::default(),
            extra_projects: Vec::new(),
            actions,
            unzip: true,
            delete_zip: false,
            max_concurrency: 1,
            bandwidth_limit: None,
            verbose: false,
            visual_gui: false,
        }
    }

    #[test]
    fn grants_follow_requested_actions() {
        let config = config(Actions {
            erase_scratch: true,
            erase_datasets: true,
            clean_logs: Some(CleanScope::All),
            ..Actions::default()
        });
        let grants = Grants::request(&config, &AssumeYes);
        assert!(grants.erase_scratch.is_some());
        assert!(grants.erase_datasets.is_none());
        assert_eq!(grants.clean.len(), 1);
        assert!(grants.delete_archives.is_none());
        assert!(grants.declined().is_empty());
    }

    #[test]
    fn declined_grants_are_recorded() {
        let mut config = config(Actions {
            delete_zip_all: true,
            clean_outputs: Some(CleanScope::Projects(vec!["A".to_string()])),
            ..Actions::default()
        });
        config.delete_zip = true;
        let grants = Grants::request(&config, &AlwaysDecline);
        assert_eq!(grants.declined(), &[
            DestructiveAction::Clean(ScratchRoot::Outputs),
            DestructiveAction::DeleteArchives,
        ]);
    }

    #[test]
    fn stages_are_ordered() {
        let indices = Stage::ALL.iter().map(|stage| stage.index()).collect::<Vec<_>>();
        assert_eq!(indices, (0..Stage::ALL.len()).collect::<Vec<_>>());
    }
}
