use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufWriter, Write};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use serde::Serialize;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::app::{ProgressEvent, ProgressSink, Stage};
use crate::cancel::CancelToken;
use crate::confirm::{ConfirmationToken, DestructiveAction};
use crate::domain::{ArchiveKind, Record, RecordId, extraction_marker, partial_file_name};
use crate::error::SyncError;
use crate::pool::run_bounded;
use crate::scratch::{PathFailure, ScratchLayout, SweepReport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractJob {
    pub id: RecordId,
    pub dir: Utf8PathBuf,
    pub archives: Vec<String>,
}

impl ExtractJob {
    /// Archives among `files` present in the record directory. Already
    /// extracted ones are only picked with `include_extracted`.
    pub fn for_files(
        layout: &ScratchLayout,
        record: &Record,
        files: &[String],
        include_extracted: bool,
    ) -> Option<Self> {
        let dir = layout.record_dir(record);
        let archives = files
            .iter()
            .filter(|file| ArchiveKind::detect(file).is_some())
            .filter(|file| dir.join(file).as_std_path().is_file())
            .filter(|file| {
                include_extracted || !dir.join(extraction_marker(file)).as_std_path().exists()
            })
            .cloned()
            .collect::<Vec<_>>();
        (!archives.is_empty()).then(|| Self {
            id: record.id(),
            dir,
            archives,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExtractOutcome {
    Extracted {
        archives: Vec<String>,
        files: usize,
        deleted: Vec<String>,
    },
    Failed {
        archive: String,
        error: String,
    },
}

/// Unpacks archives on its own bounded pool. Archives are kept unless the
/// extractor was built with a delete confirmation.
pub struct Extractor {
    max_concurrency: usize,
    delete: bool,
}

impl Extractor {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            delete: false,
        }
    }

    /// Archives are removed after a successful extraction.
    pub fn deleting_archives(mut self, token: &ConfirmationToken) -> Result<Self, SyncError> {
        authorize_delete(token)?;
        self.delete = true;
        Ok(self)
    }

    pub fn run(
        &self,
        jobs: &[ExtractJob],
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> BTreeMap<RecordId, ExtractOutcome> {
        info!(jobs = jobs.len(), "starting extraction");
        run_bounded(jobs, self.max_concurrency, cancel, |job| {
            (job.id.clone(), self.extract_job(job, sink))
        })
        .into_iter()
        .map(|(_, result)| result)
        .collect()
    }

    fn extract_job(&self, job: &ExtractJob, sink: &dyn ProgressSink) -> ExtractOutcome {
        sink.event(ProgressEvent::record(Stage::Extract, &job.id, "started"));
        let mut files = 0usize;
        let mut deleted = Vec::new();
        for archive in &job.archives {
            let path = job.dir.join(archive);
            let result = ArchiveKind::detect(archive)
                .ok_or_else(|| SyncError::UnsupportedArchive(archive.clone()))
                .and_then(|kind| match kind {
                    ArchiveKind::Zip => extract_zip(&path, &job.dir),
                    ArchiveKind::Gzip => extract_gzip(&path, &job.dir),
                })
                .and_then(|count| {
                    let marker = job.dir.join(extraction_marker(archive));
                    fs::write(marker.as_std_path(), b"")
                        .map_err(|err| SyncError::Filesystem(format!("write {marker}: {err}")))?;
                    Ok(count)
                });
            match result {
                Ok(count) => {
                    files += count;
                    if self.delete {
                        match fs::remove_file(path.as_std_path()) {
                            Ok(()) => deleted.push(archive.clone()),
                            Err(err) => {
                                warn!(path = %path, error = %err, "could not delete archive")
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(record = %job.id, archive = %archive, error = %err, "extraction failed");
                    sink.event(ProgressEvent::record(
                        Stage::Extract,
                        &job.id,
                        &format!("failed: {err}"),
                    ));
                    return ExtractOutcome::Failed {
                        archive: archive.clone(),
                        error: err.to_string(),
                    };
                }
            }
        }
        debug!(record = %job.id, files, "extracted");
        sink.event(ProgressEvent::record(
            Stage::Extract,
            &job.id,
            &format!("done files={files}"),
        ));
        ExtractOutcome::Extracted {
            archives: job.archives.clone(),
            files,
            deleted,
        }
    }
}

/// Removes archives of `records` whose extraction marker exists.
pub fn delete_extracted_archives(
    layout: &ScratchLayout,
    records: &[Record],
    token: &ConfirmationToken,
) -> Result<SweepReport, SyncError> {
    authorize_delete(token)?;
    let mut report = SweepReport::default();
    for record in records {
        let dir = layout.record_dir(record);
        for file in record.expected_files() {
            if ArchiveKind::detect(&file).is_none() {
                continue;
            }
            let archive = dir.join(&file);
            if !dir.join(extraction_marker(&file)).as_std_path().exists()
                || !archive.as_std_path().is_file()
            {
                continue;
            }
            match fs::remove_file(archive.as_std_path()) {
                Ok(()) => report.removed.push(archive.to_string()),
                Err(err) => report.failed.push(PathFailure {
                    path: archive.to_string(),
                    error: err.to_string(),
                }),
            }
        }
    }
    Ok(report)
}

fn authorize_delete(token: &ConfirmationToken) -> Result<(), SyncError> {
    if token.authorizes(DestructiveAction::DeleteArchives) {
        return Ok(());
    }
    Err(SyncError::Unauthorized {
        granted: token.action().to_string(),
        requested: DestructiveAction::DeleteArchives.to_string(),
    })
}

/// Returns the number of files written.
pub fn extract_zip(zip_path: &Utf8Path, target_dir: &Utf8Path) -> Result<usize, SyncError> {
    let file = fs::File::open(zip_path.as_std_path())
        .map_err(|err| SyncError::Extraction(format!("open zip {zip_path}: {err}")))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| SyncError::Extraction(format!("{zip_path}: {err}")))?;

    let mut written = 0usize;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| SyncError::Extraction(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.as_std_path().join(path),
            None => {
                return Err(SyncError::Extraction(format!(
                    "zip entry path traversal detected in {zip_path}"
                )));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| SyncError::Extraction(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| SyncError::Extraction(err.to_string()))?;
        }
        let mut outfile =
            fs::File::create(&entry_path).map_err(|err| SyncError::Extraction(err.to_string()))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| SyncError::Extraction(err.to_string()))?;
        written += 1;
    }
    Ok(written)
}

/// Decompresses `name.ext.gz` to `name.ext` next to it.
pub fn extract_gzip(gz_path: &Utf8Path, target_dir: &Utf8Path) -> Result<usize, SyncError> {
    let file_name = gz_path
        .file_name()
        .ok_or_else(|| SyncError::Extraction(format!("no file name in {gz_path}")))?;
    let stem = file_name
        .len()
        .checked_sub(3)
        .filter(|cut| file_name.is_char_boundary(*cut))
        .filter(|cut| file_name[*cut..].eq_ignore_ascii_case(".gz"))
        .map(|cut| &file_name[..cut])
        .filter(|stem| !stem.is_empty())
        .ok_or_else(|| SyncError::UnsupportedArchive(file_name.to_string()))?;
    let output = target_dir.join(stem);
    let partial = target_dir.join(partial_file_name(stem));

    let file = fs::File::open(gz_path.as_std_path())
        .map_err(|err| SyncError::Extraction(format!("open {gz_path}: {err}")))?;
    let mut decoder = GzDecoder::new(file);
    let out = fs::File::create(partial.as_std_path())
        .map_err(|err| SyncError::Extraction(format!("create {partial}: {err}")))?;
    let mut writer = BufWriter::new(out);
    let copied = io::copy(&mut decoder, &mut writer).and_then(|_| writer.flush());
    if let Err(err) = copied {
        drop(writer);
        let _ = fs::remove_file(partial.as_std_path());
        return Err(SyncError::Extraction(format!("{gz_path}: {err}")));
    }
    drop(writer);
    fs::rename(partial.as_std_path(), output.as_std_path())
        .map_err(|err| SyncError::Extraction(format!("rename {partial}: {err}")))?;
    Ok(1)
}
