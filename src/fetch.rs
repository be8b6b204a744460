use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::{ProgressEvent, ProgressSink, Stage};
use crate::cancel::CancelToken;
use crate::domain::{Record, RecordId, extraction_marker, file_name_from_url, partial_file_name};
use crate::error::SyncError;
use crate::pool::run_bounded;
use crate::scratch::ScratchLayout;
use crate::throttle::{BandwidthGovernor, TransferPermit};

const CHUNK_SIZE: usize = 32 * 1024;

/// Opens the body of one remote file for streaming.
pub trait Fetcher: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, SyncError>;
}

impl<T: Fetcher + ?Sized> Fetcher for &T {
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, SyncError> {
        (**self).open(url)
    }
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// `timeout` bounds a whole transfer; throttled downloads of large
    /// datasets usually want `None`.
    pub fn new(timeout: Option<Duration>) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("de-profundis/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SyncError::FetchHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::FetchHttp(err.to_string()))?;
        Ok(Self { client })
    }

    fn send_with_retries(&self, url: &str) -> Result<reqwest::blocking::Response, SyncError> {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        debug!(url, status, attempt, "retrying request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        debug!(url, error = %err, attempt, "retrying request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(SyncError::FetchHttp(err.to_string()));
                }
            }
        }
    }
}

impl Fetcher for HttpFetcher {
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, SyncError> {
        let response = self.send_with_retries(url)?;
        if !response.status().is_success() {
            return Err(SyncError::FetchStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(Box::new(response))
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyDownloaded,
    Manual,
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FetchOutcome {
    Success {
        bytes_transferred: u64,
        downloaded: Vec<String>,
        reused: Vec<String>,
    },
    Skipped {
        reason: SkipReason,
    },
    Failed {
        error: String,
        /// Partial file left for the next run to pick up.
        partial: Option<String>,
        cancelled: bool,
        bytes_transferred: u64,
    },
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success { .. })
    }

    pub fn bytes_transferred(&self) -> u64 {
        match self {
            FetchOutcome::Success {
                bytes_transferred, ..
            }
            | FetchOutcome::Failed {
                bytes_transferred, ..
            } => *bytes_transferred,
            FetchOutcome::Skipped { .. } => 0,
        }
    }

    /// Files of the record available locally after a successful fetch.
    pub fn files(&self) -> Vec<String> {
        match self {
            FetchOutcome::Success {
                downloaded, reused, ..
            } => downloaded.iter().chain(reused).cloned().collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchSettings {
    pub max_concurrency: usize,
    pub bandwidth_limit: Option<u64>,
}

/// Downloads the records that need it on a bounded pool of workers sharing
/// one [`BandwidthGovernor`].
pub struct FetchScheduler<'a, F: Fetcher> {
    fetcher: &'a F,
    layout: &'a ScratchLayout,
    settings: FetchSettings,
    governor: Arc<BandwidthGovernor>,
}

impl<'a, F: Fetcher> FetchScheduler<'a, F> {
    pub fn new(fetcher: &'a F, layout: &'a ScratchLayout, settings: FetchSettings) -> Self {
        Self {
            fetcher,
            layout,
            settings,
            governor: BandwidthGovernor::new(settings.bandwidth_limit),
        }
    }

    pub fn governor(&self) -> &Arc<BandwidthGovernor> {
        &self.governor
    }

    /// Every input record gets exactly one outcome.
    pub fn run(
        &self,
        records: &[Record],
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> BTreeMap<RecordId, FetchOutcome> {
        let mut outcomes = BTreeMap::new();
        let mut queue = Vec::new();
        for record in records {
            if record.is_manual() {
                outcomes.insert(record.id(), FetchOutcome::Skipped {
                    reason: SkipReason::Manual,
                });
            } else if !record.needs_fetch() {
                outcomes.insert(record.id(), FetchOutcome::Skipped {
                    reason: SkipReason::AlreadyDownloaded,
                });
            } else {
                queue.push(record);
            }
        }

        info!(
            queued = queue.len(),
            max_concurrency = self.settings.max_concurrency,
            bandwidth_limit = ?self.settings.bandwidth_limit,
            "starting fetch"
        );
        let finished = run_bounded(&queue, self.settings.max_concurrency, cancel, |record| {
            self.fetch_record(record, cancel, sink)
        });
        for (index, outcome) in finished {
            outcomes.insert(queue[index].id(), outcome);
        }
        for record in queue {
            outcomes.entry(record.id()).or_insert(FetchOutcome::Skipped {
                reason: SkipReason::NotAttempted,
            });
        }
        outcomes
    }

    /// URLs of one record are fetched in order into its target directory.
    fn fetch_record(
        &self,
        record: &Record,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> FetchOutcome {
        let id = record.id();
        let dir = self.layout.record_dir(record);
        let started = Instant::now();
        sink.event(ProgressEvent::record(Stage::Fetch, &id, "started"));

        if let Err(err) = fs::create_dir_all(dir.as_std_path()) {
            return self.failed(&id, format!("create {dir}: {err}"), None, false, 0, sink);
        }

        // One registration per record: its share holds until every URL is done.
        let permit = self.governor.register();
        let mut bytes_transferred = 0u64;
        let mut downloaded = Vec::new();
        let mut reused = Vec::new();
        for url in record.urls() {
            let file_name = file_name_from_url(url);
            let target = dir.join(&file_name);
            let partial = dir.join(partial_file_name(&file_name));
            let marker = dir.join(extraction_marker(&file_name));
            if !partial.as_std_path().exists()
                && (target.as_std_path().is_file() || marker.as_std_path().exists())
            {
                debug!(record = %id, file = %file_name, "already present, not refetching");
                reused.push(file_name);
                continue;
            }

            let result = self.fetcher.open(url).and_then(|body| {
                stream_to_file(body, &partial, &permit, cancel, &mut bytes_transferred)
            });
            match result {
                Ok(()) => {
                    if let Err(err) = fs::rename(partial.as_std_path(), target.as_std_path()) {
                        return self.failed(
                            &id,
                            format!("rename {partial}: {err}"),
                            Some(partial.to_string()),
                            false,
                            bytes_transferred,
                            sink,
                        );
                    }
                    downloaded.push(file_name);
                }
                Err(err) => {
                    let cancelled = matches!(err, SyncError::Cancelled);
                    let left = partial.as_std_path().exists().then(|| partial.to_string());
                    return self.failed(
                        &id,
                        format!("{url}: {err}"),
                        left,
                        cancelled,
                        bytes_transferred,
                        sink,
                    );
                }
            }
        }

        sink.event(ProgressEvent {
            stage: Stage::Fetch,
            record: Some(id.clone()),
            message: format!("done bytes={bytes_transferred}"),
            elapsed: Some(started.elapsed()),
        });
        debug!(record = %id, bytes_transferred, "fetched");
        FetchOutcome::Success {
            bytes_transferred,
            downloaded,
            reused,
        }
    }

    fn failed(
        &self,
        id: &RecordId,
        error: String,
        partial: Option<String>,
        cancelled: bool,
        bytes_transferred: u64,
        sink: &dyn ProgressSink,
    ) -> FetchOutcome {
        if cancelled {
            info!(record = %id, "fetch interrupted by cancellation");
        } else {
            warn!(record = %id, error = %error, "fetch failed");
        }
        sink.event(ProgressEvent::record(Stage::Fetch, id, &format!("failed: {error}")));
        FetchOutcome::Failed {
            error,
            partial,
            cancelled,
            bytes_transferred,
        }
    }
}

/// Copies `body` into `partial`, asking the governor for credit before
/// every read.
fn stream_to_file(
    mut body: Box<dyn Read + Send>,
    partial: &Utf8Path,
    permit: &TransferPermit,
    cancel: &CancelToken,
    bytes_transferred: &mut u64,
) -> Result<(), SyncError> {
    let file = File::create(partial.as_std_path())
        .map_err(|err| SyncError::Filesystem(format!("create {partial}: {err}")))?;
    let mut writer = BufWriter::new(file);
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let quota = permit.acquire(CHUNK_SIZE, cancel)?;
        let read = match body.read(&mut buf[..quota]) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(SyncError::FetchHttp(err.to_string())),
        };
        writer
            .write_all(&buf[..read])
            .map_err(|err| SyncError::Filesystem(format!("write {partial}: {err}")))?;
        *bytes_transferred += read as u64;
    }
    writer
        .flush()
        .map_err(|err| SyncError::Filesystem(format!("write {partial}: {err}")))?;
    Ok(())
}
