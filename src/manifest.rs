use std::collections::HashSet;
use std::fs;
use std::io::{Read, Write};
use std::sync::OnceLock;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use csv::ReaderBuilder;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, info};

use crate::config::ManifestLocation;
use crate::domain::Record;
use crate::error::SyncError;

const PROJECT_COLUMNS: &[&str] = &["project"];
const TASK_COLUMNS: &[&str] = &["task"];
const NAME_COLUMNS: &[&str] = &["dataset", "name", "dataset name"];
const URL_COLUMNS: &[&str] = &["url(s)", "urls", "url"];

/// Supplies the manifest rows for one run.
pub trait ManifestSource {
    fn load(&self) -> Result<Vec<Record>, SyncError>;
}

impl<T: ManifestSource + ?Sized> ManifestSource for Box<T> {
    fn load(&self) -> Result<Vec<Record>, SyncError> {
        (**self).load()
    }
}

/// Source matching the configured manifest location.
pub fn open_source(
    location: &ManifestLocation,
) -> Result<Box<dyn ManifestSource + Send + Sync>, SyncError> {
    match location {
        ManifestLocation::File(path) => Ok(Box::new(CsvFileSource::new(path.clone()))),
        ManifestLocation::Spreadsheet { id, filename } => {
            Ok(Box::new(SpreadsheetSource::new(id, filename)?))
        }
    }
}

pub struct CsvFileSource {
    path: Utf8PathBuf,
}

impl CsvFileSource {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ManifestSource for CsvFileSource {
    fn load(&self) -> Result<Vec<Record>, SyncError> {
        let file = fs::File::open(self.path.as_std_path()).map_err(|err| {
            SyncError::ManifestUnavailable(format!("open {}: {err}", self.path))
        })?;
        let records = parse_manifest(file)?;
        info!(path = %self.path, records = records.len(), "loaded manifest");
        Ok(records)
    }
}

/// CSV export of a Google spreadsheet. The downloaded copy is kept at
/// `filename` so the run can be inspected afterwards.
pub struct SpreadsheetSource {
    client: Client,
    id: String,
    filename: Utf8PathBuf,
}

impl SpreadsheetSource {
    pub fn new(id: &str, filename: &Utf8Path) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("de-profundis/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SyncError::ManifestUnavailable(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .cookie_store(true)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| SyncError::ManifestUnavailable(err.to_string()))?;
        Ok(Self {
            client,
            id: id.to_string(),
            filename: filename.to_path_buf(),
        })
    }

    pub fn export_url(id: &str) -> String {
        format!("https://docs.google.com/spreadsheet/ccc?key={id}&output=csv")
    }

    fn download(&self) -> Result<Vec<u8>, SyncError> {
        let url = Self::export_url(&self.id);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| SyncError::ManifestUnavailable(err.to_string()))?;

        // Large exports answer with a confirmation cookie first.
        let token = response
            .cookies()
            .find(|cookie| cookie.name().starts_with("download_warning"))
            .map(|cookie| cookie.value().to_string());
        let response = match token {
            Some(token) => {
                debug!("spreadsheet download requires confirmation, retrying");
                self.client
                    .get(&url)
                    .query(&[("id", self.id.as_str()), ("confirm", token.as_str())])
                    .send()
                    .map_err(|err| SyncError::ManifestUnavailable(err.to_string()))?
            }
            None => response,
        };

        if !response.status().is_success() {
            return Err(SyncError::ManifestUnavailable(format!(
                "spreadsheet {} returned status {}",
                self.id,
                response.status().as_u16()
            )));
        }
        let bytes = response
            .bytes()
            .map_err(|err| SyncError::ManifestUnavailable(err.to_string()))?;
        Ok(bytes.to_vec())
    }
}

impl ManifestSource for SpreadsheetSource {
    fn load(&self) -> Result<Vec<Record>, SyncError> {
        let bytes = self.download()?;
        save_copy(&self.filename, &bytes)?;
        let records = parse_manifest(bytes.as_slice())?;
        info!(
            id = %self.id,
            path = %self.filename,
            records = records.len(),
            "downloaded manifest spreadsheet"
        );
        Ok(records)
    }
}

/// Replaces `path` atomically so a failed download never truncates the
/// previous copy.
fn save_copy(path: &Utf8Path, bytes: &[u8]) -> Result<(), SyncError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
        _ => Utf8PathBuf::from("."),
    };
    let write_err =
        |err: std::io::Error| SyncError::ManifestUnavailable(format!("write {path}: {err}"));
    let mut staged = tempfile::NamedTempFile::new_in(dir.as_std_path()).map_err(write_err)?;
    staged.write_all(bytes).map_err(write_err)?;
    staged
        .persist(path.as_std_path())
        .map_err(|err| write_err(err.error))?;
    Ok(())
}

/// Parses manifest CSV into records. Header names are matched
/// case-insensitively; extra columns are ignored.
pub fn parse_manifest<R: Read>(reader: R) -> Result<Vec<Record>, SyncError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);
    let headers = reader
        .headers()
        .map_err(|err| SyncError::ManifestUnavailable(err.to_string()))?
        .clone();

    let column = |aliases: &[&str], label: &str| -> Result<usize, SyncError> {
        headers
            .iter()
            .position(|header| aliases.contains(&header.to_ascii_lowercase().as_str()))
            .ok_or_else(|| SyncError::ManifestUnavailable(format!("missing `{label}` column")))
    };
    let project_col = column(PROJECT_COLUMNS, "Project")?;
    let task_col = column(TASK_COLUMNS, "Task")?;
    let name_col = column(NAME_COLUMNS, "Dataset")?;
    let url_col = column(URL_COLUMNS, "URL(s)")?;

    let mut seen = HashSet::new();
    let mut records = Vec::new();
    for (index, row) in reader.records().enumerate() {
        // Header is line 1.
        let line = index + 2;
        let row = row.map_err(|err| SyncError::ManifestUnavailable(err.to_string()))?;
        let cell = |col: usize| row.get(col).unwrap_or("").trim();

        let (project, task, name, urls) =
            (cell(project_col), cell(task_col), cell(name_col), cell(url_col));
        if project.is_empty() && task.is_empty() && name.is_empty() && urls.is_empty() {
            continue;
        }
        if project.is_empty() || task.is_empty() || name.is_empty() {
            return Err(SyncError::ManifestRow {
                row: line,
                message: "project, task and dataset must all be set".to_string(),
            });
        }
        if [project, task, name]
            .iter()
            .any(|key| key.contains('/') || *key == "." || *key == "..")
        {
            return Err(SyncError::ManifestRow {
                row: line,
                message: format!("`{project}/{task}/{name}` is not a valid path key"),
            });
        }

        let record = Record::from_url_field(project, task, name, urls);
        if !record.is_manual() && record.urls().is_empty() {
            return Err(SyncError::ManifestRow {
                row: line,
                message: format!("{} has neither URLs nor the manual marker", record.id()),
            });
        }
        if let Some(bad) = record.urls().iter().find(|url| !url_pattern().is_match(url)) {
            return Err(SyncError::ManifestRow {
                row: line,
                message: format!("invalid URL `{bad}`"),
            });
        }
        let files = record.expected_files();
        if let Some(clash) = files
            .iter()
            .enumerate()
            .find_map(|(i, file)| files[..i].contains(file).then_some(file))
        {
            return Err(SyncError::ManifestRow {
                row: line,
                message: format!("{} has two URLs saving to `{clash}`", record.id()),
            });
        }
        if !seen.insert(record.id()) {
            return Err(SyncError::ManifestRow {
                row: line,
                message: format!("duplicate dataset {}", record.id()),
            });
        }
        records.push(record);
    }
    Ok(records)
}

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(?i:https?|ftp|file)://\S+$").unwrap())
}
