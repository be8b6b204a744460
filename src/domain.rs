use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

pub const MANUAL_MARKER: &str = "manual";
pub const PARTIAL_SUFFIX: &str = "part";
const FALLBACK_FILE_NAME: &str = "download.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetStatus {
    Unknown,
    Downloaded,
    Warning,
    Error,
    Manual,
}

impl DatasetStatus {
    pub const ALL: [DatasetStatus; 5] = [
        DatasetStatus::Downloaded,
        DatasetStatus::Warning,
        DatasetStatus::Error,
        DatasetStatus::Unknown,
        DatasetStatus::Manual,
    ];

    pub fn icon(self) -> &'static str {
        match self {
            DatasetStatus::Downloaded => "✅",
            DatasetStatus::Warning => "🟠",
            DatasetStatus::Error => "❌",
            DatasetStatus::Unknown => "❓",
            DatasetStatus::Manual => "✋",
        }
    }

    /// Statuses the fetch stage acts on.
    pub fn needs_fetch(self) -> bool {
        matches!(
            self,
            DatasetStatus::Unknown | DatasetStatus::Warning | DatasetStatus::Error
        )
    }
}

impl fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetStatus::Unknown => write!(f, "unknown"),
            DatasetStatus::Downloaded => write!(f, "downloaded"),
            DatasetStatus::Warning => write!(f, "warning"),
            DatasetStatus::Error => write!(f, "error"),
            DatasetStatus::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub project: String,
    pub task: String,
    pub name: String,
}

impl RecordId {
    pub fn new(project: &str, task: &str, name: &str) -> Self {
        Self {
            project: project.to_string(),
            task: task.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.task, self.name)
    }
}

impl FromStr for RecordId {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value.trim().split('/').collect::<Vec<_>>();
        match parts.as_slice() {
            [project, task, name]
                if !project.is_empty() && !task.is_empty() && !name.is_empty() =>
            {
                Ok(Self::new(project, task, name))
            }
            _ => Err(SyncError::InvalidConfig(format!(
                "record id must be project/task/name: {value}"
            ))),
        }
    }
}

/// One dataset entry of the manifest together with its reconciled state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    pub project: String,
    pub task: String,
    pub name: String,
    urls: Vec<String>,
    is_manual: bool,
    status: DatasetStatus,
    pub total_size_bytes: u64,
}

impl Record {
    pub fn remote(project: &str, task: &str, name: &str, urls: Vec<String>) -> Self {
        Self {
            project: project.to_string(),
            task: task.to_string(),
            name: name.to_string(),
            urls,
            is_manual: false,
            status: DatasetStatus::Unknown,
            total_size_bytes: 0,
        }
    }

    pub fn manual(project: &str, task: &str, name: &str) -> Self {
        Self {
            project: project.to_string(),
            task: task.to_string(),
            name: name.to_string(),
            urls: Vec::new(),
            is_manual: true,
            status: DatasetStatus::Manual,
            total_size_bytes: 0,
        }
    }

    /// Builds a record from the raw manifest URL cell: either the `manual`
    /// marker or a `;`-separated URL list.
    pub fn from_url_field(project: &str, task: &str, name: &str, field: &str) -> Self {
        let trimmed = field.trim();
        if trimmed.eq_ignore_ascii_case(MANUAL_MARKER) {
            return Self::manual(project, task, name);
        }
        let urls = trimmed
            .split(';')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .collect();
        Self::remote(project, task, name, urls)
    }

    pub fn id(&self) -> RecordId {
        RecordId::new(&self.project, &self.task, &self.name)
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn is_manual(&self) -> bool {
        self.is_manual
    }

    pub fn status(&self) -> DatasetStatus {
        self.status
    }

    /// Manual records keep `Manual` whatever the caller derived.
    pub fn set_status(&mut self, status: DatasetStatus) {
        self.status = if self.is_manual {
            DatasetStatus::Manual
        } else {
            status
        };
    }

    pub fn needs_fetch(&self) -> bool {
        !self.is_manual && !self.urls.is_empty() && self.status.needs_fetch()
    }

    pub fn expected_files(&self) -> Vec<String> {
        self.urls.iter().map(|url| file_name_from_url(url)).collect()
    }
}

/// File name a URL lands under: the last non-empty path segment without
/// query or fragment.
pub fn file_name_from_url(url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment
        .split('?')
        .next()
        .unwrap_or(without_fragment);
    let path = match without_query.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map(|(_, path)| path).unwrap_or(""),
        None => without_query,
    };
    path.rsplit('/')
        .find(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .map(str::to_string)
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}

/// Name of the in-progress download of `file_name`.
pub fn partial_file_name(file_name: &str) -> String {
    format!("{file_name}.{PARTIAL_SUFFIX}")
}

/// Marker left next to an archive once its contents were unpacked.
pub fn extraction_marker(archive_name: &str) -> String {
    format!(".{archive_name}.extracted")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScratchRoot {
    Datasets,
    Checkpoints,
    Logs,
    Outputs,
}

impl ScratchRoot {
    pub const ALL: [ScratchRoot; 4] = [
        ScratchRoot::Datasets,
        ScratchRoot::Checkpoints,
        ScratchRoot::Logs,
        ScratchRoot::Outputs,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            ScratchRoot::Datasets => "datasets",
            ScratchRoot::Checkpoints => "checkpoints",
            ScratchRoot::Logs => "logs",
            ScratchRoot::Outputs => "outputs",
        }
    }
}

impl fmt::Display for ScratchRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    Zip,
    Gzip,
}

impl ArchiveKind {
    /// Recognizes single-archive downloads. Tarballs are not unpacked.
    pub fn detect(file_name: &str) -> Option<ArchiveKind> {
        let lower = file_name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            None
        } else if lower.ends_with(".gz") {
            Some(ArchiveKind::Gzip)
        } else {
            None
        }
    }
}
