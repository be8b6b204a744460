use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;

use camino::Utf8Path;
use serde::Serialize;
use tracing::debug;

use crate::domain::{
    ArchiveKind, DatasetStatus, Record, RecordId, extraction_marker, partial_file_name,
};
use crate::scratch::{ScratchLayout, sorted_entries};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Probe {
    pub status: DatasetStatus,
    pub size_bytes: u64,
    pub detail: Option<String>,
}

impl Probe {
    fn new(status: DatasetStatus, size_bytes: u64, detail: Option<String>) -> Self {
        Self {
            status,
            size_bytes,
            detail,
        }
    }

    fn error(detail: String) -> Self {
        Self::new(DatasetStatus::Error, 0, Some(detail))
    }
}

/// Read-only classification of records against the datasets tree.
pub struct Reconciler<'a> {
    layout: &'a ScratchLayout,
    expect_extraction: bool,
}

impl<'a> Reconciler<'a> {
    /// With `expect_extraction` off, an archive that was never unpacked
    /// counts as a complete download.
    pub fn new(layout: &'a ScratchLayout, expect_extraction: bool) -> Self {
        Self {
            layout,
            expect_extraction,
        }
    }

    /// Classifies and updates every record in place.
    pub fn reconcile(&self, records: &mut [Record]) -> BTreeMap<RecordId, Probe> {
        let mut probes = BTreeMap::new();
        for record in records.iter_mut() {
            let probe = self.classify(record);
            record.set_status(probe.status);
            record.total_size_bytes = probe.size_bytes;
            debug!(record = %record.id(), status = %probe.status, "reconciled");
            probes.insert(record.id(), probe);
        }
        probes
    }

    pub fn classify(&self, record: &Record) -> Probe {
        let dir = self.layout.record_dir(record);
        if record.is_manual() {
            let size = scan(&dir).map(|scan| scan.size_bytes).unwrap_or(0);
            return Probe::new(DatasetStatus::Manual, size, None);
        }

        let meta = match fs::symlink_metadata(dir.as_std_path()) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Probe::new(DatasetStatus::Unknown, 0, None);
            }
            Err(err) => return Probe::error(format!("stat {dir}: {err}")),
        };
        if meta.file_type().is_symlink() {
            match fs::metadata(dir.as_std_path()) {
                Ok(target) if target.is_dir() => {}
                Ok(_) => return Probe::error(format!("{dir} does not point to a directory")),
                Err(err) => return Probe::error(format!("broken symlink {dir}: {err}")),
            }
        } else if !meta.is_dir() {
            return Probe::error(format!("{dir} is not a directory"));
        }

        let scan = match scan(&dir) {
            Ok(scan) => scan,
            Err(err) => return Probe::error(err),
        };
        self.judge(record, scan)
    }

    fn judge(&self, record: &Record, scan: Scan) -> Probe {
        let size = scan.size_bytes;
        let warning = |detail: String| Probe::new(DatasetStatus::Warning, size, Some(detail));

        if scan.top_level.is_empty() {
            return warning("target directory is empty".to_string());
        }
        let expected = record.expected_files();
        if let Some(partial) = expected
            .iter()
            .map(|file| partial_file_name(file))
            .find(|partial| scan.top_level.contains(partial))
        {
            return warning(format!("interrupted download {partial}"));
        }

        let mut missing = Vec::new();
        let mut unextracted = Vec::new();
        for file in expected {
            let present = scan.top_level.contains(&file);
            let extracted = scan.top_level.contains(&extraction_marker(&file));
            match ArchiveKind::detect(&file) {
                Some(_) if extracted => {}
                Some(_) if present && self.expect_extraction => unextracted.push(file),
                _ if present => {}
                _ => missing.push(file),
            }
        }

        if !missing.is_empty() {
            return warning(format!("missing {}", missing.join(", ")));
        }
        if !unextracted.is_empty() {
            return warning(format!("not extracted {}", unextracted.join(", ")));
        }
        Probe::new(DatasetStatus::Downloaded, scan.size_bytes, None)
    }
}

struct Scan {
    top_level: BTreeSet<String>,
    size_bytes: u64,
}

fn scan(dir: &Utf8Path) -> Result<Scan, String> {
    let entries = sorted_entries(dir).map_err(|err| format!("read {dir}: {err}"))?;
    let top_level = entries
        .iter()
        .filter_map(|path| path.file_name().map(str::to_string))
        .collect();

    let mut size_bytes = 0u64;
    let mut stack = entries;
    while let Some(path) = stack.pop() {
        let meta = fs::symlink_metadata(path.as_std_path())
            .map_err(|err| format!("stat {path}: {err}"))?;
        if meta.file_type().is_symlink() {
            let target = fs::metadata(path.as_std_path())
                .map_err(|err| format!("broken symlink {path}: {err}"))?;
            size_bytes = size_bytes.saturating_add(if target.is_file() { target.len() } else { 0 });
        } else if meta.is_dir() {
            stack.extend(sorted_entries(&path).map_err(|err| format!("read {path}: {err}"))?);
        } else {
            size_bytes = size_bytes.saturating_add(meta.len());
        }
    }
    Ok(Scan {
        top_level,
        size_bytes,
    })
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    struct Fixture {
        _temp: tempfile::TempDir,
        layout: ScratchLayout,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
            Self {
                layout: ScratchLayout::new(&root),
                _temp: temp,
            }
        }

        fn write(&self, record: &Record, name: &str, content: &[u8]) {
            let dir = self.layout.record_dir(record);
            fs::create_dir_all(dir.as_std_path()).unwrap();
            fs::write(dir.join(name).as_std_path(), content).unwrap();
        }
    }

    fn remote() -> Record {
        Record::from_url_field("A", "t1", "d1", "http://x/a.zip;http://x/readme.txt")
    }

    #[test]
    fn missing_directory_is_unknown() {
        let fixture = Fixture::new();
        let probe = Reconciler::new(&fixture.layout, true).classify(&remote());
        assert_eq!(probe.status, DatasetStatus::Unknown);
    }

    #[test]
    fn manual_wins_over_filesystem_state() {
        let fixture = Fixture::new();
        let manual = Record::manual("A", "t1", "d1");
        fixture.write(&manual, "whatever.bin", b"12345");
        let probe = Reconciler::new(&fixture.layout, true).classify(&manual);
        assert_eq!(probe.status, DatasetStatus::Manual);
        assert_eq!(probe.size_bytes, 5);
    }

    #[test]
    fn complete_extracted_download() {
        let fixture = Fixture::new();
        let record = remote();
        fixture.write(&record, "readme.txt", b"hi");
        fixture.write(&record, ".a.zip.extracted", b"");
        fixture.write(&record, "data.csv", b"1,2");
        let probe = Reconciler::new(&fixture.layout, true).classify(&record);
        assert_eq!(probe.status, DatasetStatus::Downloaded);
        assert_eq!(probe.size_bytes, 5);
    }

    #[test]
    fn incomplete_download_is_warning() {
        let fixture = Fixture::new();
        let record = remote();
        fixture.write(&record, "readme.txt", b"hi");
        let probe = Reconciler::new(&fixture.layout, true).classify(&record);
        assert_eq!(probe.status, DatasetStatus::Warning);
        assert_eq!(probe.detail.as_deref(), Some("missing a.zip"));
    }

    #[test]
    fn unextracted_archive_depends_on_policy() {
        let fixture = Fixture::new();
        let record = remote();
        fixture.write(&record, "readme.txt", b"hi");
        fixture.write(&record, "a.zip", b"PK");
        let strict = Reconciler::new(&fixture.layout, true).classify(&record);
        assert_eq!(strict.status, DatasetStatus::Warning);
        let lenient = Reconciler::new(&fixture.layout, false).classify(&record);
        assert_eq!(lenient.status, DatasetStatus::Downloaded);
    }

    #[test]
    fn partial_file_is_warning() {
        let fixture = Fixture::new();
        let record = remote();
        fixture.write(&record, "readme.txt", b"hi");
        fixture.write(&record, ".a.zip.extracted", b"");
        fixture.write(&record, "a.zip.part", b"P");
        let probe = Reconciler::new(&fixture.layout, true).classify(&record);
        assert_eq!(probe.status, DatasetStatus::Warning);
    }

    #[test]
    fn expected_file_named_like_a_partial_is_complete() {
        let fixture = Fixture::new();
        let record = Record::from_url_field("A", "t1", "d1", "http://a/volume.part");
        fixture.write(&record, "volume.part", b"chunk");
        let probe = Reconciler::new(&fixture.layout, true).classify(&record);
        assert_eq!(probe.status, DatasetStatus::Downloaded);

        fixture.write(&record, "volume.part.part", b"c");
        let probe = Reconciler::new(&fixture.layout, true).classify(&record);
        assert_eq!(probe.status, DatasetStatus::Warning);
    }

    #[test]
    fn target_that_is_a_file_is_error() {
        let fixture = Fixture::new();
        let record = remote();
        let dir = fixture.layout.record_dir(&record);
        fs::create_dir_all(dir.parent().unwrap().as_std_path()).unwrap();
        fs::write(dir.as_std_path(), b"oops").unwrap();
        let probe = Reconciler::new(&fixture.layout, true).classify(&record);
        assert_eq!(probe.status, DatasetStatus::Error);
    }

    #[cfg(unix)]
    #[test]
    fn broken_symlink_is_error() {
        let fixture = Fixture::new();
        let record = remote();
        fixture.write(&record, "readme.txt", b"hi");
        let dir = fixture.layout.record_dir(&record);
        std::os::unix::fs::symlink(dir.join("gone"), dir.join("a.zip")).unwrap();
        let probe = Reconciler::new(&fixture.layout, true).classify(&record);
        assert_eq!(probe.status, DatasetStatus::Error);
    }

    #[test]
    fn reconcile_is_deterministic_and_updates_records() {
        let fixture = Fixture::new();
        let mut records = vec![remote(), Record::manual("A", "t1", "d2")];
        fixture.write(&records[0], "readme.txt", b"hi");

        let first = Reconciler::new(&fixture.layout, true).reconcile(&mut records);
        let second = Reconciler::new(&fixture.layout, true).reconcile(&mut records);
        assert_eq!(first, second);
        assert_eq!(records[0].status(), DatasetStatus::Warning);
        assert_eq!(records[0].total_size_bytes, 2);
        assert_eq!(records[1].status(), DatasetStatus::Manual);
    }
}
