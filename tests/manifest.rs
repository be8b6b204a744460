use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use de_profundis::config::ManifestLocation;
use de_profundis::domain::DatasetStatus;
use de_profundis::error::SyncError;
use de_profundis::manifest::{CsvFileSource, ManifestSource, open_source, parse_manifest};
use de_profundis::selection::{DimensionFilter, FilterCriteria, select};

const INDEX: &str = "\
Project,Task,Dataset Name,URLs
A,t1,d1,http://x/a.zip
A,t1,d2,Manual
A,t2,d4,http://x/d.zip; http://x/d.md5
B,t2,d3,http://x/b.zip
";

fn index_file(temp: &tempfile::TempDir) -> Utf8PathBuf {
    let path = Utf8PathBuf::from_path_buf(temp.path().join("index.csv")).unwrap();
    fs::write(path.as_std_path(), INDEX).unwrap();
    path
}

#[test]
fn local_file_manifest_feeds_selection() {
    let temp = tempfile::tempdir().unwrap();
    let source = CsvFileSource::new(index_file(&temp));
    let records = source.load().unwrap();
    assert_eq!(records.len(), 4);
    assert_eq!(records[1].status(), DatasetStatus::Manual);
    assert_eq!(records[2].urls(), ["http://x/d.zip", "http://x/d.md5"]);

    let criteria = FilterCriteria {
        tasks: DimensionFilter::new(vec!["t2".to_string()], vec![]),
        ..Default::default()
    };
    let selection = select(records, &criteria).unwrap();
    assert_eq!(selection.len(), 2);
    assert_eq!(selection.dropped(), 2);
    assert_eq!(selection.projects(), vec!["A", "B"]);
}

#[test]
fn configured_location_opens_a_file_source() {
    let temp = tempfile::tempdir().unwrap();
    let source = open_source(&ManifestLocation::File(index_file(&temp))).unwrap();
    assert_eq!(source.load().unwrap().len(), 4);
}

#[test]
fn missing_manifest_file_is_unavailable() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("absent.csv")).unwrap();
    let err = CsvFileSource::new(path).load().unwrap_err();
    assert_matches!(err, SyncError::ManifestUnavailable(_));
}

#[test]
fn row_without_urls_names_its_line() {
    let input = "Project,Task,Dataset,URL(s)\nA,t1,d1,http://x/a\nA,t1,d2,\n";
    let err = parse_manifest(input.as_bytes()).unwrap_err();
    assert_matches!(err, SyncError::ManifestRow { row: 3, .. });
}

#[test]
fn conflicting_criteria_fail_before_filtering() {
    let records = parse_manifest(INDEX.as_bytes()).unwrap();
    let criteria = FilterCriteria {
        datasets: DimensionFilter::new(vec!["d1".to_string()], vec!["d1".to_string()]),
        ..Default::default()
    };
    let err = select(records, &criteria).unwrap_err();
    assert_matches!(err, SyncError::ConflictingFilter { .. });
}

#[test]
fn urls_saving_to_one_file_name_reject_the_row() {
    let input = "Project,Task,Dataset,URLs\n\
        A,t1,d1,http://x/a.zip\n\
        A,t1,d2,http://a/data.csv;http://b/data.csv\n";
    let err = parse_manifest(input.as_bytes()).unwrap_err();
    assert_matches!(
        err,
        SyncError::ManifestRow { row: 3, ref message } if message.contains("data.csv")
    );
}
