use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CleanScope;
use crate::confirm::{ConfirmationToken, DestructiveAction};
use crate::domain::{Record, RecordId, ScratchRoot};
use crate::error::SyncError;

/// `<root>/scratch/{datasets,checkpoints,logs,outputs}/<project>/...`
#[derive(Debug, Clone)]
pub struct ScratchLayout {
    scratch_dir: Utf8PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RootState {
    Absent,
    Empty,
    Built,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathFailure {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub created: Vec<String>,
    pub existing: Vec<String>,
    pub failed: Vec<PathFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub removed: Vec<String>,
    pub failed: Vec<PathFailure>,
}

impl SweepReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn fail(&mut self, path: &Utf8Path, err: impl ToString) {
        let error = err.to_string();
        warn!(path = %path, error = %error, "could not remove path");
        self.failed.push(PathFailure {
            path: path.to_string(),
            error,
        });
    }

    fn absorb(&mut self, other: SweepReport) {
        self.removed.extend(other.removed);
        self.failed.extend(other.failed);
    }
}

impl ScratchLayout {
    pub fn new(root: &Utf8Path) -> Self {
        Self {
            scratch_dir: root.join("scratch"),
        }
    }

    /// Project folders kept next to `scratch/`. Hidden entries and plain
    /// files are skipped.
    pub fn discover_projects(&self) -> Vec<String> {
        let Some(root) = self.scratch_dir.parent() else {
            return Vec::new();
        };
        let entries = match sorted_entries(root) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(root = %root, error = %err, "could not list project folders");
                return Vec::new();
            }
        };
        entries
            .into_iter()
            .filter(|path| *path != self.scratch_dir && path.as_std_path().is_dir())
            .filter_map(|path| path.file_name().map(str::to_string))
            .filter(|name| !name.starts_with('.'))
            .collect()
    }

    pub fn root_dir(&self, root: ScratchRoot) -> Utf8PathBuf {
        self.scratch_dir.join(root.dir_name())
    }

    pub fn project_dir(&self, root: ScratchRoot, project: &str) -> Utf8PathBuf {
        self.root_dir(root).join(project)
    }

    pub fn dataset_dir(&self, id: &RecordId) -> Utf8PathBuf {
        self.project_dir(ScratchRoot::Datasets, &id.project)
            .join(&id.task)
            .join(&id.name)
    }

    pub fn record_dir(&self, record: &Record) -> Utf8PathBuf {
        self.dataset_dir(&record.id())
    }

    pub fn root_state(&self, root: ScratchRoot) -> RootState {
        let dir = self.root_dir(root);
        match fs::read_dir(dir.as_std_path()) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    RootState::Built
                } else {
                    RootState::Empty
                }
            }
            Err(_) => RootState::Absent,
        }
    }

    /// Creates `<root>/<project>` under all four roots. Never removes or
    /// rewrites anything that already exists.
    pub fn build(&self, projects: &[String]) -> BuildReport {
        let mut report = BuildReport::default();
        for root in ScratchRoot::ALL {
            let root_dir = self.root_dir(root);
            if !ensure_dir(&root_dir, &mut report) {
                continue;
            }
            for project in projects {
                ensure_dir(&root_dir.join(project), &mut report);
            }
        }
        info!(
            created = report.created.len(),
            existing = report.existing.len(),
            failed = report.failed.len(),
            "built scratch hierarchy"
        );
        report
    }

    /// Removes everything inside one root; the root directory itself stays.
    pub fn erase(
        &self,
        root: ScratchRoot,
        token: ConfirmationToken,
    ) -> Result<SweepReport, SyncError> {
        authorize(&token, &[DestructiveAction::Erase(root), DestructiveAction::EraseScratch])?;
        Ok(self.erase_root(root))
    }

    pub fn erase_scratch(&self, token: ConfirmationToken) -> Result<SweepReport, SyncError> {
        authorize(&token, &[DestructiveAction::EraseScratch])?;
        let mut report = SweepReport::default();
        for root in ScratchRoot::ALL {
            report.absorb(self.erase_root(root));
        }
        Ok(report)
    }

    /// Removes files, never directories, below the selected projects of one
    /// root.
    pub fn clean(
        &self,
        root: ScratchRoot,
        scope: &CleanScope,
        token: ConfirmationToken,
    ) -> Result<SweepReport, SyncError> {
        authorize(&token, &[DestructiveAction::Clean(root)])?;
        let root_dir = self.root_dir(root);
        let mut report = SweepReport::default();
        let projects = match sorted_entries(&root_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(report),
            Err(err) => {
                report.fail(&root_dir, err);
                return Ok(report);
            }
        };
        for path in projects {
            let project = path.file_name().unwrap_or_default();
            if !scope.covers(project) {
                continue;
            }
            match fs::symlink_metadata(path.as_std_path()) {
                Ok(meta) if meta.is_dir() => sweep(&path, false, &mut report),
                Ok(_) => debug!(path = %path, "skipping non-directory project entry"),
                Err(err) => report.fail(&path, err),
            }
        }
        info!(
            root = %root,
            removed = report.removed.len(),
            failed = report.failed.len(),
            "cleaned scratch root"
        );
        Ok(report)
    }

    fn erase_root(&self, root: ScratchRoot) -> SweepReport {
        let root_dir = self.root_dir(root);
        let mut report = SweepReport::default();
        match fs::symlink_metadata(root_dir.as_std_path()) {
            Ok(meta) if meta.is_dir() => sweep(&root_dir, true, &mut report),
            Ok(_) => report.fail(&root_dir, "not a directory"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => report.fail(&root_dir, err),
        }
        info!(
            root = %root,
            removed = report.removed.len(),
            failed = report.failed.len(),
            "erased scratch root"
        );
        report
    }
}

fn authorize(token: &ConfirmationToken, accepted: &[DestructiveAction]) -> Result<(), SyncError> {
    if accepted.iter().any(|action| token.authorizes(*action)) {
        return Ok(());
    }
    Err(SyncError::Unauthorized {
        granted: token.action().to_string(),
        requested: accepted
            .first()
            .map(ToString::to_string)
            .unwrap_or_default(),
    })
}

fn ensure_dir(path: &Utf8Path, report: &mut BuildReport) -> bool {
    match fs::symlink_metadata(path.as_std_path()) {
        Ok(meta) if meta.is_dir() => {
            report.existing.push(path.to_string());
            true
        }
        Ok(_) => {
            report.failed.push(PathFailure {
                path: path.to_string(),
                error: "exists and is not a directory".to_string(),
            });
            false
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            match fs::create_dir_all(path.as_std_path()) {
                Ok(()) => {
                    report.created.push(path.to_string());
                    true
                }
                Err(err) => {
                    report.failed.push(PathFailure {
                        path: path.to_string(),
                        error: err.to_string(),
                    });
                    false
                }
            }
        }
        Err(err) => {
            report.failed.push(PathFailure {
                path: path.to_string(),
                error: err.to_string(),
            });
            false
        }
    }
}

/// Depth-first removal below `dir`. Each failing path is recorded and the
/// sweep moves on to its siblings.
fn sweep(dir: &Utf8Path, remove_dirs: bool, report: &mut SweepReport) {
    let entries = match sorted_entries(dir) {
        Ok(entries) => entries,
        Err(err) => {
            report.fail(dir, err);
            return;
        }
    };
    for path in entries {
        let meta = match fs::symlink_metadata(path.as_std_path()) {
            Ok(meta) => meta,
            Err(err) => {
                report.fail(&path, err);
                continue;
            }
        };
        if meta.is_dir() {
            sweep(&path, remove_dirs, report);
            if remove_dirs {
                match fs::remove_dir(path.as_std_path()) {
                    Ok(()) => report.removed.push(path.to_string()),
                    Err(err) => report.fail(&path, err),
                }
            }
        } else {
            match fs::remove_file(path.as_std_path()) {
                Ok(()) => report.removed.push(path.to_string()),
                Err(err) => report.fail(&path, err),
            }
        }
    }
}

pub(crate) fn sorted_entries(dir: &Utf8Path) -> io::Result<Vec<Utf8PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir.as_std_path())? {
        let entry = entry?;
        let path = Utf8PathBuf::from_path_buf(entry.path()).map_err(|path| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("non-utf8 path {}", path.display()),
            )
        })?;
        paths.push(path);
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::confirm::{AssumeYes, Confirm};

    fn layout() -> (tempfile::TempDir, ScratchLayout) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let layout = ScratchLayout::new(&root);
        (temp, layout)
    }

    fn token(action: DestructiveAction) -> ConfirmationToken {
        AssumeYes.confirm(action).unwrap()
    }

    #[test]
    fn dataset_dir_layout() {
        let layout = ScratchLayout::new(Utf8Path::new("/home/me"));
        let dir = layout.dataset_dir(&RecordId::new("A", "t1", "d1"));
        assert_eq!(dir, Utf8PathBuf::from("/home/me/scratch/datasets/A/t1/d1"));
    }

    #[test]
    fn build_reports_created_then_existing() {
        let (_temp, layout) = layout();
        let projects = vec!["A".to_string(), "B".to_string()];
        assert_eq!(layout.root_state(ScratchRoot::Logs), RootState::Absent);

        let first = layout.build(&projects);
        assert_eq!(first.created.len(), 4 + 8);
        assert!(first.existing.is_empty());
        assert_eq!(layout.root_state(ScratchRoot::Logs), RootState::Built);

        let second = layout.build(&projects);
        assert!(second.created.is_empty());
        assert_eq!(second.existing.len(), 12);
    }

    #[test]
    fn build_flags_files_in_the_way() {
        let (_temp, layout) = layout();
        layout.build(&[]);
        fs::write(layout.project_dir(ScratchRoot::Outputs, "A").as_std_path(), b"x").unwrap();

        let report = layout.build(&["A".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].path.ends_with("outputs/A"));
        assert_eq!(report.created.len(), 3);
    }

    #[test]
    fn discovers_project_folders_next_to_scratch() {
        let (temp, layout) = layout();
        for dir in ["proj-b", "proj-a", ".cache"] {
            fs::create_dir(temp.path().join(dir)).unwrap();
        }
        fs::write(temp.path().join("notes.txt"), b"x").unwrap();
        layout.build(&[]);
        assert_eq!(layout.discover_projects(), vec!["proj-a", "proj-b"]);
    }

    #[test]
    fn erase_keeps_root_and_removes_contents() {
        let (_temp, layout) = layout();
        layout.build(&["A".to_string()]);
        let nested = layout.project_dir(ScratchRoot::Datasets, "A").join("t1/d1");
        fs::create_dir_all(nested.as_std_path()).unwrap();
        fs::write(nested.join("a.csv").as_std_path(), b"1").unwrap();

        let report = layout
            .erase(ScratchRoot::Datasets, token(DestructiveAction::Erase(ScratchRoot::Datasets)))
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(layout.root_state(ScratchRoot::Datasets), RootState::Empty);
        assert_eq!(layout.root_state(ScratchRoot::Logs), RootState::Built);
    }

    #[test]
    fn erase_requires_matching_token() {
        let (_temp, layout) = layout();
        let err = layout
            .erase(ScratchRoot::Datasets, token(DestructiveAction::Clean(ScratchRoot::Datasets)))
            .unwrap_err();
        assert_matches!(err, SyncError::Unauthorized { .. });
    }

    #[test]
    fn clean_removes_only_files_of_scoped_projects() {
        let (_temp, layout) = layout();
        layout.build(&["A".to_string(), "B".to_string()]);
        let a_run = layout.project_dir(ScratchRoot::Logs, "A").join("run1");
        let b_dir = layout.project_dir(ScratchRoot::Logs, "B");
        fs::create_dir_all(a_run.as_std_path()).unwrap();
        fs::write(a_run.join("events.log").as_std_path(), b"1").unwrap();
        fs::write(b_dir.join("events.log").as_std_path(), b"1").unwrap();

        let scope = CleanScope::Projects(vec!["A".to_string()]);
        let report = layout
            .clean(ScratchRoot::Logs, &scope, token(DestructiveAction::Clean(ScratchRoot::Logs)))
            .unwrap();
        assert_eq!(report.removed.len(), 1);
        assert!(a_run.as_std_path().is_dir());
        assert!(!a_run.join("events.log").as_std_path().exists());
        assert!(b_dir.join("events.log").as_std_path().exists());
    }
}
