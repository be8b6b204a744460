use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::selection::{DimensionFilter, FilterCriteria};

pub const CONFIG_FILE_NAME: &str = "de-profundis.json";
pub const DEFAULT_SPREADSHEET_ID: &str = "10ftkEU-FQsGCrrUW4lSuip0g5joUWD_04EJtUeywrLM";
pub const DEFAULT_SPREADSHEET_FILENAME: &str = "datasets_index.csv";
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// On-disk config file. Every field is optional; unset fields fall back to
/// the defaults of [`ConfigLoader::resolve_config`].
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub spreadsheet_id: Option<String>,
    #[serde(default)]
    pub spreadsheet_filename: Option<String>,
    #[serde(default)]
    pub manifest_path: Option<String>,
    #[serde(default)]
    pub include: Option<Vec<String>>,
    #[serde(default)]
    pub exclude: Option<Vec<String>>,
    #[serde(default)]
    pub include_projects: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_projects: Option<Vec<String>>,
    #[serde(default)]
    pub include_tasks: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_tasks: Option<Vec<String>>,
    #[serde(default)]
    pub extra_projects: Option<Vec<String>>,
    #[serde(default)]
    pub unzip: Option<bool>,
    #[serde(default)]
    pub delete_zip: Option<bool>,
    #[serde(default)]
    pub do_reset_scratch: Option<bool>,
    #[serde(default)]
    pub do_build_scratch: Option<bool>,
    #[serde(default)]
    pub do_erase_scratch: Option<bool>,
    #[serde(default)]
    pub do_erase: Option<bool>,
    #[serde(default)]
    pub do_unzip: Option<bool>,
    #[serde(default)]
    pub do_delete_zip: Option<bool>,
    #[serde(default)]
    pub clean_checkpoints: Option<CleanEntry>,
    #[serde(default)]
    pub clean_logs: Option<CleanEntry>,
    #[serde(default)]
    pub clean_outputs: Option<CleanEntry>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub bandwidth_limit: Option<u64>,
    #[serde(default)]
    pub verbose: Option<bool>,
    #[serde(default)]
    pub visual_gui: Option<bool>,
}

/// `true` cleans every project, a list cleans only those projects.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CleanEntry {
    Flag(bool),
    Projects(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanScope {
    All,
    Projects(Vec<String>),
}

impl CleanScope {
    pub fn covers(&self, project: &str) -> bool {
        match self {
            CleanScope::All => true,
            CleanScope::Projects(projects) => projects.iter().any(|p| p == project),
        }
    }
}

impl CleanEntry {
    fn into_scope(self) -> Option<CleanScope> {
        match self {
            CleanEntry::Flag(true) => Some(CleanScope::All),
            CleanEntry::Flag(false) => None,
            CleanEntry::Projects(projects) if projects.is_empty() => Some(CleanScope::All),
            CleanEntry::Projects(projects) => Some(CleanScope::Projects(projects)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestLocation {
    Spreadsheet { id: String, filename: Utf8PathBuf },
    File(Utf8PathBuf),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Actions {
    pub build_scratch: bool,
    pub erase_scratch: bool,
    pub erase_datasets: bool,
    pub unzip_all: bool,
    pub delete_zip_all: bool,
    pub clean_checkpoints: Option<CleanScope>,
    pub clean_logs: Option<CleanScope>,
    pub clean_outputs: Option<CleanScope>,
}

impl Actions {
    pub fn any_lifecycle(&self) -> bool {
        self.build_scratch
            || self.erase_scratch
            || self.erase_datasets
            || self.clean_checkpoints.is_some()
            || self.clean_logs.is_some()
            || self.clean_outputs.is_some()
    }
}

/// Immutable settings of one run, built once and passed by reference.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub root: Utf8PathBuf,
    pub manifest: ManifestLocation,
    pub filters: FilterCriteria,
    pub extra_projects: Vec<String>,
    pub actions: Actions,
    pub unzip: bool,
    pub delete_zip: bool,
    pub max_concurrency: usize,
    pub bandwidth_limit: Option<u64>,
    pub verbose: bool,
    pub visual_gui: bool,
}

impl Config {
    /// Values set in `overrides` win over the ones in `self`.
    pub fn merge(self, overrides: Config) -> Config {
        Config {
            root: overrides.root.or(self.root),
            spreadsheet_id: overrides.spreadsheet_id.or(self.spreadsheet_id),
            spreadsheet_filename: overrides.spreadsheet_filename.or(self.spreadsheet_filename),
            manifest_path: overrides.manifest_path.or(self.manifest_path),
            include: overrides.include.or(self.include),
            exclude: overrides.exclude.or(self.exclude),
            include_projects: overrides.include_projects.or(self.include_projects),
            exclude_projects: overrides.exclude_projects.or(self.exclude_projects),
            include_tasks: overrides.include_tasks.or(self.include_tasks),
            exclude_tasks: overrides.exclude_tasks.or(self.exclude_tasks),
            extra_projects: overrides.extra_projects.or(self.extra_projects),
            unzip: overrides.unzip.or(self.unzip),
            delete_zip: overrides.delete_zip.or(self.delete_zip),
            do_reset_scratch: overrides.do_reset_scratch.or(self.do_reset_scratch),
            do_build_scratch: overrides.do_build_scratch.or(self.do_build_scratch),
            do_erase_scratch: overrides.do_erase_scratch.or(self.do_erase_scratch),
            do_erase: overrides.do_erase.or(self.do_erase),
            do_unzip: overrides.do_unzip.or(self.do_unzip),
            do_delete_zip: overrides.do_delete_zip.or(self.do_delete_zip),
            clean_checkpoints: overrides.clean_checkpoints.or(self.clean_checkpoints),
            clean_logs: overrides.clean_logs.or(self.clean_logs),
            clean_outputs: overrides.clean_outputs.or(self.clean_outputs),
            max_concurrency: overrides.max_concurrency.or(self.max_concurrency),
            bandwidth_limit: overrides.bandwidth_limit.or(self.bandwidth_limit),
            verbose: overrides.verbose.or(self.verbose),
            visual_gui: overrides.visual_gui.or(self.visual_gui),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads the config file. An explicit path must exist; the default
    /// `de-profundis.json` in the current directory is optional.
    pub fn load(path: Option<&str>) -> Result<Config, SyncError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE_NAME),
        };

        if path.is_none() && !config_path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| SyncError::ConfigRead(config_path.clone()))?;
        serde_json::from_str(&content).map_err(|err| SyncError::ConfigParse(err.to_string()))
    }

    pub fn resolve(path: Option<&str>, overrides: Config) -> Result<RunConfig, SyncError> {
        let config = Self::load(path)?.merge(overrides);
        let default_root = match config.root {
            Some(_) => Utf8PathBuf::new(),
            None => default_root()?,
        };
        Self::resolve_config(config, default_root)
    }

    pub fn resolve_config(
        config: Config,
        default_root: Utf8PathBuf,
    ) -> Result<RunConfig, SyncError> {
        let root = config.root.map(Utf8PathBuf::from).unwrap_or(default_root);

        let manifest = match config.manifest_path {
            Some(path) => ManifestLocation::File(Utf8PathBuf::from(path)),
            None => ManifestLocation::Spreadsheet {
                id: config
                    .spreadsheet_id
                    .unwrap_or_else(|| DEFAULT_SPREADSHEET_ID.to_string()),
                filename: Utf8PathBuf::from(
                    config
                        .spreadsheet_filename
                        .unwrap_or_else(|| DEFAULT_SPREADSHEET_FILENAME.to_string()),
                ),
            },
        };

        let filters = FilterCriteria {
            datasets: DimensionFilter::new(
                config.include.unwrap_or_default(),
                config.exclude.unwrap_or_default(),
            ),
            projects: DimensionFilter::new(
                config.include_projects.unwrap_or_default(),
                config.exclude_projects.unwrap_or_default(),
            ),
            tasks: DimensionFilter::new(
                config.include_tasks.unwrap_or_default(),
                config.exclude_tasks.unwrap_or_default(),
            ),
        };
        filters.validate()?;

        let max_concurrency = config.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY);
        if max_concurrency == 0 {
            return Err(SyncError::InvalidConfig(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if config.bandwidth_limit == Some(0) {
            return Err(SyncError::InvalidConfig(
                "bandwidth_limit must be positive (omit it to disable throttling)".to_string(),
            ));
        }

        // A reset is an erase followed by a build.
        let reset = config.do_reset_scratch.unwrap_or(false);
        let actions = Actions {
            build_scratch: reset || config.do_build_scratch.unwrap_or(false),
            erase_scratch: reset || config.do_erase_scratch.unwrap_or(false),
            erase_datasets: config.do_erase.unwrap_or(false),
            unzip_all: config.do_unzip.unwrap_or(false),
            delete_zip_all: config.do_delete_zip.unwrap_or(false),
            clean_checkpoints: config.clean_checkpoints.and_then(CleanEntry::into_scope),
            clean_logs: config.clean_logs.and_then(CleanEntry::into_scope),
            clean_outputs: config.clean_outputs.and_then(CleanEntry::into_scope),
        };

        Ok(RunConfig {
            root,
            manifest,
            filters,
            extra_projects: config.extra_projects.unwrap_or_default(),
            actions,
            unzip: config.unzip.unwrap_or(true),
            delete_zip: config.delete_zip.unwrap_or(true),
            max_concurrency,
            bandwidth_limit: config.bandwidth_limit,
            verbose: config.verbose.unwrap_or(false),
            visual_gui: config.visual_gui.unwrap_or(false),
        })
    }
}

pub fn default_root() -> Result<Utf8PathBuf, SyncError> {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().to_path_buf()).ok())
        .ok_or_else(|| SyncError::Filesystem("unable to resolve home directory".to_string()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults_resolve_under_home() {
        let resolved =
            ConfigLoader::resolve_config(Config::default(), Utf8PathBuf::from("/home/me")).unwrap();
        assert_eq!(resolved.root, Utf8PathBuf::from("/home/me"));
        assert!(resolved.unzip);
        assert!(resolved.delete_zip);
        assert_eq!(resolved.max_concurrency, DEFAULT_MAX_CONCURRENCY);
        assert_eq!(resolved.bandwidth_limit, None);
        assert!(!resolved.actions.any_lifecycle());
        assert_matches!(resolved.manifest, ManifestLocation::Spreadsheet { .. });
    }

    #[test]
    fn reset_implies_erase_and_build() {
        let config = Config {
            do_reset_scratch: Some(true),
            ..Default::default()
        };
        let resolved = ConfigLoader::resolve_config(config, Utf8PathBuf::from("/r")).unwrap();
        assert!(resolved.actions.erase_scratch);
        assert!(resolved.actions.build_scratch);
    }

    #[test]
    fn clean_entries_parse_from_json() {
        let config: Config = serde_json::from_str(
            r#"{"clean_logs": true, "clean_outputs": ["A"], "clean_checkpoints": []}"#,
        )
        .unwrap();
        let resolved = ConfigLoader::resolve_config(config, Utf8PathBuf::from("/r")).unwrap();
        assert_eq!(resolved.actions.clean_logs, Some(CleanScope::All));
        assert_eq!(
            resolved.actions.clean_outputs,
            Some(CleanScope::Projects(vec!["A".to_string()]))
        );
        assert_eq!(resolved.actions.clean_checkpoints, Some(CleanScope::All));
    }

    #[test]
    fn overrides_win_over_file() {
        let file = Config {
            max_concurrency: Some(2),
            include_projects: Some(vec!["A".to_string()]),
            ..Default::default()
        };
        let cli = Config {
            max_concurrency: Some(8),
            ..Default::default()
        };
        let merged = file.merge(cli);
        assert_eq!(merged.max_concurrency, Some(8));
        assert_eq!(merged.include_projects, Some(vec!["A".to_string()]));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = Config {
            max_concurrency: Some(0),
            ..Default::default()
        };
        let err = ConfigLoader::resolve_config(config, Utf8PathBuf::from("/r")).unwrap_err();
        assert_matches!(err, SyncError::InvalidConfig(_));
    }

    #[test]
    fn conflicting_filters_are_rejected_at_load() {
        let config = Config {
            include: Some(vec!["d1".to_string()]),
            exclude: Some(vec!["d1".to_string()]),
            ..Default::default()
        };
        let err = ConfigLoader::resolve_config(config, Utf8PathBuf::from("/r")).unwrap_err();
        assert_matches!(err, SyncError::ConflictingFilter { .. });
    }
}
