use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::Record;
use crate::error::SyncError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionFilter {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl DimensionFilter {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        Self { include, exclude }
    }

    pub fn accepts(&self, value: &str) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|v| v == value);
        let excluded = !self.exclude.is_empty() && self.exclude.iter().any(|v| v == value);
        included && !excluded
    }

    fn first_conflict(&self) -> Option<&str> {
        let include = self.include.iter().map(String::as_str).collect::<BTreeSet<_>>();
        self.exclude
            .iter()
            .map(String::as_str)
            .filter(|value| include.contains(value))
            .min()
    }
}

/// Include/exclude lists over the three record dimensions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCriteria {
    #[serde(default)]
    pub datasets: DimensionFilter,
    #[serde(default)]
    pub projects: DimensionFilter,
    #[serde(default)]
    pub tasks: DimensionFilter,
}

impl FilterCriteria {
    pub fn validate(&self) -> Result<(), SyncError> {
        let dimensions = [
            ("dataset", &self.datasets),
            ("project", &self.projects),
            ("task", &self.tasks),
        ];
        for (dimension, filter) in dimensions {
            if let Some(value) = filter.first_conflict() {
                return Err(SyncError::ConflictingFilter {
                    dimension: dimension.to_string(),
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.datasets.accepts(&record.name)
            && self.projects.accepts(&record.project)
            && self.tasks.accepts(&record.task)
    }
}

/// Records chosen for this run, in manifest order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selection {
    records: Vec<Record>,
    dropped: usize,
}

impl Selection {
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Project keys present in the selection, sorted and deduplicated.
    pub fn projects(&self) -> Vec<String> {
        self.records
            .iter()
            .map(|record| record.project.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

pub fn select(records: Vec<Record>, criteria: &FilterCriteria) -> Result<Selection, SyncError> {
    criteria.validate()?;
    let total = records.len();
    let records = records
        .into_iter()
        .filter(|record| criteria.matches(record))
        .collect::<Vec<_>>();
    Ok(Selection {
        dropped: total - records.len(),
        records,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn manifest() -> Vec<Record> {
        vec![
            Record::from_url_field("A", "t1", "d1", "http://x/a.zip"),
            Record::from_url_field("A", "t1", "d2", "manual"),
            Record::from_url_field("A", "t2", "d4", "http://x/d.zip"),
            Record::from_url_field("B", "t2", "d3", "http://x/b.zip"),
            Record::from_url_field("C", "t3", "d5", "http://x/e.zip"),
        ]
    }

    fn names(selection: &Selection) -> Vec<&str> {
        selection.records().iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn empty_criteria_selects_everything() {
        let selection = select(manifest(), &FilterCriteria::default()).unwrap();
        assert_eq!(selection.len(), 5);
        assert_eq!(selection.dropped(), 0);
    }

    #[test]
    fn include_projects_keeps_only_listed() {
        let criteria = FilterCriteria {
            projects: DimensionFilter::new(strings(&["A"]), vec![]),
            ..Default::default()
        };
        let selection = select(manifest(), &criteria).unwrap();
        assert_eq!(names(&selection), vec!["d1", "d2", "d4"]);
        assert_eq!(selection.projects(), vec!["A"]);
    }

    #[test]
    fn dimensions_intersect() {
        let criteria = FilterCriteria {
            datasets: DimensionFilter::new(vec![], strings(&["d1"])),
            projects: DimensionFilter::new(strings(&["A", "B"]), vec![]),
            tasks: DimensionFilter::new(vec![], strings(&["t2"])),
        };
        let selection = select(manifest(), &criteria).unwrap();
        assert_eq!(names(&selection), vec!["d2"]);
    }

    #[test]
    fn selection_is_idempotent() {
        let criteria = FilterCriteria {
            tasks: DimensionFilter::new(strings(&["t1", "t2"]), vec![]),
            projects: DimensionFilter::new(vec![], strings(&["B"])),
            ..Default::default()
        };
        let once = select(manifest(), &criteria).unwrap();
        let twice = select(once.clone().into_records(), &criteria).unwrap();
        assert_eq!(once.records(), twice.records());
    }

    #[test]
    fn application_order_does_not_matter() {
        let by_project = FilterCriteria {
            projects: DimensionFilter::new(strings(&["A"]), vec![]),
            ..Default::default()
        };
        let by_task = FilterCriteria {
            tasks: DimensionFilter::new(vec![], strings(&["t2"])),
            ..Default::default()
        };
        let combined = FilterCriteria {
            projects: by_project.projects.clone(),
            tasks: by_task.tasks.clone(),
            ..Default::default()
        };

        let project_then_task =
            select(select(manifest(), &by_project).unwrap().into_records(), &by_task).unwrap();
        let task_then_project =
            select(select(manifest(), &by_task).unwrap().into_records(), &by_project).unwrap();
        let at_once = select(manifest(), &combined).unwrap();

        assert_eq!(project_then_task.records(), task_then_project.records());
        assert_eq!(project_then_task.records(), at_once.records());
    }

    #[test]
    fn overlapping_include_exclude_is_rejected() {
        let criteria = FilterCriteria {
            tasks: DimensionFilter::new(strings(&["t1", "t2"]), strings(&["t2"])),
            ..Default::default()
        };
        let err = select(manifest(), &criteria).unwrap_err();
        assert_matches!(
            err,
            SyncError::ConflictingFilter { ref dimension, ref value }
                if dimension == "task" && value == "t2"
        );
    }
}
