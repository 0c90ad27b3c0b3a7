//! Subjects and trials: index subtrees annotated with a status record.
//!
//! Layout below the dataset prefix:
//!
//! ```text
//! <subject>/_subject.json          status record, marks the folder as a subject
//! <subject>/log.txt                engine stdout
//! <subject>/_errors.json           engine error detail
//! <subject>/trials/<trial>/_trial.json
//! <subject>/trials/<trial>/<input files>
//! <subject>/trials/<trial>/_results.json   completed-output marker
//! ```
//!
//! Units are rebuilt from a snapshot on every pass and go stale immediately;
//! re-read the status record before trusting it.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::index::{IndexSnapshot, ObjectMetadata, ObjectStoreIndex, join};

pub mod status;

pub use status::{StatusRecord, UnitState, read_status, write_status};

/// Status record of a subject; its presence makes a folder a subject.
pub const SUBJECT_MARKER: &str = "_subject.json";
/// Status record of a trial.
pub const TRIAL_MARKER: &str = "_trial.json";
/// Written by the engine for each trial it fitted.
pub const RESULTS_MARKER: &str = "_results.json";
/// Written by the engine when a run fails.
pub const ERRORS_FILE: &str = "_errors.json";
/// Engine stdout.
pub const LOG_FILE: &str = "log.txt";
/// Folder holding a subject's trials.
pub const TRIALS_DIR: &str = "trials";

/// A folder in the dataset that carries its own status record.
#[async_trait]
pub trait WorkUnit: Send + Sync {
    /// Key of the unit's folder.
    fn path(&self) -> &str;

    /// Key of the unit's status record.
    fn status_path(&self) -> String;

    /// Whether the engine has work to do here, judged from the index alone.
    fn could_process(&self) -> bool;

    /// Current record; `pending` when absent.
    async fn status(&self, index: &ObjectStoreIndex) -> Result<StatusRecord> {
        read_status(index, &self.status_path()).await
    }

    /// Replace the record.
    async fn set_status(&self, index: &ObjectStoreIndex, record: &StatusRecord) -> Result<()> {
        write_status(index, &self.status_path(), record).await
    }
}

/// One recording session below `<subject>/trials/`.
#[derive(Clone, Debug, PartialEq)]
pub struct Trial {
    /// Folder key.
    pub path: String,
    /// Last path segment.
    pub name: String,
    /// Direct files of the trial folder that are not `_`-prefixed markers.
    pub inputs: Vec<(String, ObjectMetadata)>,
    /// The trial's `_results.json`, if any.
    pub results: Option<ObjectMetadata>,
}

impl Trial {
    fn from_snapshot(snapshot: &IndexSnapshot, path: String) -> Self {
        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        let mut inputs = Vec::new();
        let mut results = None;
        if let Some(node) = snapshot.node(&path) {
            for (child_name, child) in &node.children {
                let Some(meta) = &child.metadata else {
                    continue;
                };
                if child_name == RESULTS_MARKER {
                    results = Some(meta.clone());
                } else if !child_name.starts_with('_') {
                    inputs.push((child.path.clone(), meta.clone()));
                }
            }
        }
        Self {
            path,
            name,
            inputs,
            results,
        }
    }

    /// Modification time of the most recent input.
    pub fn newest_input(&self) -> Option<DateTime<Utc>> {
        self.inputs.iter().map(|(_, meta)| meta.last_modified).max()
    }

    /// How long the newest unprocessed input has been waiting, if eligible.
    pub fn staleness(&self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.could_process() {
            return None;
        }
        Some(
            self.newest_input()
                .map(|at| now - at)
                .unwrap_or_else(Duration::zero)
                .max(Duration::zero()),
        )
    }
}

impl WorkUnit for Trial {
    fn path(&self) -> &str {
        &self.path
    }

    fn status_path(&self) -> String {
        join(&self.path, TRIAL_MARKER)
    }

    /// No results marker, or one older than the newest input.
    fn could_process(&self) -> bool {
        match (&self.results, self.newest_input()) {
            (None, _) => true,
            (Some(results), Some(newest)) => results.last_modified < newest,
            (Some(_), None) => false,
        }
    }
}

/// A participant folder holding `_subject.json` and a set of trials.
#[derive(Clone, Debug, PartialEq)]
pub struct Subject {
    /// Folder key.
    pub path: String,
    /// Last path segment.
    pub name: String,
    /// Trials found under `trials/`.
    pub trials: Vec<Trial>,
}

impl Subject {
    /// Build the subject at `path` from an index snapshot.
    pub fn from_snapshot(snapshot: &IndexSnapshot, path: &str) -> Self {
        let path = path.trim_matches('/').to_string();
        let trials_root = join(&path, TRIALS_DIR);
        let trials = snapshot
            .node(&trials_root)
            .map(|node| {
                node.children
                    .values()
                    .filter(|child| !child.is_file())
                    .map(|child| Trial::from_snapshot(snapshot, child.path.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name: path.rsplit('/').next().unwrap_or_default().to_string(),
            path,
            trials,
        }
    }

    /// Every subject below `prefix`, found by walking folders breadth first
    /// with immediate-children lookups and stopping at the first folder that
    /// holds a subject marker.
    pub fn discover(snapshot: &IndexSnapshot, prefix: &str) -> Vec<Subject> {
        let mut subjects = Vec::new();
        let mut queue = VecDeque::from([prefix.trim_matches('/').to_string()]);

        while let Some(folder) = queue.pop_front() {
            let children = snapshot.immediate_children(&folder);
            if children.iter().any(|name| name == SUBJECT_MARKER) {
                subjects.push(Subject::from_snapshot(snapshot, &folder));
                continue;
            }
            for name in children {
                let path = join(&folder, &name);
                if snapshot.node(&path).is_some_and(|node| !node.is_file()) {
                    queue.push_back(path);
                }
            }
        }
        subjects
    }

    /// Trials the engine still has to fit.
    pub fn eligible_trials(&self) -> impl Iterator<Item = &Trial> {
        self.trials.iter().filter(|trial| trial.could_process())
    }

    /// Key of `log.txt`.
    pub fn log_path(&self) -> String {
        join(&self.path, LOG_FILE)
    }

    /// Key of `_errors.json`.
    pub fn errors_path(&self) -> String {
        join(&self.path, ERRORS_FILE)
    }

    /// Largest staleness among eligible trials.
    pub fn staleness(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.trials.iter().filter_map(|trial| trial.staleness(now)).max()
    }
}

impl WorkUnit for Subject {
    fn path(&self) -> &str {
        &self.path
    }

    fn status_path(&self) -> String {
        join(&self.path, SUBJECT_MARKER)
    }

    fn could_process(&self) -> bool {
        self.eligible_trials().next().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryObjectStore;
    use std::sync::Arc;

    async fn index(keys: &[&str]) -> ObjectStoreIndex {
        let store = Arc::new(MemoryObjectStore::default());
        for key in keys {
            store.insert(key, "x");
        }
        let index = ObjectStoreIndex::new(store);
        index.refresh("").await.unwrap();
        index
    }

    #[tokio::test]
    async fn discovery_stops_at_subject_markers() {
        let index = index(&[
            "protected/a/s1/_subject.json",
            "protected/a/s1/trials/t1/markers.trc",
            "protected/b/s2/_subject.json",
            "protected/b/s2/nested/_subject.json",
            "protected/c/readme.txt",
        ])
        .await;

        let subjects = Subject::discover(&index.snapshot(), "protected/");
        let mut paths: Vec<_> = subjects.iter().map(|s| s.path.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["protected/a/s1", "protected/b/s2"]);
    }

    #[tokio::test]
    async fn trial_without_results_is_eligible() {
        let index = index(&[
            "d/s1/_subject.json",
            "d/s1/trials/t1/_trial.json",
            "d/s1/trials/t1/markers.trc",
        ])
        .await;
        let subject = Subject::from_snapshot(&index.snapshot(), "d/s1");

        assert_eq!(subject.trials.len(), 1);
        let trial = &subject.trials[0];
        assert_eq!(trial.name, "t1");
        assert_eq!(trial.inputs.len(), 1);
        assert!(trial.could_process());
        assert!(subject.could_process());
        assert_eq!(trial.status_path(), "d/s1/trials/t1/_trial.json");
    }

    #[tokio::test]
    async fn results_newer_than_inputs_make_trial_ineligible() {
        let index = index(&[
            "d/s1/_subject.json",
            "d/s1/trials/t1/markers.trc",
            "d/s1/trials/t1/_results.json",
        ])
        .await;
        let subject = Subject::from_snapshot(&index.snapshot(), "d/s1");
        assert!(!subject.could_process());
        assert_eq!(subject.staleness(Utc::now()), None);

        // Re-uploading an input makes the results stale again.
        index
            .upload_text("d/s1/trials/t1/markers.trc", "y")
            .await
            .unwrap();
        let subject = Subject::from_snapshot(&index.snapshot(), "d/s1");
        assert!(subject.could_process());
        assert!(subject.staleness(Utc::now()).is_some());
    }

    #[tokio::test]
    async fn subject_without_trials_is_not_eligible() {
        let index = index(&["d/s1/_subject.json", "d/s1/log.txt"]).await;
        let subject = Subject::from_snapshot(&index.snapshot(), "d/s1");
        assert!(subject.trials.is_empty());
        assert!(!subject.could_process());
    }

    #[tokio::test]
    async fn status_defaults_to_pending_and_round_trips() {
        let index = index(&["d/s1/_subject.json", "d/s1/trials/t1/markers.trc"]).await;
        let subject = Subject::from_snapshot(&index.snapshot(), "d/s1");
        let trial = subject.trials[0].clone();

        assert_eq!(trial.status(&index).await.unwrap().state, UnitState::Pending);
        trial
            .set_status(&index, &StatusRecord::new(UnitState::Processing, "w1"))
            .await
            .unwrap();
        let record = trial.status(&index).await.unwrap();
        assert_eq!(record.state, UnitState::Processing);
        assert_eq!(record.worker.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn corrupt_subject_status_is_reported() {
        let index = index(&["d/s1/_subject.json"]).await;
        let subject = Subject::from_snapshot(&index.snapshot(), "d/s1");
        // Seeded body is the bare string `x`.
        let err = subject.status(&index).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CorruptStatus);
    }
}
