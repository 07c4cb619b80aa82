use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrialStoreError {
    #[error("trial not found")]
    NotFound,
}

#[derive(Deserialize)]
struct TrialsFile {
    #[serde(default)]
    trials: Vec<TrialRecord>,
}

#[derive(Serialize)]
struct TrialsSnapshot<'a> {
    trials: &'a [TrialRecord],
}

/// Durable list of trial records, newest first. The whole list is rewritten
/// to one JSON file on every create; memory stays authoritative if a write
/// fails and the next successful write self-heals the snapshot.
pub struct TrialStore {
    path: PathBuf,
    trials: Vec<TrialRecord>,
}

impl TrialStore {
    /// Load the snapshot at `path`. A missing file or an unparseable
    /// snapshot degrades to an empty list.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let trials = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<TrialsFile>(&raw) {
                Ok(file) => file.trials,
                Err(e) => {
                    warn!(
                        "Corrupt trials snapshot at {}: {}; starting empty",
                        path.display(),
                        e
                    );
                    Vec::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(
                    "Failed to read trials snapshot at {}: {}; starting empty",
                    path.display(),
                    e
                );
                Vec::new()
            }
        };
        Self { path, trials }
    }

    pub fn list(&self) -> &[TrialRecord] {
        &self.trials
    }

    pub fn create(&mut self, title: Option<String>, description: Option<String>) -> TrialRecord {
        let record = TrialRecord {
            id: uuid::Uuid::new_v4().to_string(),
            title: title
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "Untitled Trial".to_owned()),
            description: description.unwrap_or_default(),
            created_at: Utc::now(),
        };
        self.trials.insert(0, record.clone());
        self.persist();
        record
    }

    pub fn get(&self, id: &str) -> Result<&TrialRecord, TrialStoreError> {
        self.trials
            .iter()
            .find(|t| t.id == id)
            .ok_or(TrialStoreError::NotFound)
    }

    fn persist(&self) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("Failed to create trials data dir: {}", e);
                return;
            }
        }
        let snapshot = TrialsSnapshot { trials: &self.trials };
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Err(e) = fs::write(&self.path, json) {
                    warn!("Failed to persist trials snapshot: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize trials snapshot: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_prepends_and_get_finds() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TrialStore::open(dir.path().join("trials.json"));

        let first = store.create(Some("First".to_owned()), Some("one".to_owned()));
        let second = store.create(Some("Second".to_owned()), None);
        assert_ne!(first.id, second.id);

        // Newest first.
        let listed: Vec<&str> = store.list().iter().map(|t| t.title.as_str()).collect();
        assert_eq!(listed, vec!["Second", "First"]);

        assert_eq!(store.get(&first.id).unwrap().description, "one");
        assert!(matches!(store.get("nope"), Err(TrialStoreError::NotFound)));
    }

    #[test]
    fn defaults_apply_to_blank_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TrialStore::open(dir.path().join("trials.json"));

        let record = store.create(None, None);
        assert_eq!(record.title, "Untitled Trial");
        assert_eq!(record.description, "");

        let record = store.create(Some(String::new()), None);
        assert_eq!(record.title, "Untitled Trial");
    }

    #[test]
    fn snapshot_round_trips_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trials.json");

        let created = {
            let mut store = TrialStore::open(&path);
            store.create(Some("Kept".to_owned()), Some("desc".to_owned()))
        };

        let store = TrialStore::open(&path);
        assert_eq!(store.list().len(), 1);
        let loaded = store.get(&created.id).unwrap();
        assert_eq!(loaded.title, "Kept");
        assert_eq!(loaded.created_at, created.created_at);
    }

    #[test]
    fn corrupt_snapshot_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trials.json");
        fs::write(&path, "{not json").unwrap();

        let store = TrialStore::open(&path);
        assert!(store.list().is_empty());
    }

    #[test]
    fn missing_trials_key_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trials.json");
        fs::write(&path, "{}").unwrap();

        let store = TrialStore::open(&path);
        assert!(store.list().is_empty());
    }
}
