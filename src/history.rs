use crate::models::{DownloadKind, DownloadStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Oldest entries beyond this are dropped
pub const MAX_HISTORY_ENTRIES: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Failed to access history file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Corrupt history file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub title: String,
    pub url: String,
    #[serde(rename = "type")]
    pub kind: DownloadKind,
    pub timestamp: DateTime<Utc>,
    pub status: DownloadStatus,
    pub progress: u8,
}

/// Download history, newest first, persisted as JSON
pub struct DownloadHistory {
    path: PathBuf,
    entries: Vec<HistoryEntry>,
}

impl DownloadHistory {
    /// Open the history at `path`. A missing file is an empty history.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).map_err(|source| HistoryError::Json {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(HistoryError::Io { path, source }),
        };
        Ok(Self { path, entries })
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn add(
        &mut self,
        title: &str,
        url: &str,
        kind: DownloadKind,
        status: DownloadStatus,
    ) -> Result<&HistoryEntry, HistoryError> {
        let now = Utc::now();
        let progress = match status {
            DownloadStatus::Completed => 100,
            DownloadStatus::Failed => 0,
        };
        self.entries.insert(
            0,
            HistoryEntry {
                id: now.timestamp_millis(),
                title: title.to_string(),
                url: url.to_string(),
                kind,
                timestamp: now,
                status,
                progress,
            },
        );
        self.entries.truncate(MAX_HISTORY_ENTRIES);
        self.save()?;
        Ok(&self.entries[0])
    }

    pub fn clear(&mut self) -> Result<(), HistoryError> {
        self.entries.clear();
        self.save()
    }

    fn save(&self) -> Result<(), HistoryError> {
        let json = serde_json::to_string_pretty(&self.entries).map_err(|source| HistoryError::Json {
            path: self.path.clone(),
            source,
        })?;
        fs::write(&self.path, json).map_err(|source| HistoryError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newest_first_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        let mut history = DownloadHistory::open(&path).unwrap();
        assert!(history.entries().is_empty());
        history
            .add("First - Page 1", "https://site/1/", DownloadKind::Images, DownloadStatus::Completed)
            .unwrap();
        history
            .add("Second", "https://site/2/", DownloadKind::Video, DownloadStatus::Failed)
            .unwrap();

        let reopened = DownloadHistory::open(&path).unwrap();
        assert_eq!(reopened.entries().len(), 2);
        assert_eq!(reopened.entries()[0].title, "Second");
        assert_eq!(reopened.entries()[0].progress, 0);
        assert_eq!(reopened.entries()[1].progress, 100);

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"type\": \"video\""));
    }

    #[test]
    fn test_capped_at_fifty() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = DownloadHistory::open(dir.path().join("h.json")).unwrap();
        for i in 0..60 {
            history
                .add(&format!("t{}", i), "u", DownloadKind::All, DownloadStatus::Completed)
                .unwrap();
        }
        assert_eq!(history.entries().len(), MAX_HISTORY_ENTRIES);
        assert_eq!(history.entries()[0].title, "t59");

        history.clear().unwrap();
        assert!(DownloadHistory::open(dir.path().join("h.json")).unwrap().entries().is_empty());
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(DownloadHistory::open(&path), Err(HistoryError::Json { .. })));
    }
}
