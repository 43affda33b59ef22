use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::config::APP_DIR;

#[derive(Debug, Serialize, Deserialize, Default)]
struct ProgressFile {
    #[serde(default)]
    last_pages: HashMap<String, usize>,
}

/// Last page viewed in each gallery, kept in a small JSON file.
#[derive(Debug)]
pub struct ProgressStore {
    path: PathBuf,
    file: ProgressFile,
}

fn get_progress_path() -> PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR);

    fs::create_dir_all(&config_dir).ok();
    config_dir.join("progress.json")
}

impl ProgressStore {
    pub fn open_default() -> Self {
        Self::open(get_progress_path())
    }

    pub fn open(path: PathBuf) -> Self {
        let file = fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();

        Self { path, file }
    }

    pub fn load(&self, gallery_id: &str) -> Option<usize> {
        self.file.last_pages.get(gallery_id).copied()
    }

    pub fn save(&mut self, gallery_id: &str, page: usize) {
        if self.load(gallery_id) == Some(page) {
            return;
        }
        self.file.last_pages.insert(gallery_id.to_string(), page);

        let result = serde_json::to_string_pretty(&self.file)
            .map_err(|e| e.to_string())
            .and_then(|content| fs::write(&self.path, content).map_err(|e| e.to_string()));
        if let Err(e) = result {
            log::warn!("could not save reading progress to {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");

        let mut store = ProgressStore::open(path.clone());
        assert_eq!(store.load("42"), None);
        store.save("42", 7);
        store.save("99", 1);

        let reopened = ProgressStore::open(path);
        assert_eq!(reopened.load("42"), Some(7));
        assert_eq!(reopened.load("99"), Some(1));
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        fs::write(&path, "{ not json").unwrap();

        let mut store = ProgressStore::open(path.clone());
        assert_eq!(store.load("42"), None);
        store.save("42", 3);
        assert_eq!(ProgressStore::open(path).load("42"), Some(3));
    }
}
