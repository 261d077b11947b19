use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

/// Key/value table of tuned launch parameters.
///
/// Implementations must be safe to share between issuing threads; a lookup
/// racing with an insert for the same key may observe either state.
pub trait TuningStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u32>>;
    fn put(&self, key: &str, params: Vec<u32>);
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct InMemoryTuningStore {
    entries: Mutex<HashMap<String, Vec<u32>>>,
}

impl InMemoryTuningStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<u32>)>,
    {
        Self {
            entries: Mutex::new(entries.into_iter().collect()),
        }
    }
}

impl TuningStore for InMemoryTuningStore {
    fn get(&self, key: &str) -> Option<Vec<u32>> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn put(&self, key: &str, params: Vec<u32>) {
        if let Ok(mut guard) = self.entries.lock() {
            guard.insert(key.to_string(), params);
        }
    }

    fn len(&self) -> usize {
        self.entries.lock().map(|g| g.len()).unwrap_or(0)
    }
}

/// Tuning table persisted as a pretty-printed JSON list of `[key, params]`
/// pairs. Rewritten on every changed insert.
pub struct JsonFileTuningStore {
    entries: Mutex<HashMap<String, Vec<u32>>>,
    path: PathBuf,
}

impl JsonFileTuningStore {
    /// Open the table at `path`, loading existing entries. A missing file
    /// starts an empty table.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = HashMap::new();
        if path.exists() {
            let data = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read tuning table: {}", path.display()))?;
            let list: Vec<(String, Vec<u32>)> = serde_json::from_str(&data)
                .with_context(|| format!("Failed to parse tuning table: {}", path.display()))?;
            entries.extend(list);
            log::debug!(
                "loaded {} tuning entries from {}",
                entries.len(),
                path.display()
            );
        }
        Ok(Self {
            entries: Mutex::new(entries),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save_to_disk(&self, guard: &HashMap<String, Vec<u32>>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut list: Vec<(&String, &Vec<u32>)> = guard.iter().collect();
        list.sort_by(|a, b| a.0.cmp(b.0));
        let payload = serde_json::to_string_pretty(&list).unwrap_or_else(|_| "[]".to_string());
        std::fs::write(&self.path, payload)?;
        log::info!("tuning table saved to {:?}", self.path);
        Ok(())
    }
}

impl TuningStore for JsonFileTuningStore {
    fn get(&self, key: &str) -> Option<Vec<u32>> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn put(&self, key: &str, params: Vec<u32>) {
        if let Ok(mut guard) = self.entries.lock() {
            let changed = !matches!(guard.get(key), Some(existing) if *existing == params);
            if changed {
                guard.insert(key.to_string(), params);
                if let Err(err) = self.save_to_disk(&guard) {
                    log::warn!(
                        "failed to persist tuning table {}: {err}",
                        self.path.display()
                    );
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.lock().map(|g| g.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_put_get() {
        let store = InMemoryTuningStore::new();
        assert!(store.is_empty());
        store.put("k", vec![4, 4, 0]);
        assert_eq!(store.get("k"), Some(vec![4, 4, 0]));
        assert_eq!(store.get("missing"), None);
        store.put("k", vec![8, 2, 0]);
        assert_eq!(store.get("k"), Some(vec![8, 2, 0]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn json_store_persists_and_reloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("params.json");
        {
            let store = JsonFileTuningStore::open(&path).expect("open");
            assert!(store.is_empty());
            store.put("custom_add_kernel_1_2_3_1", vec![16, 16, 0]);
            store.put("fill_kernel", vec![4, 2, 8, 16]);
        }
        let text = std::fs::read_to_string(&path).expect("read");
        let parsed: Vec<(String, Vec<u32>)> = serde_json::from_str(&text).expect("json");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].0, "custom_add_kernel_1_2_3_1");

        let reopened = JsonFileTuningStore::open(&path).expect("reopen");
        assert_eq!(reopened.get("fill_kernel"), Some(vec![4, 2, 8, 16]));
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn json_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("params.json");
        std::fs::write(&path, "{not json").expect("write");
        assert!(JsonFileTuningStore::open(&path).is_err());
    }
}
