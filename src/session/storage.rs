use crate::session::config::{STORAGE_DIR_NAME, STORAGE_FILE_NAME};
use crate::session::types::StoreError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Key-value persistence behind the session store (browser local storage
/// semantics: string keys, string values)
pub trait KeyValueStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn save(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove a key; removing a missing key is not an error
    fn clear(&self, key: &str) -> Result<(), StoreError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Volatile storage, used by tests and for sessions that must not touch disk
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        lock(&self.entries).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<(), StoreError> {
        lock(&self.entries).remove(key);
        Ok(())
    }
}

/// All keys kept in one JSON object on disk, with an in-memory cache
pub struct FileStorage {
    path: PathBuf,
    cache: Mutex<Option<HashMap<String, String>>>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    /// Storage file in the platform's local data directory
    pub fn default_location() -> Result<Self, StoreError> {
        let dir = dirs::data_local_dir()
            .ok_or_else(|| StoreError::Storage("Could not determine local data directory".to_string()))?;
        Ok(Self::new(dir.join(STORAGE_DIR_NAME).join(STORAGE_FILE_NAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop the in-memory copy so the next read goes to disk
    pub fn clear_cache(&self) {
        *lock(&self.cache) = None;
    }

    fn read_entries(&self) -> Result<HashMap<String, String>, StoreError> {
        let mut cache = lock(&self.cache);
        if let Some(entries) = cache.as_ref() {
            return Ok(entries.clone());
        }

        let entries = if self.path.exists() {
            let contents = std::fs::read_to_string(&self.path)
                .map_err(|e| StoreError::Storage(format!("Failed to read storage file: {}", e)))?;
            serde_json::from_str(&contents)
                .map_err(|e| StoreError::Storage(format!("Failed to parse storage file: {}", e)))?
        } else {
            HashMap::new()
        };

        *cache = Some(entries.clone());
        Ok(entries)
    }

    fn write_entries(&self, entries: HashMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Storage(format!("Failed to create storage dir: {}", e)))?;
        }

        let json = serde_json::to_string_pretty(&entries)
            .map_err(|e| StoreError::Storage(format!("Failed to serialize storage: {}", e)))?;

        std::fs::write(&self.path, json)
            .map_err(|e| StoreError::Storage(format!("Failed to write storage file: {}", e)))?;

        *lock(&self.cache) = Some(entries);
        Ok(())
    }
}

impl KeyValueStore for FileStorage {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read_entries()?.get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.read_entries()?;
        entries.insert(key.to_string(), value.to_string());
        self.write_entries(entries)
    }

    fn clear(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.read_entries()?;
        if entries.remove(key).is_none() {
            return Ok(());
        }
        self.write_entries(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_storage_basics() {
        let storage = MemoryStorage::new();
        assert!(storage.is_empty());

        storage.save("authToken", "abc").unwrap();
        assert_eq!(storage.load("authToken").unwrap().as_deref(), Some("abc"));

        storage.clear("authToken").unwrap();
        storage.clear("authToken").unwrap();
        assert_eq!(storage.load("authToken").unwrap(), None);
    }

    #[test]
    fn test_file_storage_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join(STORAGE_FILE_NAME);

        let first = FileStorage::new(&path);
        first.save("user", "{\"id\":\"1\"}").unwrap();
        first.save("lmkKey", "123").unwrap();
        assert!(path.exists());

        let second = FileStorage::new(&path);
        assert_eq!(second.load("user").unwrap().as_deref(), Some("{\"id\":\"1\"}"));

        second.clear("lmkKey").unwrap();
        first.clear_cache();
        assert_eq!(first.load("lmkKey").unwrap(), None);
        assert_eq!(first.load("user").unwrap().as_deref(), Some("{\"id\":\"1\"}"));
    }

    #[test]
    fn test_file_storage_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path().join(STORAGE_FILE_NAME));
        assert_eq!(storage.load("user").unwrap(), None);
        storage.clear("user").unwrap();
        assert!(!storage.path().exists());
    }

    #[test]
    fn test_file_storage_corrupt_file_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(STORAGE_FILE_NAME);
        std::fs::write(&path, "not json").unwrap();

        let storage = FileStorage::new(&path);
        assert!(matches!(storage.load("user"), Err(StoreError::Storage(_))));
    }
}
