use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use serde_json::Value;

pub type Result<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    Io(io::Error),
    Json(serde_json::Error),
    NoConfigDir,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "storage io: {e}"),
            StorageError::Json(e) => write!(f, "storage json: {e}"),
            StorageError::NoConfigDir => write!(f, "could not determine config directory"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            StorageError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        StorageError::Io(e)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Json(e)
    }
}

// ---------------------------------------------------------------------------
// Storage trait
// ---------------------------------------------------------------------------

/// Durable key/value store for device records, the active selection, the
/// local device id and sequence baselines. No transactions; last writer wins.
pub trait Storage: Send + Sync {
    fn get_string(&self, key: &str) -> Option<String>;
    fn set_string(&self, key: &str, value: &str) -> Result<()>;
    fn get_int(&self, key: &str) -> Option<i64>;
    fn set_int(&self, key: &str, value: i64) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

fn int_of(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get_string(&self, key: &str) -> Option<String> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.get(key).and_then(|v| v.as_str()).map(String::from)
    }

    fn set_string(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_owned(), Value::String(value.to_owned()));
        Ok(())
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.get(key).and_then(int_of)
    }

    fn set_int(&self, key: &str, value: i64) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_owned(), Value::from(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON file
// ---------------------------------------------------------------------------

/// Key/value store kept as one JSON object on disk.
pub struct FileStorage {
    path: PathBuf,
    values: Mutex<Option<serde_json::Map<String, Value>>>,
}

impl FileStorage {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            values: Mutex::new(None),
        }
    }

    /// `~/.config/lounge-remote.json`
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(StorageError::NoConfigDir)?;
        Ok(config_dir.join("lounge-remote.json"))
    }

    fn load(&self) -> Result<serde_json::Map<String, Value>> {
        match std::fs::read_to_string(&self.path) {
            Ok(data) => {
                let map = serde_json::from_str(&data)?;
                tracing::info!("[storage] loaded {}", self.path.display());
                Ok(map)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(serde_json::Map::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Save atomically: write to temp file, then rename.
    fn save(&self, map: &serde_json::Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(map)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&serde_json::Map<String, Value>) -> T) -> T {
        let mut guard = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            let loaded = self.load().unwrap_or_else(|e| {
                tracing::warn!("[storage] ignoring unreadable {}: {e}", self.path.display());
                serde_json::Map::new()
            });
            *guard = Some(loaded);
        }
        f(guard.get_or_insert_with(serde_json::Map::new))
    }

    fn write(&self, f: impl FnOnce(&mut serde_json::Map<String, Value>)) -> Result<()> {
        let mut guard = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(self.load()?);
        }
        let map = guard.get_or_insert_with(serde_json::Map::new);
        f(map);
        self.save(map)
    }
}

impl Storage for FileStorage {
    fn get_string(&self, key: &str) -> Option<String> {
        self.read(|m| m.get(key).and_then(|v| v.as_str()).map(String::from))
    }

    fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.write(|m| {
            m.insert(key.to_owned(), Value::String(value.to_owned()));
        })
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        self.read(|m| m.get(key).and_then(int_of))
    }

    fn set_int(&self, key: &str, value: i64) -> Result<()> {
        self.write(|m| {
            m.insert(key.to_owned(), Value::from(value));
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.write(|m| {
            m.remove(key);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_roundtrip_and_remove() {
        let store = MemoryStorage::new();
        store.set_string("a", "x").unwrap();
        store.set_int("n", 41).unwrap();
        assert_eq!(store.get_string("a").as_deref(), Some("x"));
        assert_eq!(store.get_int("n"), Some(41));
        assert_eq!(store.get_int("a"), None);

        store.remove("a").unwrap();
        assert_eq!(store.get_string("a"), None);
    }

    #[test]
    fn file_storage_persists_across_instances() {
        let path = std::env::temp_dir().join(format!(
            "lounge-remote-test-{}.json",
            uuid::Uuid::new_v4()
        ));

        let first = FileStorage::new(path.clone());
        first.set_string("active_screen_id", "screen-1").unwrap();
        first.set_int("last_aid.screen-1", 17).unwrap();

        let second = FileStorage::new(path.clone());
        assert_eq!(second.get_string("active_screen_id").as_deref(), Some("screen-1"));
        assert_eq!(second.get_int("last_aid.screen-1"), Some(17));

        second.remove("active_screen_id").unwrap();
        assert_eq!(FileStorage::new(path.clone()).get_string("active_screen_id"), None);

        let _ = std::fs::remove_file(path);
    }
}
