use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyhow::{Context, Result};
use tracing::{debug, instrument, trace};

/// A private string key/value namespace owned by this application
pub trait KeyValueStore: Send + Sync {
    /// Returns the value stored under `key`, if any
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Stores all `entries` in one write
    fn put_all(&self, entries: &[(&str, String)]) -> Result<()>;
}

/// Key/value namespace persisted as a JSON object in `<dir>/<namespace>.json`
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: &Path, namespace: &str) -> Self {
        Self { path: dir.join(format!("{namespace}.json")) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            trace!(path = %self.path.display(), "Store file doesn't exist yet");
            return Ok(BTreeMap::new());
        }
        let content =
            fs_err::read_to_string(&self.path).context("Failed to read key/value store")?;
        serde_json::from_str(&content).context("Failed to parse key/value store")
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_map()?.remove(key))
    }

    #[instrument(level = "debug", skip(self, entries), fields(path = %self.path.display()), err)]
    fn put_all(&self, entries: &[(&str, String)]) -> Result<()> {
        // A broken file is replaced rather than preserved
        let mut map = self.read_map().unwrap_or_default();
        for (key, value) in entries {
            map.insert((*key).to_string(), value.clone());
        }
        let json = serde_json::to_string_pretty(&map).context("Failed to serialize store")?;

        let dir = self.path.parent().context("Store path has no parent directory")?;
        fs_err::create_dir_all(dir).context("Failed to create store directory")?;

        // Write to a sibling temp file first so a crash never leaves a half-written store
        let mut tmp =
            tempfile::NamedTempFile::new_in(dir).context("Failed to create temporary file")?;
        tmp.write_all(json.as_bytes()).context("Failed to write key/value store")?;
        tmp.as_file().sync_all().context("Failed to sync key/value store")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))
                .context("Failed to restrict store permissions")?;
        }
        tmp.persist(&self.path).context("Failed to replace key/value store")?;
        debug!(keys = entries.len(), "Key/value store updated");
        Ok(())
    }
}

/// In-process key/value namespace, mostly useful for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<BTreeMap<String, String>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `put_all` calls seen so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Overwrites a single slot without counting it as a write
    pub fn set(&self, key: &str, value: impl Into<String>) {
        self.map.lock().unwrap_or_else(PoisonError::into_inner).insert(key.to_string(), value.into());
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned())
    }

    fn put_all(&self, entries: &[(&str, String)]) -> Result<()> {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in entries {
            map.insert((*key).to_string(), value.clone());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
