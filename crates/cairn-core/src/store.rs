//! Persistence for history records and credential entries.
//!
//! The store is a plain key/row collaborator: single-record atomicity and
//! nothing more. Two implementations ship with cairn: [`MemoryStore`] for
//! tests and ephemeral runs, and [`FileStore`] which keeps JSON files under a
//! state directory.

use crate::error::{CoreError, Result};
use crate::lifecycle::HistoryRecord;
use crate::sandbox::SandboxId;
use crate::vault::CredentialEntry;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Persistence operations consumed by the lifecycle manager and the vault.
pub trait Store: Send + Sync {
    /// Append one history record.
    fn save_history_record(&self, record: &HistoryRecord) -> Result<()>;

    /// All history records for a sandbox, oldest first.
    fn load_history(&self, id: SandboxId) -> Result<Vec<HistoryRecord>>;

    /// Delete all history for a sandbox. Returns the number of records removed.
    fn purge_history(&self, id: SandboxId) -> Result<usize>;

    /// Insert or overwrite the entry for `(entry.profile, entry.provider)`.
    fn save_credential(&self, entry: &CredentialEntry) -> Result<()>;

    /// Entry for a provider in a profile, `None` if absent.
    fn load_credential(&self, profile: &str, provider: &str) -> Result<Option<CredentialEntry>>;

    /// Delete an entry. Returns whether one existed.
    fn delete_credential(&self, profile: &str, provider: &str) -> Result<bool>;
}

fn poisoned<T>(_: T) -> CoreError {
    CoreError::Store("store lock poisoned".into())
}

// ============================================================================
// In-memory store
// ============================================================================

/// Store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    history: Mutex<HashMap<SandboxId, Vec<HistoryRecord>>>,
    credentials: Mutex<HashMap<(String, String), CredentialEntry>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn save_history_record(&self, record: &HistoryRecord) -> Result<()> {
        let mut history = self.history.lock().map_err(poisoned)?;
        history
            .entry(record.sandbox_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn load_history(&self, id: SandboxId) -> Result<Vec<HistoryRecord>> {
        let history = self.history.lock().map_err(poisoned)?;
        Ok(history.get(&id).cloned().unwrap_or_default())
    }

    fn purge_history(&self, id: SandboxId) -> Result<usize> {
        let mut history = self.history.lock().map_err(poisoned)?;
        Ok(history.remove(&id).map(|r| r.len()).unwrap_or(0))
    }

    fn save_credential(&self, entry: &CredentialEntry) -> Result<()> {
        let mut creds = self.credentials.lock().map_err(poisoned)?;
        creds.insert(
            (entry.profile.clone(), entry.provider.clone()),
            entry.clone(),
        );
        Ok(())
    }

    fn load_credential(&self, profile: &str, provider: &str) -> Result<Option<CredentialEntry>> {
        let creds = self.credentials.lock().map_err(poisoned)?;
        Ok(creds
            .get(&(profile.to_string(), provider.to_string()))
            .cloned())
    }

    fn delete_credential(&self, profile: &str, provider: &str) -> Result<bool> {
        let mut creds = self.credentials.lock().map_err(poisoned)?;
        Ok(creds
            .remove(&(profile.to_string(), provider.to_string()))
            .is_some())
    }
}

// ============================================================================
// File store
// ============================================================================

/// Store keeping JSON files under a root directory.
///
/// ```text
/// <root>/history/<sandbox-id>.jsonl
/// <root>/credentials/<profile>/<provider>.json
/// ```
///
/// Credential writes go to a temporary file that is renamed over the old
/// entry, so readers see either the previous or the new entry.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

fn io_err(context: &str, path: &Path, e: std::io::Error) -> CoreError {
    CoreError::Store(format!("{context} {}: {e}", path.display()))
}

/// Names used as path components must not traverse.
fn component(name: &str) -> Result<&str> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(name)
    } else {
        Err(CoreError::Store(format!("invalid store key: {name:?}")))
    }
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in ["history", "credentials"] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).map_err(|e| io_err("cannot create", &dir, e))?;
        }
        tracing::debug!(root = %root.display(), "Opened file store");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn history_path(&self, id: SandboxId) -> PathBuf {
        self.root.join("history").join(format!("{id}.jsonl"))
    }

    fn credential_path(&self, profile: &str, provider: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join("credentials")
            .join(component(profile)?)
            .join(format!("{}.json", component(provider)?)))
    }
}

impl Store for FileStore {
    fn save_history_record(&self, record: &HistoryRecord) -> Result<()> {
        let path = self.history_path(record.sandbox_id);
        let mut line =
            serde_json::to_string(record).map_err(|e| CoreError::Store(e.to_string()))?;
        line.push('\n');

        let _guard = self.write_lock.lock().map_err(poisoned)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err("cannot open", &path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| io_err("cannot append to", &path, e))
    }

    fn load_history(&self, id: SandboxId) -> Result<Vec<HistoryRecord>> {
        let path = self.history_path(id);
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err("cannot open", &path, e)),
        };

        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| io_err("cannot read", &path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    // A torn final line from a crash mid-append.
                    tracing::warn!(sandbox_id = %id, error = %e, "Skipping unreadable history line");
                }
            }
        }
        Ok(records)
    }

    fn purge_history(&self, id: SandboxId) -> Result<usize> {
        let count = self.load_history(id)?.len();
        let path = self.history_path(id);
        let _guard = self.write_lock.lock().map_err(poisoned)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(io_err("cannot remove", &path, e)),
        }
    }

    fn save_credential(&self, entry: &CredentialEntry) -> Result<()> {
        let path = self.credential_path(&entry.profile, &entry.provider)?;
        let json = serde_json::to_vec_pretty(entry).map_err(|e| CoreError::Store(e.to_string()))?;

        let _guard = self.write_lock.lock().map_err(poisoned)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err("cannot create", parent, e))?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &json).map_err(|e| io_err("cannot write", &tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| io_err("cannot replace", &path, e))
    }

    fn load_credential(&self, profile: &str, provider: &str) -> Result<Option<CredentialEntry>> {
        let path = self.credential_path(profile, provider)?;
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err("cannot read", &path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CoreError::Store(format!("corrupt credential entry {}: {e}", path.display())))
    }

    fn delete_credential(&self, profile: &str, provider: &str) -> Result<bool> {
        let path = self.credential_path(profile, provider)?;
        let _guard = self.write_lock.lock().map_err(poisoned)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err("cannot remove", &path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::HistoryEvent;
    use crate::sandbox::{Operation, SandboxState};
    use chrono::Utc;

    fn record(id: SandboxId, seq: u64) -> HistoryRecord {
        HistoryRecord {
            sandbox_id: id,
            seq,
            recorded_at: Utc::now(),
            event: HistoryEvent::Lifecycle {
                from: SandboxState::Requested,
                to: SandboxState::Ready,
                operation: Some(Operation::Create),
            },
        }
    }

    fn entry(provider: &str, blob: &str) -> CredentialEntry {
        CredentialEntry {
            provider: provider.into(),
            profile: "default".into(),
            blob: blob.into(),
            salt: "c2FsdA==".into(),
            updated_at: Utc::now(),
        }
    }

    fn exercise(store: &dyn Store) {
        let id = SandboxId::new();
        store.save_history_record(&record(id, 1)).unwrap();
        store.save_history_record(&record(id, 2)).unwrap();
        let history = store.load_history(id).unwrap();
        assert_eq!(history.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert!(store.load_history(SandboxId::new()).unwrap().is_empty());
        assert_eq!(store.purge_history(id).unwrap(), 2);
        assert!(store.load_history(id).unwrap().is_empty());

        store.save_credential(&entry("e2b", "first")).unwrap();
        store.save_credential(&entry("e2b", "second")).unwrap();
        let loaded = store.load_credential("default", "e2b").unwrap().unwrap();
        assert_eq!(loaded.blob, "second");
        assert!(store.load_credential("other", "e2b").unwrap().is_none());
        assert!(store.delete_credential("default", "e2b").unwrap());
        assert!(!store.delete_credential("default", "e2b").unwrap());
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = SandboxId::new();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.save_history_record(&record(id, 1)).unwrap();
            store.save_credential(&entry("morph", "blob")).unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.load_history(id).unwrap().len(), 1);
        assert!(store.load_credential("default", "morph").unwrap().is_some());
        assert!(!dir.path().join("credentials/default/morph.json.tmp").exists());
    }

    #[test]
    fn test_file_store_rejects_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.load_credential("../etc", "e2b").is_err());
        assert!(store.load_credential("default", "a/b").is_err());
    }
}
