use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, instrument, warn};

use crate::error::Result;
use crate::types::{Session, SessionKey};

/// Durable session metadata store: one JSON map keyed by session-key,
/// persisted with tmp + rename so readers never observe a torn file.
///
/// Single writer per process — all read-modify-write goes through the
/// in-memory mutex; cross-process writers are not supported (the gateway
/// owns its state directory).
pub struct SessionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join("sessions.json"),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole map. A missing file reads as empty.
    pub fn load(&self) -> Result<HashMap<String, Session>> {
        let _guard = self.lock.lock().unwrap();
        self.load_unlocked()
    }

    fn load_unlocked(&self) -> Result<HashMap<String, Session>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(HashMap::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, key: &SessionKey) -> Result<Option<Session>> {
        Ok(self.load()?.remove(&key.format()))
    }

    /// Read-modify-write under the single writer.
    ///
    /// `f` receives the current record (or `None`) and returns the next;
    /// returning `None` deletes the entry. Any I/O failure is fatal to this
    /// call and surfaces to the caller unchanged.
    #[instrument(skip_all, fields(key = %key))]
    pub fn mutate<F>(&self, key: &SessionKey, f: F) -> Result<Option<Session>>
    where
        F: FnOnce(Option<Session>) -> Option<Session>,
    {
        let _guard = self.lock.lock().unwrap();
        let mut map = self.load_unlocked()?;
        let key_str = key.format();

        let current = map.remove(&key_str);
        let next = f(current);

        match &next {
            Some(session) => {
                map.insert(key_str, session.clone());
            }
            None => {
                debug!("session entry removed");
            }
        }

        self.persist(&map)?;
        Ok(next)
    }

    /// Return the session for `key`, creating a fresh one if absent.
    pub fn get_or_create(&self, key: &SessionKey) -> Result<Session> {
        let created = self.mutate(key, |current| {
            Some(match current {
                Some(existing) => existing,
                None => Session::fresh(),
            })
        })?;
        // mutate returned what the closure produced, which is always Some here
        Ok(created.unwrap_or_else(Session::fresh))
    }

    fn persist(&self, map: &HashMap<String, Session>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(map)?;
        std::fs::write(&tmp, raw)?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            warn!(error = %e, "session store rename failed");
            return Err(e.into());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeyScope;

    fn key(n: &str) -> SessionKey {
        SessionKey::new("main", "telegram", KeyScope::Dm, n)
    }

    #[test]
    fn mutate_creates_and_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let created = store
            .mutate(&key("1"), |current| {
                assert!(current.is_none());
                Some(Session::fresh())
            })
            .unwrap()
            .unwrap();

        let updated = store
            .mutate(&key("1"), |current| {
                let mut s = current.expect("entry must exist");
                s.compaction_count += 1;
                Some(s)
            })
            .unwrap()
            .unwrap();

        assert_eq!(updated.session_id, created.session_id);
        assert_eq!(updated.compaction_count, 1);
    }

    #[test]
    fn mutate_none_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        store.get_or_create(&key("1")).unwrap();
        store.mutate(&key("1"), |_| None).unwrap();

        assert!(store.get(&key("1")).unwrap().is_none());
    }

    #[test]
    fn store_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let first = SessionStore::new(dir.path());
        let session = first.get_or_create(&key("persist")).unwrap();

        let second = SessionStore::new(dir.path());
        let loaded = second.get(&key("persist")).unwrap().unwrap();
        assert_eq!(loaded.session_id, session.session_id);
    }

    #[test]
    fn get_or_create_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let a = store.get_or_create(&key("same")).unwrap();
        let b = store.get_or_create(&key("same")).unwrap();
        assert_eq!(a.session_id, b.session_id);
    }
}
