//! Registry snapshot persistence
//!
//! The master periodically writes the registry to `ServersData.json` so a
//! restarted node does not self-promote with an empty registry.

use std::path::{Path, PathBuf};

use super::model::ServersData;
use crate::error::{Error, Result};

/// Snapshot file name inside the snapshot directory
pub const SNAPSHOT_FILE: &str = "ServersData.json";

/// Reads and writes the registry snapshot file
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Full path of the snapshot file
    pub fn path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the registry atomically (temp file, then rename)
    pub fn save(&self, registry: &ServersData) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let data = serde_json::to_vec_pretty(registry)?;
        let tmp = self.dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, self.path())?;

        tracing::debug!("Saved registry snapshot to {:?}", self.path());
        Ok(())
    }

    /// Load the registry, `Ok(None)` when no snapshot exists yet
    pub fn load(&self) -> Result<Option<ServersData>> {
        let path = self.path();
        let content = match std::fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let registry: ServersData = serde_json::from_slice(&content)
            .map_err(|e| Error::Snapshot(format!("{:?} is not a valid snapshot: {}", path, e)))?;
        registry
            .check_invariants()
            .map_err(|e| Error::Snapshot(format!("{:?}: {}", path, e)))?;

        Ok(Some(registry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServerElement;
    use tempfile::tempdir;

    #[test]
    fn test_missing_snapshot_is_none() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("not-yet"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshots"));

        let mut registry = ServersData::new();
        let mut srv = ServerElement::new("srv1");
        srv.app = "billing".into();
        srv.env = "staging".into();
        registry.upsert(srv);
        registry.touch(chrono::Utc::now());

        store.save(&registry).unwrap();
        assert!(store.path().exists());
        assert!(!dir.path().join("snapshots").join("ServersData.json.tmp").exists());

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, registry);
    }

    #[test]
    fn test_corrupt_snapshot_is_error() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        std::fs::write(store.path(), b"{ not json").unwrap();

        assert!(matches!(store.load(), Err(Error::Snapshot(_))));
    }
}
