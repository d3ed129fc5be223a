//! On-disk persistence for database snapshots
//!
//! Stores one snapshot per space as `{space_key}.json` in a directory.

use std::path::{Path, PathBuf};

use super::PipelineError;
use crate::item::DatabaseSnapshot;
use crate::keys::PublicKey;

fn io_error(e: std::io::Error) -> PipelineError {
    PipelineError::SnapshotError(e.to_string())
}

#[derive(Clone, Debug)]
pub struct SnapshotStore {
    storage_path: PathBuf,
}

impl SnapshotStore {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
        }
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    fn path_for(&self, space_key: &PublicKey) -> PathBuf {
        self.storage_path.join(format!("{}.json", space_key.to_hex()))
    }

    /// Write the snapshot of a space, replacing any previous one.
    pub fn save(&self, space_key: &PublicKey, snapshot: &DatabaseSnapshot) -> Result<(), PipelineError> {
        std::fs::create_dir_all(&self.storage_path).map_err(io_error)?;

        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| PipelineError::SnapshotError(e.to_string()))?;

        // Write then rename so a crash never leaves a truncated snapshot.
        let path = self.path_for(space_key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_error)?;
        std::fs::rename(&tmp, &path).map_err(io_error)
    }

    /// Latest snapshot of a space, if one was saved.
    pub fn load(&self, space_key: &PublicKey) -> Result<Option<DatabaseSnapshot>, PipelineError> {
        let path = self.path_for(space_key);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&path).map_err(io_error)?;
        let snapshot = serde_json::from_slice(&data)
            .map_err(|e| PipelineError::SnapshotError(e.to_string()))?;
        Ok(Some(snapshot))
    }

    pub fn remove(&self, space_key: &PublicKey) -> Result<bool, PipelineError> {
        let path = self.path_for(space_key);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path).map_err(io_error)?;
        Ok(true)
    }

    /// Spaces with a saved snapshot.
    pub fn spaces(&self) -> Result<Vec<PublicKey>, PipelineError> {
        if !self.storage_path.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.storage_path).map_err(io_error)? {
            let path = entry.map_err(io_error)?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let key = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<PublicKey>().ok());
            match key {
                Some(key) => keys.push(key),
                None => log::warn!("Ignoring stray file in snapshot store: {}", path.display()),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::Timeframe;

    #[test]
    fn test_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshots"));
        let space = PublicKey::random();

        assert!(store.load(&space).unwrap().is_none());
        assert!(store.spaces().unwrap().is_empty());

        let snapshot = DatabaseSnapshot {
            timeframe: Timeframe::at(PublicKey::random(), 41),
            items: vec![],
        };
        store.save(&space, &snapshot).unwrap();
        assert_eq!(store.load(&space).unwrap(), Some(snapshot));
        assert_eq!(store.spaces().unwrap(), vec![space]);

        assert!(store.remove(&space).unwrap());
        assert!(!store.remove(&space).unwrap());
    }
}
