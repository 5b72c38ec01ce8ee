//! Atomic JSON snapshot persistence.
//!
//! Backs both the balance cache and light-client database snapshots. Writes
//! go to `<name>.json.tmp` first and are renamed into place, so a crash
//! mid-write never corrupts the previous snapshot.

use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

/// Saves and loads named JSON snapshots under one directory.
#[derive(Debug)]
pub struct SnapshotStore {
    base_dir: PathBuf,
}

impl SnapshotStore {
    /// Create the base directory if it doesn't exist.
    pub fn new(base_dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.json"))
    }

    /// Save a snapshot atomically: write `.tmp`, then `fs::rename`.
    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> io::Result<()> {
        let path = self.path_for(name);
        let tmp_path = self.base_dir.join(format!("{name}.json.tmp"));

        let json = serde_json::to_string(value).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("JSON serialize: {e}"))
        })?;

        fs::write(&tmp_path, &json)?;
        fs::rename(&tmp_path, &path)?;
        debug!(name, bytes = json.len(), "snapshot saved");
        Ok(())
    }

    /// Load a snapshot, or `None` if it was never saved. A snapshot that
    /// fails to parse (e.g. written by an incompatible version) is treated as
    /// absent rather than fatal.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> io::Result<Option<T>> {
        let path = self.path_for(name);
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        match serde_json::from_str(&json) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(name, %err, "discarding unreadable snapshot");
                Ok(None)
            }
        }
    }

    /// Delete a snapshot if present.
    pub fn remove(&self, name: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(tag: &str) -> SnapshotStore {
        let dir = std::env::temp_dir().join(format!(
            "balance-sync-snapshot-{tag}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        SnapshotStore::new(dir).unwrap()
    }

    #[test]
    fn round_trips_values() {
        let store = temp_store("roundtrip");
        store.save("answer", &42u32).unwrap();
        assert_eq!(store.load::<u32>("answer").unwrap(), Some(42));
    }

    #[test]
    fn missing_snapshot_is_none() {
        let store = temp_store("missing");
        assert_eq!(store.load::<u32>("nope").unwrap(), None);
    }

    #[test]
    fn unreadable_snapshot_is_discarded() {
        let store = temp_store("unreadable");
        store.save("value", &"not a number").unwrap();
        assert_eq!(store.load::<u32>("value").unwrap(), None);
    }

    #[test]
    fn remove_is_idempotent() {
        let store = temp_store("remove");
        store.save("gone", &1u8).unwrap();
        store.remove("gone").unwrap();
        store.remove("gone").unwrap();
        assert_eq!(store.load::<u8>("gone").unwrap(), None);
    }
}
