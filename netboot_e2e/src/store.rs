// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Durable catalogue of provisioned environments.

use netboot_e2e_defs::InfrastructureState;
use parking_lot::RwLock;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use thiserror::Error;

const RECORD_EXTENSION: &str = "json";

/// Errors from the environment store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The state to save is unusable.
    #[error("invalid environment state: {0}")]
    InvalidState(&'static str),
    /// The environment ID cannot be used as a record name.
    #[error("invalid environment id {0:?}")]
    InvalidId(String),
    /// No record exists for the ID.
    #[error("environment {0} not found")]
    NotFound(String),
    /// A record exists but cannot be parsed.
    #[error("environment {id} record is corrupted")]
    Corrupted {
        /// The environment ID.
        id: String,
        /// The parse failure.
        #[source]
        source: serde_json::Error,
    },
    /// The state could not be serialized.
    #[error("failed to serialize environment {id}")]
    Serialize {
        /// The environment ID.
        id: String,
        /// The serialization failure.
        #[source]
        source: serde_json::Error,
    },
    /// Filesystem failure.
    #[error("environment store i/o error")]
    Io(#[from] io::Error),
}

/// One JSON file per environment ID, in a single directory.
///
/// Mutations take the store's write lock and replace records with an atomic
/// rename, so readers in this process never see a partially written record.
/// Nothing guards against a second process using the same directory.
#[derive(Debug)]
pub struct EnvironmentStore {
    dir: PathBuf,
    lock: RwLock<()>,
}

impl EnvironmentStore {
    /// Opens the store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs_err::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: RwLock::new(()),
        })
    }

    /// The store's directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains(['/', '\\', '\0']);
        if !valid {
            return Err(StoreError::InvalidId(id.to_owned()));
        }
        Ok(self.dir.join(format!("{id}.{RECORD_EXTENSION}")))
    }

    /// Saves `state`, replacing any earlier record with the same ID.
    pub fn save(&self, state: &InfrastructureState) -> Result<(), StoreError> {
        if state.id.is_empty() {
            return Err(StoreError::InvalidState("state has an empty id"));
        }
        let path = self.record_path(&state.id)?;
        let data = serde_json::to_vec_pretty(state).map_err(|source| StoreError::Serialize {
            id: state.id.clone(),
            source,
        })?;

        let _guard = self.lock.write();
        // Stage next to the destination so the rename stays on one filesystem.
        let mut staged = tempfile::Builder::new()
            .prefix(".staging-")
            .tempfile_in(&self.dir)?;
        staged.write_all(&data)?;
        staged.as_file().sync_all()?;
        staged.persist(&path).map_err(|e| e.error)?;
        tracing::debug!(id = state.id, path = %path.display(), "saved environment");
        Ok(())
    }

    /// Loads the record for `id`.
    pub fn load(&self, id: &str) -> Result<InfrastructureState, StoreError> {
        let path = self.record_path(id)?;
        let _guard = self.lock.read();
        let data = match fs_err::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_owned()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data).map_err(|source| StoreError::Corrupted {
            id: id.to_owned(),
            source,
        })
    }

    /// Returns every readable record, ordered by ID. Unreadable or malformed
    /// files are skipped.
    pub fn list(&self) -> Result<Vec<InfrastructureState>, StoreError> {
        let _guard = self.lock.read();
        let mut states = Vec::new();
        for entry in fs_err::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let state = fs_err::read(&path)
                .map_err(anyhow::Error::from)
                .and_then(|data| {
                    serde_json::from_slice::<InfrastructureState>(&data).map_err(Into::into)
                });
            match state {
                Ok(state) => states.push(state),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = format!("{e:#}"),
                        "skipping unreadable environment record"
                    );
                }
            }
        }
        states.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(states)
    }

    /// Removes the record for `id`.
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.record_path(id)?;
        let _guard = self.lock.write();
        match fs_err::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(id, "deleted environment");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(id.to_owned())),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a record exists for `id`.
    pub fn exists(&self, id: &str) -> bool {
        let Ok(path) = self.record_path(id) else {
            return false;
        };
        let _guard = self.lock.read();
        path.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jiff::Timestamp;

    fn state(id: &str) -> InfrastructureState {
        InfrastructureState {
            id: id.into(),
            bridge_name: "br-e2e".into(),
            network_name: "netboot-e2e".into(),
            network_cidr: "192.168.100.0/24".into(),
            dnsmasq_pid: Some(4242),
            lease_file: "/var/lib/netboot-e2e/dnsmasq.leases".into(),
            dnsmasq_log_file: "/var/log/netboot-e2e/dnsmasq.log".into(),
            cluster_name: "e2e".into(),
            kubeconfig_path: "/tmp/e2e/kubeconfig".into(),
            tftp_root: "/var/lib/netboot-e2e/tftp".into(),
            artifact_dir: "/tmp/e2e/artifacts".into(),
            created_at: "2024-03-01T12:00:00Z".parse::<Timestamp>().unwrap(),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnvironmentStore::new(dir.path()).unwrap();
        let env = state("env-a");
        store.save(&env).unwrap();
        assert_eq!(store.load("env-a").unwrap(), env);
        assert!(store.exists("env-a"));
    }

    #[test]
    fn save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnvironmentStore::new(dir.path()).unwrap();
        let mut env = state("env-a");
        store.save(&env).unwrap();
        env.bridge_name = "br-other".into();
        store.save(&env).unwrap();
        assert_eq!(store.load("env-a").unwrap().bridge_name, "br-other");
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn save_rejects_unusable_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnvironmentStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.save(&state("")),
            Err(StoreError::InvalidState(_))
        ));
        assert!(matches!(
            store.save(&state("../escape")),
            Err(StoreError::InvalidId(_))
        ));
    }

    #[test]
    fn dot_prefixed_id_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnvironmentStore::new(dir.path()).unwrap();
        let env = state(".env");
        store.save(&env).unwrap();
        assert_eq!(store.load(".env").unwrap(), env);
        assert_eq!(store.list().unwrap(), vec![env]);
        for id in [".", ".."] {
            assert!(matches!(store.load(id), Err(StoreError::InvalidId(_))));
        }
    }

    #[test]
    fn creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        let store = EnvironmentStore::new(&nested).unwrap();
        assert!(nested.is_dir());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn missing_is_not_found_and_garbage_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnvironmentStore::new(dir.path()).unwrap();
        assert!(matches!(store.load("nope"), Err(StoreError::NotFound(id)) if id == "nope"));

        fs_err::write(dir.path().join("broken.json"), b"{ not json").unwrap();
        assert!(matches!(
            store.load("broken"),
            Err(StoreError::Corrupted { id, .. }) if id == "broken"
        ));
    }

    #[test]
    fn list_skips_corrupted_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnvironmentStore::new(dir.path()).unwrap();
        let env = state("env-good");
        store.save(&env).unwrap();
        fs_err::write(dir.path().join("env-bad.json"), b"\x00\x01garbage").unwrap();
        fs_err::write(dir.path().join("notes.txt"), b"hello").unwrap();

        assert_eq!(store.list().unwrap(), vec![env]);
    }

    #[test]
    fn delete_removes_then_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnvironmentStore::new(dir.path()).unwrap();
        store.save(&state("env-a")).unwrap();
        store.delete("env-a").unwrap();
        assert!(matches!(store.load("env-a"), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete("env-a"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn concurrent_saves_and_reads() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnvironmentStore::new(dir.path()).unwrap();
        std::thread::scope(|s| {
            for i in 0..8 {
                let store = &store;
                s.spawn(move || {
                    let env = state(&format!("env-{i}"));
                    store.save(&env).unwrap();
                    assert_eq!(store.load(&env.id).unwrap(), env);
                    store.list().unwrap();
                });
            }
        });
        assert_eq!(store.list().unwrap().len(), 8);
    }
}
