//! Installed-version bookkeeping.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ClassifiedError, ErrorKind};
use tvm_schema::{ToolchainVersion, VersionRecord};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed version records {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Version {0} is not installed")]
    NotInstalled(ToolchainVersion),
}

impl From<StoreError> for ClassifiedError {
    fn from(err: StoreError) -> Self {
        let kind = match &err {
            StoreError::Io { source, .. } if source.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorKind::Permission
            }
            StoreError::Io { .. } => ErrorKind::FileSystem,
            StoreError::Parse { .. } => ErrorKind::Configuration,
            StoreError::NotInstalled(_) => ErrorKind::VersionNotFound,
        };
        ClassifiedError::new(kind, err.to_string()).with_cause(err)
    }
}

/// CRUD over installed version records, keyed by version.
pub trait VersionStore: Send + Sync {
    fn get(&self, version: &ToolchainVersion) -> Result<Option<VersionRecord>, StoreError>;

    fn contains(&self, version: &ToolchainVersion) -> Result<bool, StoreError> {
        Ok(self.get(version)?.is_some())
    }

    /// Insert or replace the record for `record.version`.
    fn insert(&self, record: VersionRecord) -> Result<(), StoreError>;

    fn remove(&self, version: &ToolchainVersion) -> Result<Option<VersionRecord>, StoreError>;

    /// All records, oldest version first.
    fn list(&self) -> Result<Vec<VersionRecord>, StoreError>;

    /// Mark `version` active and every other record inactive.
    fn set_active(&self, version: &ToolchainVersion) -> Result<(), StoreError>;

    fn active(&self) -> Result<Option<VersionRecord>, StoreError> {
        Ok(self.list()?.into_iter().find(|r| r.active))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RecordFile {
    #[serde(default)]
    versions: Vec<VersionRecord>,
}

/// Records kept in one JSON file (`versions.json`), rewritten atomically on every change.
#[derive(Debug)]
pub struct JsonVersionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonVersionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<RecordFile, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(RecordFile::default()),
            Ok(content) => serde_json::from_str(&content).map_err(|source| StoreError::Parse {
                path: self.path.clone(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RecordFile::default()),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn write(&self, mut file: RecordFile) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        file.versions.sort_by(|a, b| a.version.cmp(&b.version));
        let json = serde_json::to_string_pretty(&file).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)
    }

    fn update<T>(&self, f: impl FnOnce(&mut RecordFile) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.read()?;
        let out = f(&mut file)?;
        self.write(file)?;
        Ok(out)
    }
}

impl VersionStore for JsonVersionStore {
    fn get(&self, version: &ToolchainVersion) -> Result<Option<VersionRecord>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read()?.versions.into_iter().find(|r| &r.version == version))
    }

    fn insert(&self, record: VersionRecord) -> Result<(), StoreError> {
        self.update(|file| {
            file.versions.retain(|r| r.version != record.version);
            file.versions.push(record);
            Ok(())
        })
    }

    fn remove(&self, version: &ToolchainVersion) -> Result<Option<VersionRecord>, StoreError> {
        self.update(|file| {
            let index = file.versions.iter().position(|r| &r.version == version);
            Ok(index.map(|i| file.versions.remove(i)))
        })
    }

    fn list(&self) -> Result<Vec<VersionRecord>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut versions = self.read()?.versions;
        versions.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(versions)
    }

    fn set_active(&self, version: &ToolchainVersion) -> Result<(), StoreError> {
        self.update(|file| {
            if !file.versions.iter().any(|r| &r.version == version) {
                return Err(StoreError::NotInstalled(version.clone()));
            }
            for record in &mut file.versions {
                record.active = &record.version == version;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn record(v: &str) -> VersionRecord {
        VersionRecord {
            version: ToolchainVersion::parse(v).unwrap(),
            path: PathBuf::from(format!("/opt/tvm/versions/{v}")),
            source: "official".into(),
            url: format!("https://go.dev/dl/go{v}.linux-amd64.tar.gz"),
            sha256: None,
            size_bytes: 42,
            installed_at: Utc::now(),
            active: false,
        }
    }

    #[test]
    fn crud_round_trip() {
        let dir = tempdir().unwrap();
        let store = JsonVersionStore::new(dir.path().join("versions.json"));
        let v = ToolchainVersion::parse("1.21.5").unwrap();

        assert!(!store.contains(&v).unwrap());
        store.insert(record("1.21.5")).unwrap();
        store.insert(record("1.9.2")).unwrap();
        store.insert(record("1.22.0")).unwrap();
        assert!(store.contains(&v).unwrap());

        let listed: Vec<_> = store.list().unwrap().into_iter().map(|r| r.version.to_string()).collect();
        assert_eq!(listed, ["1.9.2", "1.21.5", "1.22.0"]);

        assert!(store.remove(&v).unwrap().is_some());
        assert!(store.remove(&v).unwrap().is_none());
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn only_one_active_version() {
        let dir = tempdir().unwrap();
        let store = JsonVersionStore::new(dir.path().join("versions.json"));
        store.insert(record("1.21.5")).unwrap();
        store.insert(record("1.22.0")).unwrap();

        store.set_active(&ToolchainVersion::parse("1.21.5").unwrap()).unwrap();
        store.set_active(&ToolchainVersion::parse("1.22.0").unwrap()).unwrap();
        let active: Vec<_> = store.list().unwrap().into_iter().filter(|r| r.active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(store.active().unwrap().unwrap().version.to_string(), "1.22.0");

        let err = store.set_active(&ToolchainVersion::parse("1.1").unwrap()).unwrap_err();
        assert_eq!(ClassifiedError::from(err).kind, ErrorKind::VersionNotFound);
    }

    #[test]
    fn malformed_file_is_configuration_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("versions.json");
        std::fs::write(&path, "[oops").unwrap();
        let err = JsonVersionStore::new(&path).list().unwrap_err();
        assert_eq!(ClassifiedError::from(err).kind, ErrorKind::Configuration);
    }
}
