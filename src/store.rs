//! Host record persistence.
//!
//! The installation directory holds one subdirectory per host under
//! `machines/`, each containing the serialised [`HostRecord`] as
//! `config.json` next to the host's own certificates and driver log.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::debug;

use crate::error::ErrorKind;
use crate::files;
use crate::host::{HostError, HostRecord};

const MACHINES_DIR: &str = "machines";
const CERTS_DIR: &str = "certs";
const RECORD_FILE: &str = "config.json";
const DRIVER_LOG_FILE: &str = "driver.log";

/// Returns the directory of host `name` inside installation `root`.
#[must_use]
pub fn machine_dir(root: &Utf8Path, name: &str) -> Utf8PathBuf {
    root.join(MACHINES_DIR).join(name)
}

/// Returns the file plugin output for host `name` is appended to.
#[must_use]
pub fn driver_log(root: &Utf8Path, name: &str) -> Utf8PathBuf {
    machine_dir(root, name).join(DRIVER_LOG_FILE)
}

/// Returns the directory holding the CA and client pairs.
#[must_use]
pub fn certs_dir(root: &Utf8Path) -> Utf8PathBuf {
    root.join(CERTS_DIR)
}

/// Errors raised by host stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Raised when no record exists for the host.
    #[error("host does not exist: {name}")]
    NotFound {
        /// Requested host name.
        name: String,
    },
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a stored record cannot be decoded or encoded.
    #[error("host {name}: {source}")]
    Record {
        /// Host whose record is unusable.
        name: String,
        /// Underlying decoding failure.
        #[source]
        source: HostError,
    },
}

impl StoreError {
    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Io { .. } => ErrorKind::Io,
            Self::Record { source, .. } => source.kind(),
        }
    }

    fn io(path: &Utf8Path, err: &io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// Persistence seam for host records.
///
/// Implementations serialise their own loads and saves; callers may share
/// one store across concurrent host operations.
pub trait HostStore: Send + Sync {
    /// Writes `record`, replacing any previous version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the record cannot be written.
    fn save(&self, record: &HostRecord) -> Result<(), StoreError>;

    /// Reads the record of host `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no record exists.
    fn load(&self, name: &str) -> Result<HostRecord, StoreError>;

    /// Returns whether a record for `name` exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the store cannot be inspected.
    fn exists(&self, name: &str) -> Result<bool, StoreError>;

    /// Returns the names of every stored host, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the store cannot be listed.
    fn list_names(&self) -> Result<Vec<String>, StoreError>;

    /// Deletes every local trace of host `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when deletion fails.
    fn remove(&self, name: &str) -> Result<(), StoreError>;
}

/// Stores records beneath an installation directory.
#[derive(Clone, Debug)]
pub struct FileStore {
    root: Utf8PathBuf,
}

impl FileStore {
    /// Uses `root` as the installation directory.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the installation directory.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn record_path(&self, name: &str) -> Utf8PathBuf {
        machine_dir(&self.root, name).join(RECORD_FILE)
    }
}

impl HostStore for FileStore {
    fn save(&self, record: &HostRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.name);
        let bytes = record.encode().map_err(|source| StoreError::Record {
            name: record.name.clone(),
            source,
        })?;
        files::write_atomic(&path, &bytes, Some(0o600))
            .map_err(|err| StoreError::io(&path, &err))?;
        debug!(machine = %record.name, path = %path, "saved host record");
        Ok(())
    }

    fn load(&self, name: &str) -> Result<HostRecord, StoreError> {
        let path = self.record_path(name);
        let contents = match files::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    name: name.to_owned(),
                });
            }
            Err(err) => return Err(StoreError::io(&path, &err)),
        };
        HostRecord::decode(contents.as_bytes()).map_err(|source| StoreError::Record {
            name: name.to_owned(),
            source,
        })
    }

    fn exists(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.record_path(name);
        files::exists(&path).map_err(|err| StoreError::io(&path, &err))
    }

    fn list_names(&self) -> Result<Vec<String>, StoreError> {
        let machines = self.root.join(MACHINES_DIR);
        let dir = match Dir::open_ambient_dir(&machines, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io(&machines, &err)),
        };
        let mut names = Vec::new();
        for item in dir.entries().map_err(|err| StoreError::io(&machines, &err))? {
            let name = item
                .map_err(|err| StoreError::io(&machines, &err))?
                .file_name()
                .map_err(|err| StoreError::io(&machines, &err))?;
            if self.exists(&name)? {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn remove(&self, name: &str) -> Result<(), StoreError> {
        let dir = machine_dir(&self.root, name);
        files::remove_tree(&dir).map_err(|err| StoreError::io(&dir, &err))?;
        debug!(machine = name, "removed host directory");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::CONFIG_VERSION;
    use rstest::{fixture, rstest};
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        store: FileStore,
    }

    #[fixture]
    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root =
            files::utf8(tmp.path().to_path_buf()).unwrap_or_else(|err| panic!("utf8: {err}"));
        Fixture {
            _tmp: tmp,
            store: FileStore::new(root),
        }
    }

    fn record(name: &str) -> HostRecord {
        HostRecord {
            config_version: CONFIG_VERSION,
            name: name.to_owned(),
            driver_name: String::from("none"),
            driver: json!({"machine_name": name, "url": "tcp://1.2.3.4:2376"}),
            auth_options: crate::options::AuthOptions::default(),
            engine_options: crate::options::EngineOptions::default(),
            swarm_options: crate::options::SwarmOptions::default(),
        }
    }

    #[rstest]
    fn saved_records_load_back(fixture: Fixture) {
        let original = record("m1");
        fixture
            .store
            .save(&original)
            .unwrap_or_else(|err| panic!("save: {err}"));
        let loaded = fixture
            .store
            .load("m1")
            .unwrap_or_else(|err| panic!("load: {err}"));
        assert_eq!(loaded, original);
        assert!(fixture.store.record_path("m1").as_str().ends_with("machines/m1/config.json"));
    }

    #[rstest]
    fn missing_hosts_are_not_found(fixture: Fixture) {
        let Err(err) = fixture.store.load("ghost") else {
            panic!("an absent record should not load");
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let present = fixture
            .store
            .exists("ghost")
            .unwrap_or_else(|err| panic!("exists: {err}"));
        assert!(!present);
    }

    #[rstest]
    fn listing_skips_directories_without_records(fixture: Fixture) {
        for name in ["b2", "a1"] {
            fixture
                .store
                .save(&record(name))
                .unwrap_or_else(|err| panic!("save: {err}"));
        }
        files::write_atomic(&driver_log(fixture.store.root(), "stray"), b"log\n", None)
            .unwrap_or_else(|err| panic!("stray: {err}"));

        let names = fixture
            .store
            .list_names()
            .unwrap_or_else(|err| panic!("list: {err}"));
        assert_eq!(names, vec![String::from("a1"), String::from("b2")]);
    }

    #[rstest]
    fn an_empty_installation_lists_nothing(fixture: Fixture) {
        let names = fixture
            .store
            .list_names()
            .unwrap_or_else(|err| panic!("list: {err}"));
        assert!(names.is_empty());
    }

    #[rstest]
    fn removal_deletes_the_whole_machine_directory(fixture: Fixture) {
        fixture
            .store
            .save(&record("m1"))
            .unwrap_or_else(|err| panic!("save: {err}"));
        fixture
            .store
            .remove("m1")
            .unwrap_or_else(|err| panic!("remove: {err}"));
        let present = files::exists(&machine_dir(fixture.store.root(), "m1"))
            .unwrap_or_else(|err| panic!("exists: {err}"));
        assert!(!present);
        fixture
            .store
            .remove("m1")
            .unwrap_or_else(|err| panic!("second remove: {err}"));
    }

    #[rstest]
    fn corrupt_records_name_the_host(fixture: Fixture) {
        files::write_atomic(&fixture.store.record_path("bad"), b"{", None)
            .unwrap_or_else(|err| panic!("write: {err}"));
        let Err(err) = fixture.store.load("bad") else {
            panic!("a corrupt record should not load");
        };
        assert!(err.to_string().starts_with("host bad:"));
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }
}
