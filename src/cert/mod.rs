//! Local certificate authority.
//!
//! One CA pair and one client pair exist per installation; they are created
//! lazily, under a file lock, the first time any machine needs a server
//! certificate. Server certificates are minted per machine and always chain
//! to that CA.

mod issue;
mod validate;

use std::sync::{Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use file_lock::{FileLock, FileOptions};
use thiserror::Error;
use tracing::info;

pub use issue::{CERT_VALIDITY_DAYS, IssuedCert, ServerRequest, server_sans};
pub use validate::Validation;

use crate::error::ErrorKind;
use crate::files;

const LOCK_FILE: &str = ".ca.lock";

/// Record locks are per process, so threads of one process also queue here.
static PROCESS_LOCK: Mutex<()> = Mutex::new(());

struct CaGuard {
    _file: FileLock,
    _local: MutexGuard<'static, ()>,
}
const CERT_MODE: u32 = 0o644;
const KEY_MODE: u32 = 0o600;

/// Errors raised by the certificate authority.
#[derive(Debug, Error)]
pub enum CertError {
    /// Raised when reading, writing or locking certificate files fails.
    #[error("certificate file {path}: {message}")]
    Io {
        /// File involved.
        path: Utf8PathBuf,
        /// Operating system error text.
        message: String,
    },
    /// Raised when key or certificate generation fails.
    #[error("failed to generate certificate: {message}")]
    Generate {
        /// Generator error text.
        message: String,
    },
    /// Raised when stored PEM material cannot be parsed.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// File that failed to parse.
        path: Utf8PathBuf,
        /// Parser error text.
        message: String,
    },
}

impl CertError {
    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Io,
            Self::Generate { .. } | Self::Parse { .. } => ErrorKind::Other,
        }
    }

    fn io(path: &Utf8Path, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

impl From<rcgen::RcgenError> for CertError {
    fn from(err: rcgen::RcgenError) -> Self {
        Self::Generate {
            message: err.to_string(),
        }
    }
}

/// Locations of the installation-wide certificate files.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertPaths {
    /// CA certificate.
    pub ca_cert: Utf8PathBuf,
    /// CA private key.
    pub ca_key: Utf8PathBuf,
    /// Operator client certificate.
    pub client_cert: Utf8PathBuf,
    /// Operator client key.
    pub client_key: Utf8PathBuf,
}

impl CertPaths {
    /// Uses the conventional file names inside `dir`.
    #[must_use]
    pub fn in_dir(dir: &Utf8Path) -> Self {
        Self {
            ca_cert: dir.join("ca.pem"),
            ca_key: dir.join("ca-key.pem"),
            client_cert: dir.join("cert.pem"),
            client_key: dir.join("key.pem"),
        }
    }

    fn lock_path(&self) -> Utf8PathBuf {
        self.ca_cert
            .parent()
            .map_or_else(|| Utf8PathBuf::from(LOCK_FILE), |dir| dir.join(LOCK_FILE))
    }
}

/// The installation's certificate authority.
#[derive(Clone, Debug)]
pub struct CertAuthority {
    paths: CertPaths,
    organization: String,
}

impl CertAuthority {
    /// Creates an authority over `paths`; `organization` names the CA and
    /// client subjects.
    #[must_use]
    pub fn new(paths: CertPaths, organization: impl Into<String>) -> Self {
        Self {
            paths,
            organization: organization.into(),
        }
    }

    /// Returns the file locations.
    #[must_use]
    pub const fn paths(&self) -> &CertPaths {
        &self.paths
    }

    /// Creates the CA pair and the client pair when they are missing.
    ///
    /// Concurrent callers, including other processes, serialise on a lock
    /// file next to the CA so only one CA pair is ever created.
    ///
    /// # Errors
    ///
    /// Returns [`CertError`] when locking, generation or writing fails.
    pub fn ensure(&self) -> Result<(), CertError> {
        let _guard = self.lock()?;
        if !present(&self.paths.ca_cert)? || !present(&self.paths.ca_key)? {
            info!(path = %self.paths.ca_cert, "creating certificate authority");
            self.write_ca()?;
            self.write_client()?;
            return Ok(());
        }
        if !present(&self.paths.client_cert)? || !present(&self.paths.client_key)? {
            info!(path = %self.paths.client_cert, "creating client certificate");
            self.write_client()?;
        }
        Ok(())
    }

    /// Replaces the CA pair and the client pair unconditionally.
    ///
    /// Every server certificate signed by the previous CA stops validating.
    ///
    /// # Errors
    ///
    /// Returns [`CertError`] when locking, generation or writing fails.
    pub fn regenerate(&self) -> Result<(), CertError> {
        let _guard = self.lock()?;
        info!(path = %self.paths.ca_cert, "regenerating certificate authority");
        self.write_ca()?;
        self.write_client()
    }

    /// Mints a server certificate signed by the CA.
    ///
    /// # Errors
    ///
    /// Returns [`CertError`] when the CA cannot be loaded or signing fails.
    pub fn issue_server(&self, request: &ServerRequest) -> Result<IssuedCert, CertError> {
        self.ensure()?;
        let ca = self.load_ca()?;
        issue::server(&ca, request)
    }

    /// Mints a server certificate and writes it to `cert_path` and
    /// `key_path`.
    ///
    /// # Errors
    ///
    /// Returns [`CertError`] when issuing or writing fails.
    pub fn write_server(
        &self,
        request: &ServerRequest,
        cert_path: &Utf8Path,
        key_path: &Utf8Path,
    ) -> Result<(), CertError> {
        let issued = self.issue_server(request)?;
        write(cert_path, issued.cert_pem.as_bytes(), CERT_MODE)?;
        write(key_path, issued.key_pem.as_bytes(), KEY_MODE)
    }

    /// Checks a stored server certificate against the CA and the SANs it
    /// should carry.
    ///
    /// # Errors
    ///
    /// Returns [`CertError::Io`] when either file cannot be read. Parse and
    /// chain problems are reported as [`Validation::Invalid`].
    pub fn validate_server(
        &self,
        cert_path: &Utf8Path,
        sans: &[String],
    ) -> Result<Validation, CertError> {
        let ca_pem = read(&self.paths.ca_cert)?;
        let server_pem = read(cert_path)?;
        Ok(validate::server(&ca_pem, &server_pem, sans))
    }

    fn lock(&self) -> Result<CaGuard, CertError> {
        let local = PROCESS_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.paths.lock_path();
        files::open_parent(&path).map_err(|err| CertError::io(&path, &err))?;
        let options = FileOptions::new().write(true).create(true).append(true);
        let file =
            FileLock::lock(&path, true, options).map_err(|err| CertError::io(&path, &err))?;
        Ok(CaGuard {
            _file: file,
            _local: local,
        })
    }

    fn write_ca(&self) -> Result<(), CertError> {
        let ca = issue::ca(&self.organization)?;
        write(&self.paths.ca_cert, ca.serialize_pem()?.as_bytes(), CERT_MODE)?;
        write(
            &self.paths.ca_key,
            ca.serialize_private_key_pem().as_bytes(),
            KEY_MODE,
        )
    }

    fn write_client(&self) -> Result<(), CertError> {
        let ca = self.load_ca()?;
        let issued = issue::client(&ca, &self.organization)?;
        write(&self.paths.client_cert, issued.cert_pem.as_bytes(), CERT_MODE)?;
        write(&self.paths.client_key, issued.key_pem.as_bytes(), KEY_MODE)
    }

    fn load_ca(&self) -> Result<rcgen::Certificate, CertError> {
        let cert_pem = read(&self.paths.ca_cert)?;
        let key_pem = read(&self.paths.ca_key)?;
        let key = rcgen::KeyPair::from_pem(&key_pem).map_err(|err| CertError::Parse {
            path: self.paths.ca_key.clone(),
            message: err.to_string(),
        })?;
        let params = rcgen::CertificateParams::from_ca_cert_pem(&cert_pem, key).map_err(|err| {
            CertError::Parse {
                path: self.paths.ca_cert.clone(),
                message: err.to_string(),
            }
        })?;
        Ok(rcgen::Certificate::from_params(params)?)
    }
}

/// Returns the local account name used in certificate organisations.
#[must_use]
pub fn local_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|user| !user.is_empty())
        .unwrap_or_else(|| String::from("machina"))
}

fn present(path: &Utf8Path) -> Result<bool, CertError> {
    files::exists(path).map_err(|err| CertError::io(path, &err))
}

/// Reads a PEM file, reporting failures as [`CertError::Io`].
pub(crate) fn read(path: &Utf8Path) -> Result<String, CertError> {
    files::read_to_string(path).map_err(|err| CertError::io(path, &err))
}

fn write(path: &Utf8Path, contents: &[u8], mode: u32) -> Result<(), CertError> {
    files::write_atomic(path, contents, Some(mode)).map_err(|err| CertError::io(path, &err))
}
