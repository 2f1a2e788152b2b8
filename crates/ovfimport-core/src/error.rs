//! Error types for the ovfimport core library.

use std::path::PathBuf;
use std::time::Duration;

use crate::inventory::ObjectKind;

/// The main error type for ovfimport operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// The descriptor is not a well-formed OVF envelope.
    #[error("malformed descriptor: {message}")]
    MalformedDescriptor { message: String },

    /// The OVA archive could not be read.
    #[error("OVA archive error: {message}")]
    Archive { message: String },

    /// A payload digest does not match the package manifest.
    #[error("manifest mismatch for '{file}': expected {expected}, got {actual}")]
    ManifestMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    /// A disk payload is not in the format its descriptor declares.
    #[error("disk format error for '{path}': {message}")]
    DiskFormat { path: String, message: String },

    /// A declared network has no match in the target datacenter.
    #[error("network '{name}' not found")]
    NetworkNotFound { name: String },

    /// A declared network matches more than one inventory network.
    #[error("network '{name}' is ambiguous: {count} matches")]
    AmbiguousNetwork { name: String, count: usize },

    /// An inventory object could not be located.
    #[error("{kind} '{id}' not found")]
    ObjectNotFound { kind: ObjectKind, id: String },

    /// An inventory object resolved to a different type than requested.
    #[error("expected {expected}, found {actual}")]
    UnexpectedType { expected: ObjectKind, actual: String },

    /// The platform version string could not be parsed.
    #[error("could not parse version string '{version}'")]
    VersionParse { version: String },

    /// The platform refused the import spec.
    #[error("import spec rejected: {}", errors.join("; "))]
    SpecRejected { errors: Vec<String> },

    /// The platform refused to open an import lease.
    #[error("failed to open lease: {message}")]
    LeaseOpenFailed { message: String },

    /// The lease did not become ready in time.
    #[error("lease not ready after {waited:?}")]
    LeaseTimeout { waited: Duration },

    /// The lease entered an error state or is otherwise unusable.
    #[error("lease error: {message}")]
    LeaseError { message: String },

    /// A payload file referenced by the import spec is missing.
    #[error("local file missing at '{}': {reason}", path.display())]
    LocalFileMissing { path: PathBuf, reason: String },

    /// A payload's measured size differs from its declared size.
    #[error("size mismatch for '{path}': declared {declared} bytes, found {actual} bytes")]
    UploadSizeMismatch {
        path: String,
        declared: u64,
        actual: u64,
    },

    /// Transport failure while uploading a payload.
    #[error("upload of '{item}' failed: {message}")]
    UploadFailed { item: String, message: String },

    /// The caller cancelled the import or its deadline passed.
    #[error("import cancelled")]
    Cancelled,

    /// A management API call failed.
    #[error("API error: {message}")]
    Api { message: String },
}

/// A specialized Result type for ovfimport operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create a malformed descriptor error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedDescriptor {
            message: message.into(),
        }
    }

    /// Create an OVA archive error.
    pub fn archive(message: impl Into<String>) -> Self {
        Self::Archive {
            message: message.into(),
        }
    }

    /// Create a management API error.
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            message: message.into(),
        }
    }

    /// Create a lease error.
    pub fn lease(message: impl Into<String>) -> Self {
        Self::LeaseError {
            message: message.into(),
        }
    }

    /// Create a missing local file error.
    pub fn missing(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::LocalFileMissing {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an upload failure for the given item.
    pub fn upload(item: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UploadFailed {
            item: item.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error stems from caller cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}
