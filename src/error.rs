// Error taxonomy shared by the upload core
use crate::identity::ContentIdentity;
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The file handed to the uploader cannot be used
#[derive(Debug, Error)]
pub enum InputError {
    #[error("cannot read {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} is not a regular file", .path.display())]
    NotAFile { path: PathBuf },

    #[error("{} is empty; zero-length files are not uploaded", .path.display())]
    Empty { path: PathBuf },
}

/// Failures reported by a backend provider
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("integrity check failed: expected {expected}, backend has {actual}")]
    Integrity { expected: String, actual: String },

    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),
}

impl ProviderError {
    /// Retried inside the transfer session
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }

    /// At `begin_upload`, moves the orchestrator on to the next backend
    pub fn triggers_failover(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::QuotaExceeded(_))
    }

    /// Classify a local I/O failure raised while talking to a backend
    pub fn from_io(err: &io::Error, context: &str) -> Self {
        let message = format!("{context}: {err}");
        match err.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                Self::TransientNetwork(message)
            }
            io::ErrorKind::PermissionDenied => Self::Auth(message),
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => {
                Self::QuotaExceeded(message)
            }
            io::ErrorKind::NotFound | io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => {
                Self::Protocol(message)
            }
            _ => Self::Unavailable(message),
        }
    }
}

/// Index or session persistence failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("index database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("index storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed persisted record: {0}")]
    Record(String),
}

/// Terminal outcome of a transfer session that did not commit
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transfer failed: {0}")]
    Failed(#[source] ProviderError),

    #[error("transfer suspended with {committed} bytes committed")]
    Suspended {
        committed: u64,
        #[source]
        cause: Option<ProviderError>,
    },

    #[error("transfer cancelled; partial upload abandoned")]
    Cancelled,

    #[error("backend rejected resume: {0}")]
    ResumeRejected(#[source] ProviderError),

    #[error("failed to read source file: {0}")]
    Source(#[from] io::Error),
}

/// One backend the orchestrator tried and moved past
#[derive(Debug, Clone)]
pub struct BackendAttempt {
    pub backend: String,
    pub error: ProviderError,
}

impl fmt::Display for BackendAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.backend, self.error)
    }
}

fn describe_attempts(attempts: &[BackendAttempt]) -> String {
    if attempts.is_empty() {
        return "no configured backend accepts an object of this size".to_string();
    }
    let tried: Vec<String> = attempts.iter().map(ToString::to_string).collect();
    format!("tried {}", tried.join(", "))
}

/// Errors surfaced to callers of the upload orchestrator
#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("no backend available for {identity}: {}", describe_attempts(.attempts))]
    NoAvailableBackend {
        identity: ContentIdentity,
        attempts: Vec<BackendAttempt>,
    },

    #[error("backend {backend} rejected {identity}: {source}")]
    Backend {
        backend: String,
        identity: ContentIdentity,
        #[source]
        source: ProviderError,
    },

    #[error("upload of {identity} to {backend} failed: {source}")]
    UploadFailed {
        backend: String,
        identity: ContentIdentity,
        #[source]
        source: SessionError,
    },

    #[error("index store failure for {identity}: {source}")]
    Store {
        identity: ContentIdentity,
        #[source]
        source: StoreError,
    },
}

impl UploadError {
    /// Whether running the same upload again later can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NoAvailableBackend { attempts, .. } => !attempts.is_empty(),
            Self::UploadFailed { source, .. } => match source {
                SessionError::Suspended { .. } | SessionError::ResumeRejected(_) => true,
                SessionError::Failed(err) => err.is_transient(),
                SessionError::Cancelled | SessionError::Source(_) => false,
            },
            Self::Input(_) | Self::UnknownBackend(_) | Self::Backend { .. } | Self::Store { .. } => {
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Blake3Hash;

    fn identity() -> ContentIdentity {
        ContentIdentity::new(Blake3Hash::from_bytes(b"abc"), 3)
    }

    #[test]
    fn test_failover_classification() {
        assert!(ProviderError::Unavailable("down".into()).triggers_failover());
        assert!(ProviderError::QuotaExceeded("full".into()).triggers_failover());
        assert!(!ProviderError::Auth("nope".into()).triggers_failover());
        assert!(!ProviderError::TransientNetwork("reset".into()).triggers_failover());
        assert!(ProviderError::TransientNetwork("reset".into()).is_transient());
    }

    #[test]
    fn test_io_classification() {
        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert!(ProviderError::from_io(&timed_out, "write").is_transient());

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "ro");
        assert!(matches!(
            ProviderError::from_io(&denied, "open"),
            ProviderError::Auth(_)
        ));
    }

    #[test]
    fn test_retryable_split() {
        let exhausted = UploadError::NoAvailableBackend {
            identity: identity(),
            attempts: vec![BackendAttempt {
                backend: "primary".into(),
                error: ProviderError::Unavailable("maintenance".into()),
            }],
        };
        assert!(exhausted.is_retryable());
        assert!(exhausted.to_string().contains("primary"));

        let too_large = UploadError::NoAvailableBackend {
            identity: identity(),
            attempts: vec![],
        };
        assert!(!too_large.is_retryable());

        let unreadable = UploadError::Input(InputError::Empty {
            path: PathBuf::from("/tmp/x"),
        });
        assert!(!unreadable.is_retryable());

        let suspended = UploadError::UploadFailed {
            backend: "primary".into(),
            identity: identity(),
            source: SessionError::Suspended {
                committed: 10,
                cause: None,
            },
        };
        assert!(suspended.is_retryable());
    }
}
