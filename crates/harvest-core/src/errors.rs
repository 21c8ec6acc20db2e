//! Error type shared by every component of the poller.
//!
//! Collectors classify errors through [`HarvestError::kind`] to decide
//! between standby, per-tick logging and shutting the collector down.

use std::fmt;

/// ZAPI error number for a suspended API (transient, retried as connectivity).
pub const ZAPI_ERRNO_SUSPENDED: &str = "61253";
/// ZAPI error number for "permission denied".
pub const ZAPI_ERRNO_PERMISSION_DENIED: &str = "13003";
/// ZAPI error number for "no such API".
pub const ZAPI_ERRNO_NO_SUCH_API: &str = "13005";

/// Error classes driving the collector state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid parameter, unresolvable template. Fatal at init.
    Configuration,
    /// DNS, TCP, TLS or HTTP transport failure.
    Connectivity,
    /// Structured rejection by the target that is worth retrying.
    Rejected,
    /// Rejection that will not go away by retrying.
    Fatal,
    /// Response parsed but an expected element is missing.
    Schema,
    NoInstance,
    NoMetric,
    /// Misuse of the matrix API or inconsistent data.
    Internal,
    /// Sink-side failure.
    Export,
}

#[derive(Debug)]
pub enum HarvestError {
    MissingParam(String),
    InvalidParam(String),
    Config(String),
    Template(String),
    Connection(String),
    ApiRejected { reason: String, errno: String },
    AuthFailed(String),
    PermissionDenied(String),
    Schema(String),
    NoInstance(String),
    NoMetric(String),
    NoCollector(String),
    Duplicate(String),
    EmptyMatrix(String),
    Matrix(String),
    Parse(String),
    Export(String),
    Io(std::io::Error),
}

pub type Result<T> = std::result::Result<T, HarvestError>;

impl HarvestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingParam(_)
            | Self::InvalidParam(_)
            | Self::Config(_)
            | Self::Template(_)
            | Self::NoCollector(_) => ErrorKind::Configuration,
            Self::Connection(_) | Self::Io(_) => ErrorKind::Connectivity,
            Self::ApiRejected { reason, errno } => classify_rejection(reason, errno),
            Self::AuthFailed(_) | Self::PermissionDenied(_) => ErrorKind::Fatal,
            Self::Schema(_) => ErrorKind::Schema,
            Self::NoInstance(_) => ErrorKind::NoInstance,
            Self::NoMetric(_) => ErrorKind::NoMetric,
            Self::Duplicate(_) | Self::EmptyMatrix(_) | Self::Matrix(_) | Self::Parse(_) => {
                ErrorKind::Internal
            }
            Self::Export(_) => ErrorKind::Export,
        }
    }

    /// True for errors that put the collector into standby instead of failing it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connectivity
                | ErrorKind::Rejected
                | ErrorKind::Schema
                | ErrorKind::NoInstance
                | ErrorKind::NoMetric
                | ErrorKind::Export
        )
    }

    pub fn rejected(reason: impl Into<String>, errno: impl Into<String>) -> Self {
        Self::ApiRejected {
            reason: reason.into(),
            errno: errno.into(),
        }
    }
}

fn classify_rejection(reason: &str, errno: &str) -> ErrorKind {
    if errno == ZAPI_ERRNO_SUSPENDED {
        return ErrorKind::Connectivity;
    }
    if errno == ZAPI_ERRNO_PERMISSION_DENIED || errno == ZAPI_ERRNO_NO_SUCH_API {
        return ErrorKind::Fatal;
    }
    let reason = reason.to_lowercase();
    if reason.contains("no such api")
        || reason.contains("unable to find api")
        || reason.contains("permission denied")
    {
        ErrorKind::Fatal
    } else {
        ErrorKind::Rejected
    }
}

impl fmt::Display for HarvestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingParam(p) => write!(f, "missing parameter: {}", p),
            Self::InvalidParam(p) => write!(f, "invalid parameter: {}", p),
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Template(msg) => write!(f, "template error: {}", msg),
            Self::Connection(msg) => write!(f, "connection error: {}", msg),
            Self::ApiRejected { reason, errno } if errno.is_empty() => {
                write!(f, "API request rejected: {}", reason)
            }
            Self::ApiRejected { reason, errno } => {
                write!(f, "API request rejected: {} (errno={})", reason, errno)
            }
            Self::AuthFailed(msg) => write!(f, "auth failed: {}", msg),
            Self::PermissionDenied(msg) => write!(f, "permission denied: {}", msg),
            Self::Schema(msg) => write!(f, "attribute not found: {}", msg),
            Self::NoInstance(msg) => write!(f, "no instances: {}", msg),
            Self::NoMetric(msg) => write!(f, "no metrics: {}", msg),
            Self::NoCollector(msg) => write!(f, "no collectors: {}", msg),
            Self::Duplicate(key) => write!(f, "duplicate key: {}", key),
            Self::EmptyMatrix(msg) => write!(f, "empty matrix: {}", msg),
            Self::Matrix(msg) => write!(f, "matrix: {}", msg),
            Self::Parse(msg) => write!(f, "parse error: {}", msg),
            Self::Export(msg) => write!(f, "export failed: {}", msg),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for HarvestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for HarvestError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_yaml::Error> for HarvestError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<serde_json::Error> for HarvestError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

impl From<regex::Error> for HarvestError {
    fn from(e: regex::Error) -> Self {
        Self::InvalidParam(e.to_string())
    }
}

impl From<reqwest::Error> for HarvestError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Self::AuthFailed(e.to_string());
            }
            if status == reqwest::StatusCode::FORBIDDEN {
                return Self::PermissionDenied(e.to_string());
            }
            return Self::rejected(e.to_string(), status.as_str());
        }
        Self::Connection(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_classification() {
        assert_eq!(
            HarvestError::rejected("busy", "").kind(),
            ErrorKind::Rejected
        );
        assert_eq!(
            HarvestError::rejected("API suspended", ZAPI_ERRNO_SUSPENDED).kind(),
            ErrorKind::Connectivity
        );
        assert_eq!(
            HarvestError::rejected("denied", ZAPI_ERRNO_PERMISSION_DENIED).kind(),
            ErrorKind::Fatal
        );
        assert_eq!(
            HarvestError::rejected("Unable to find API: foo-get-iter", "").kind(),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn recoverable_kinds() {
        assert!(HarvestError::Connection("timeout".into()).is_recoverable());
        assert!(HarvestError::NoInstance("volume".into()).is_recoverable());
        assert!(HarvestError::NoMetric("volume".into()).is_recoverable());
        assert!(!HarvestError::MissingParam("addr".into()).is_recoverable());
        assert!(!HarvestError::AuthFailed("401".into()).is_recoverable());
    }

    #[test]
    fn display_includes_errno() {
        let e = HarvestError::rejected("resource limit exceeded", "13001");
        assert_eq!(
            e.to_string(),
            "API request rejected: resource limit exceeded (errno=13001)"
        );
    }
}
