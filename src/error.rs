//! Error types for Kandji pipeline operations.
//!
//! Errors are categorized so the client can decide whether a call is worth
//! retrying and what kind of operator feedback is appropriate.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Categories of pipeline errors for retry logic and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid or missing API token, or rejected permissions.
    Auth,
    /// No matching Custom App and auto-create is disabled.
    NotFound,
    /// Multiple Custom Apps matched and none could be chosen.
    Conflict,
    /// Network-related errors (transient, retryable on reads).
    Network,
    /// Package uploaded but the metadata write failed.
    PartialUpdate,
    /// Malformed package, plist, or API response.
    Format,
    /// Filesystem error.
    Io,
    /// Other/unknown errors.
    Other,
}

impl ErrorCategory {
    /// Whether this error category is typically transient and worth retrying.
    ///
    /// Only read calls consult this; mutations rely on idempotent re-runs.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network)
    }

    /// Whether the overall run should keep going past this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Conflict)
    }

    /// Get actionable advice for resolving this error category.
    #[must_use]
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Auth => "Validate the API token and its permissions, then try again",
            Self::NotFound => "Enable auto-create or create the Custom App manually",
            Self::Conflict => "Remove or rename duplicate Custom Apps in the tenant",
            Self::Network => "Check connectivity and re-run; the pipeline is safe to retry",
            Self::PartialUpdate => "Re-run the pipeline; the entry will be re-discovered",
            Self::Format => "Inspect the package or response named in the error",
            Self::Io => "Check filesystem permissions and paths",
            Self::Other => "Check the error details for more information",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auth => "authentication",
            Self::NotFound => "not found",
            Self::Conflict => "duplicate conflict",
            Self::Network => "network",
            Self::PartialUpdate => "partial update",
            Self::Format => "format",
            Self::Io => "io",
            Self::Other => "other",
        };
        write!(f, "{name}")
    }
}

/// Errors that can occur while reconciling an artifact with the tenant.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// API rejected the bearer token.
    #[error("authentication failed during {operation} (HTTP {status}): {message}")]
    AuthFailure {
        /// Operation being attempted.
        operation: String,
        /// HTTP status code (401 or 403).
        status: u16,
        /// Backend response body.
        message: String,
    },

    /// No token could be resolved from the configured keystores.
    #[error("no value found for token '{name}' in any enabled keystore")]
    TokenMissing {
        /// Configured token name.
        name: String,
    },

    /// No Custom App matched and auto-create is off.
    #[error("no Custom App found for '{name}' and auto-create is disabled")]
    NotFoundNoAutoCreate {
        /// Target Custom App name.
        name: String,
    },

    /// More than one Custom App matched the target name.
    #[error("{count} Custom Apps match '{name}'; cannot choose an update target")]
    DuplicateConflict {
        /// Target Custom App name.
        name: String,
        /// Number of duplicates.
        count: usize,
    },

    /// HTTP request failed or returned an unexpected status.
    #[error("HTTP request failed during {operation}: {message}")]
    Http {
        /// Operation being attempted.
        operation: String,
        /// Error message or response body.
        message: String,
        /// HTTP status code if one was received.
        status: Option<u16>,
    },

    /// Package uploaded but the follow-up metadata call failed.
    #[error("package uploaded but {operation} failed for '{name}': {message}")]
    PartialUpdate {
        /// Target Custom App name.
        name: String,
        /// The metadata call that failed.
        operation: String,
        /// Backend response.
        message: String,
    },

    /// Could not extract identifying metadata from a package.
    #[error("could not read metadata from package {pkg}: {message}")]
    PackageMetadata {
        /// Package path.
        pkg: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// Unexpected shape in an API response.
    #[error("invalid API response from {operation}: {message}")]
    InvalidResponse {
        /// Operation being attempted.
        operation: String,
        /// What was malformed.
        message: String,
    },

    /// IO error with path context.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path involved in the error.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create an HTTP error for an operation, classifying auth statuses.
    pub fn http(operation: impl Into<String>, message: impl Into<String>, status: Option<u16>) -> Self {
        let operation = operation.into();
        let message = message.into();
        match status {
            Some(code @ (401 | 403)) => Self::AuthFailure {
                operation,
                status: code,
                message,
            },
            _ => Self::Http {
                operation,
                message,
                status,
            },
        }
    }

    /// Get the error category for retry logic and reporting.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::AuthFailure { .. } | Error::TokenMissing { .. } => ErrorCategory::Auth,
            Error::NotFoundNoAutoCreate { .. } => ErrorCategory::NotFound,
            Error::DuplicateConflict { .. } => ErrorCategory::Conflict,
            Error::Http { .. } => ErrorCategory::Network,
            Error::PartialUpdate { .. } => ErrorCategory::PartialUpdate,
            Error::PackageMetadata { .. } | Error::InvalidResponse { .. } => ErrorCategory::Format,
            Error::Io { .. } => ErrorCategory::Io,
            Error::Other(_) => ErrorCategory::Other,
        }
    }

    /// Whether this error is typically transient and worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::StatusCode(code) => Self::http("request", format!("HTTP {code}"), Some(code)),
            other => Self::Http {
                operation: "request".to_string(),
                message: other.to_string(),
                status: None,
            },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidResponse {
            operation: "decode".to_string(),
            message: err.to_string(),
        }
    }
}
