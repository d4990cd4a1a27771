//! Error types for remote execution.
//!
//! Transport errors are categorized so the retry loop can tell a flaky
//! network apart from a command that ran and failed. A command that ran to
//! completion is never an error here: its exit code is returned to the caller
//! inside [`ExecOutput`](crate::ExecOutput).

use std::time::Duration;
use thiserror::Error;

/// Categories of transport errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connection refused, reset, DNS failure, relay unavailable (transient)
    Network,
    /// Authentication or authorization rejected (may be a credential refresh race)
    Auth,
    /// Remote file or command does not exist
    NotFound,
    /// Caller cancelled the operation
    Cancelled,
    /// Caller deadline passed
    Deadline,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Whether this error category is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::Auth)
    }

    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Network => "Network connectivity issue",
            Self::Auth => "Authentication rejected",
            Self::NotFound => "Remote path not found",
            Self::Cancelled => "Operation cancelled",
            Self::Deadline => "Deadline exceeded",
            Self::Other => "Unexpected error",
        }
    }

    /// Get actionable advice for resolving this error category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Network => "Check that the instance is running and reachable, then try again",
            Self::Auth => "Check the SSH key or relay token configured for this instance",
            Self::NotFound => "Verify the remote path exists on the instance",
            Self::Cancelled => "Re-run the operation when ready",
            Self::Deadline => "Increase the timeout or check instance load",
            Self::Other => "Check the error details for more information",
        }
    }
}

/// Errors that can occur while talking to a remote instance.
#[derive(Debug, Error)]
pub enum Error {
    /// Could not reach the instance (connection refused, reset, DNS, broker down)
    #[error("network error: {message}")]
    Network {
        /// Detailed error message from the transport
        message: String,
    },

    /// Credentials were rejected
    #[error("authentication failed: {message}")]
    Auth {
        /// Details from the transport
        message: String,
    },

    /// Remote path does not exist
    #[error("remote path not found: {path}")]
    NotFound {
        /// Remote path that was requested
        path: String,
    },

    /// Operation cancelled through the execution context
    #[error("operation cancelled")]
    Cancelled,

    /// Context deadline passed before the operation finished
    #[error("deadline exceeded after {elapsed:?}")]
    DeadlineExceeded {
        /// Time spent before giving up
        elapsed: Duration,
    },

    /// The relay broker reported a terminal state other than completion
    #[error("relay command {command_id} ended with status {status}")]
    Relay {
        /// Broker-side command id
        command_id: String,
        /// Terminal status reported by the broker
        status: String,
    },

    /// File transfer failed for a reason other than a missing path
    #[error("transfer of {path} failed: {message}")]
    Transfer {
        /// Remote path involved in the transfer
        path: String,
        /// Transport details
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Get the error category for retry logic.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Network { .. } => ErrorCategory::Network,
            Error::Auth { .. } => ErrorCategory::Auth,
            Error::NotFound { .. } => ErrorCategory::NotFound,
            Error::Cancelled => ErrorCategory::Cancelled,
            Error::DeadlineExceeded { .. } => ErrorCategory::Deadline,
            _ => ErrorCategory::Other,
        }
    }

    /// Whether this error is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Whether the remote path was missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Create an error from the stderr of a failed `ssh`/`scp` invocation.
    ///
    /// OpenSSH reports its own failures with exit status 255; the message on
    /// stderr tells us whether the failure was the network or the key.
    pub fn from_ssh_output(stderr: &str, remote_path: Option<&str>) -> Self {
        let stderr_lower = stderr.to_lowercase();

        if stderr_lower.contains("permission denied (")
            || stderr_lower.contains("authentication failed")
            || stderr_lower.contains("too many authentication failures")
            || stderr_lower.contains("host key verification failed")
        {
            return Error::Auth {
                message: stderr.trim().to_string(),
            };
        }

        if let Some(path) = remote_path
            && stderr_lower.contains("no such file or directory")
        {
            return Error::NotFound {
                path: path.to_string(),
            };
        }

        if stderr_lower.contains("connection refused")
            || stderr_lower.contains("connection timed out")
            || stderr_lower.contains("operation timed out")
            || stderr_lower.contains("could not resolve")
            || stderr_lower.contains("no route to host")
            || stderr_lower.contains("connection reset")
            || stderr_lower.contains("connection closed")
            || stderr_lower.contains("broken pipe")
            || stderr_lower.contains("network is unreachable")
            || stderr_lower.contains("kex_exchange_identification")
        {
            return Error::Network {
                message: stderr.trim().to_string(),
            };
        }

        match remote_path {
            Some(path) => Error::Transfer {
                path: path.to_string(),
                message: stderr.trim().to_string(),
            },
            None => Error::Network {
                message: if stderr.trim().is_empty() {
                    "ssh exited with status 255".to_string()
                } else {
                    stderr.trim().to_string()
                },
            },
        }
    }

    /// Map an HTTP status code from the relay broker.
    pub fn from_relay_status(code: u16, context: &str) -> Self {
        match code {
            401 | 403 => Error::Auth {
                message: format!("relay rejected credentials ({code}) for {context}"),
            },
            404 => Error::NotFound {
                path: context.to_string(),
            },
            408 | 429 | 500..=599 => Error::Network {
                message: format!("relay returned {code} for {context}"),
            },
            _ => Error::Other(format!("relay returned {code} for {context}")),
        }
    }
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::StatusCode(code) => Error::from_relay_status(code, "request"),
            ureq::Error::Io(e) => Error::Network {
                message: e.to_string(),
            },
            other => Error::Network {
                message: other.to_string(),
            },
        }
    }
}

/// Result type for remote operations.
pub type Result<T> = std::result::Result<T, Error>;
