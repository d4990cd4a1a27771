//! Error types for template application.
//!
//! Errors are grouped into an [`ErrorKind`] taxonomy so callers can tell a
//! caller mistake apart from an unreachable instance or a failed rollback.

use thiserror::Error;

/// Failure taxonomy for template application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Instance state could not be read; nothing was changed
    InspectionFailure,
    /// The template is malformed (caller error)
    TemplateInputError,
    /// The diff has conflicts that were not overridden
    ConflictDetected,
    /// The pre-apply checkpoint could not be captured; nothing was changed
    CheckpointFailure,
    /// A remote apply step failed; rollback was triggered
    ApplyStepFailure,
    /// A rollback step failed; manual remediation required
    RollbackStepFailure,
    /// Another operation holds the instance lease
    LeaseHeld,
    /// The operation was cancelled before any mutation
    Cancelled,
    /// Transport failure outside any of the phases above
    Transport,
}

impl ErrorKind {
    /// Whether the instance is guaranteed untouched when this error surfaces.
    pub fn is_mutation_free(&self) -> bool {
        matches!(
            self,
            Self::InspectionFailure
                | Self::TemplateInputError
                | Self::ConflictDetected
                | Self::CheckpointFailure
                | Self::LeaseHeld
                | Self::Cancelled
        )
    }

    /// Get actionable advice for this kind of failure.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::InspectionFailure => "Check that the instance is reachable and try again",
            Self::TemplateInputError => "Fix the template and try again",
            Self::ConflictDetected => {
                "Resolve the conflicts or pass an explicit override for each category"
            }
            Self::CheckpointFailure => {
                "Check free space and permissions under the checkpoint directory"
            }
            Self::ApplyStepFailure => "Inspect the failed step output; the instance was rolled back",
            Self::RollbackStepFailure => {
                "The instance is partially changed; remediate the listed steps manually"
            }
            Self::LeaseHeld => "Wait for the other operation to finish or for its lease to expire",
            Self::Cancelled => "Re-run when ready; nothing was changed",
            Self::Transport => "Check connectivity to the instance",
        }
    }
}

/// Errors that can occur during template application.
#[derive(Debug, Error)]
pub enum Error {
    /// Instance state could not be read
    #[error("inspection of {instance} failed: {message}")]
    Inspection {
        /// Instance name
        instance: String,
        /// What failed
        message: String,
    },

    /// Remote output could not be parsed
    #[error("unreadable {what}: {message}")]
    Parse {
        /// What was being parsed
        what: String,
        /// Parser message
        message: String,
    },

    /// Template is malformed
    #[error("invalid template: {message}")]
    TemplateInput {
        /// What is wrong with the template
        message: String,
    },

    /// Checkpoint capture or load failed
    #[error("checkpoint failed: {message}")]
    Checkpoint {
        /// What failed
        message: String,
    },

    /// Requested checkpoint does not exist
    #[error("checkpoint {id} not found on {instance}")]
    CheckpointNotFound {
        /// Instance name
        instance: String,
        /// Requested checkpoint id
        id: u64,
    },

    /// Another operation holds the lease
    #[error("{instance} is locked by {owner} until {expires_at}")]
    LeaseHeld {
        /// Instance name
        instance: String,
        /// Holder of the lease
        owner: String,
        /// When the lease expires
        expires_at: String,
    },

    /// Lease store failure
    #[error("lease store error: {0}")]
    Lease(String),

    /// Cancelled before any mutation
    #[error("operation cancelled before any change was made")]
    Cancelled,

    /// Internal state machine misuse
    #[error("illegal transition {from} -> {to}")]
    InvalidTransition {
        /// Phase we were in
        from: String,
        /// Phase that was requested
        to: String,
    },

    /// Remote transport error
    #[error(transparent)]
    Remote(#[from] remotekit::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Inspection { .. } | Error::Parse { .. } => ErrorKind::InspectionFailure,
            Error::TemplateInput { .. } => ErrorKind::TemplateInputError,
            Error::Checkpoint { .. } | Error::CheckpointNotFound { .. } => {
                ErrorKind::CheckpointFailure
            }
            Error::LeaseHeld { .. } | Error::Lease(_) => ErrorKind::LeaseHeld,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Remote(remotekit::Error::Cancelled) => ErrorKind::Cancelled,
            Error::InvalidTransition { .. }
            | Error::Remote(_)
            | Error::Io(_)
            | Error::Json(_) => ErrorKind::Transport,
        }
    }

    pub(crate) fn template(message: impl Into<String>) -> Self {
        Error::TemplateInput {
            message: message.into(),
        }
    }

    pub(crate) fn checkpoint(message: impl Into<String>) -> Self {
        Error::Checkpoint {
            message: message.into(),
        }
    }
}

/// Result type for template application.
pub type Result<T> = std::result::Result<T, Error>;
