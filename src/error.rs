//! The error taxonomy of the coordination core.
//!
//! All errors are synchronous and local to the call that raised them. The core never retries:
//! transient trouble with a remote site (a participant that stopped polling, say) is reported as
//! data, through site statuses and outstanding acknowledgments, and never as an error.

use displaydoc::Display;
use thiserror::Error;

use crate::common::{ProjectId, RunId, SiteId};

/// An error raised by one of the coordination components.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    /// invalid request: {0}
    Validation(String),
    /// unknown site {0}
    UnknownSite(SiteId),
    /// no site registered under identity {0}
    UnknownIdentity(String),
    /// unknown project {0}
    UnknownProject(ProjectId),
    /// no project named {0}
    UnknownProjectName(String),
    /// unknown run {0}
    UnknownRun(RunId),
    /// not authorized: {0}
    Authorization(String),
    /// conflict: {0}
    Conflict(String),
    /// invalid state: {0}
    InvalidState(String),
}

/// The class of a [`CoordinationError`], as reported at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    ValidationError,
    UnknownSiteError,
    UnknownProjectError,
    UnknownRunError,
    AuthorizationError,
    ConflictError,
    InvalidStateError,
}

impl CoordinationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::UnknownSite(_) | Self::UnknownIdentity(_) => ErrorKind::UnknownSiteError,
            Self::UnknownProject(_) | Self::UnknownProjectName(_) => {
                ErrorKind::UnknownProjectError
            }
            Self::UnknownRun(_) => ErrorKind::UnknownRunError,
            Self::Authorization(_) => ErrorKind::AuthorizationError,
            Self::Conflict(_) => ErrorKind::ConflictError,
            Self::InvalidState(_) => ErrorKind::InvalidStateError,
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub(crate) fn authorization(msg: impl Into<String>) -> Self {
        Self::Authorization(msg.into())
    }

    pub(crate) fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

/// The result of a coordination operation.
pub type CoordinationResult<T> = Result<T, CoordinationError>;
