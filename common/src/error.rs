//! The error taxonomy shared by every layer of the control plane.
//!
//! The core recognises exactly six kinds of failure (see the error handling
//! design): `NotFound`, `Conflict`, `Unavailable`, `Precondition`,
//! `IntegrityViolation`, `Fatal`. Every repository, adapter, and state
//! machine returns this type so that orchestrators and the HTTP boundary can
//! pattern-match on kind rather than on ad-hoc strings.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Resource missing in the store or in an external system. Never retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent writer lost a CAS, or a unique/FK constraint was violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Transient remote failure: store down, vCenter unreachable, tunnel down.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Caller asked for an operation incompatible with current state.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A stored invariant was found broken. Never auto-fixed silently.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// Structural bug or unrecoverable external state.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Error::Unavailable(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::Precondition(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Error::IntegrityViolation(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }

    /// Short machine-readable tag, used in audit rows and API error codes.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::Conflict(_) => "CONFLICT",
            Error::Unavailable(_) => "UNAVAILABLE",
            Error::Precondition(_) => "PRECONDITION",
            Error::IntegrityViolation(_) => "INTEGRITY_VIOLATION",
            Error::Fatal(_) => "FATAL",
            Error::Io(_) => "FATAL",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(Error::not_found("x").kind(), "NOT_FOUND");
        assert_eq!(Error::conflict("x").kind(), "CONFLICT");
        assert_eq!(Error::unavailable("x").kind(), "UNAVAILABLE");
        assert_eq!(Error::precondition("x").kind(), "PRECONDITION");
        assert_eq!(Error::integrity("x").kind(), "INTEGRITY_VIOLATION");
        assert_eq!(Error::fatal("x").kind(), "FATAL");
    }
}
