//! Errors carried by change streams.
//!
//! Streams are fail-fast: the first error an operator observes (from an
//! upstream, or from replaying an impossible transition into one of its own
//! caches) terminates the subscription. Because a single failure may fan out
//! to many downstream observers, [`Error`] is cheaply cloneable.

use std::fmt;
use std::sync::Arc;

use thiserror::Error as ThisError;

/// The categories of failure a change stream can carry.
#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Replaying a change set encountered a transition the receiving cache
    /// cannot perform, e.g. an `Update` for a key that is not present.
    #[error("change replay invariant violated: {message}")]
    Invariant {
        /// A description of the impossible transition.
        message: String,
    },

    /// A failure raised by a source outside this crate.
    #[error("source failure: {message}")]
    Source {
        /// A description of the source failure.
        message: String,
    },
}

/// An error terminating a change stream.
///
/// Wraps an [`ErrorKind`] behind shared storage so that one failure can be
/// delivered to every downstream observer without copying the payload.
#[derive(Clone, Debug)]
pub struct Error {
    kind: Arc<ErrorKind>,
}

impl Error {
    /// An internal invariant violation, surfaced downstream as an upstream error.
    pub fn invariant(message: impl Into<String>) -> Self {
        ErrorKind::Invariant { message: message.into() }.into()
    }

    /// A failure injected by a source outside this crate.
    pub fn source_failure(message: impl Into<String>) -> Self {
        ErrorKind::Source { message: message.into() }.into()
    }

    /// The category of this error.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error { kind: Arc::new(kind) }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.kind, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.kind.source()
    }
}

/// A specialized `Result` for change replay and mirror maintenance.
pub type Result<T> = std::result::Result<T, Error>;
