//! Error types for the verification engine.
//!
//! Only two kinds of failure ever escape a verification run as an `Err`: the source registry
//! being unreadable ([`NoPlatformDigests`]) and infrastructure failures such as a panicked pool
//! task ([`Task`]).  Everything else is absorbed into the report structures, and
//! [`Error::is_not_found`] is what tells an expected gap apart from an unexpected failure.
//!
//! [`NoPlatformDigests`]: Error::NoPlatformDigests
//! [`Task`]: Error::Task

/// Result type alias for operations that may return an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for registry access and verification.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The referenced repository, tag, manifest or blob does not exist.
    #[error("{0}: not found")]
    NotFound(String),

    /// A registry request failed for a reason other than absence.
    #[error("registry request for {reference} failed: {message}")]
    Registry { reference: String, message: String },

    /// A string could not be parsed as a content digest.
    #[error("invalid digest {digest:?}: {reason}")]
    InvalidDigest { digest: String, reason: String },

    /// A string could not be parsed as an image reference.
    #[error("invalid image reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },

    /// None of the layers of an image contained the requested file.
    #[error("{file} not found in any layer of {reference}")]
    FileNotFound { file: String, reference: String },

    /// An embedded metadata file was found but could not be decoded.
    #[error("malformed {file} in {reference}: {error}")]
    Decode {
        file: String,
        reference: String,
        #[source]
        error: serde_json::Error,
    },

    /// A layer uses a media type we can't decompress.
    #[error("unsupported layer media type {0}")]
    UnsupportedMediaType(String),

    /// The source registry yielded no platform digests at all.
    #[error("no platform digests could be read from source registry {registry}")]
    NoPlatformDigests { registry: String },

    /// I/O error while streaming a layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A pooled task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The semaphore bounding a task pool was closed.
    #[error("task pool closed")]
    PoolClosed(#[from] tokio::sync::AcquireError),
}

impl Error {
    /// Returns true if this error means "the thing is genuinely absent".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub(crate) fn registry(reference: impl ToString, message: impl ToString) -> Self {
        Error::Registry {
            reference: reference.to_string(),
            message: message.to_string(),
        }
    }
}
