//! Error types for bidsforge-engine
//!
//! Only conditions with no meaningful partial result are errors. Everything a
//! user can fix (bad labels, missing field maps, short runs) is attached to the
//! offending acquisition as a warning or validation error instead.

use thiserror::Error;

/// Engine error type
#[derive(Debug, Error)]
pub enum EngineError {
    /// Timing file with an extension no parser handles
    #[error("Unknown file extension: {0}")]
    UnknownExtension(String),

    /// Timing file that does not live below the upload folder
    #[error("Timing file outside the upload folder: {0}")]
    OutsideUpload(String),

    /// Input document that cannot be ingested
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    /// Emission refused while acquisitions still carry errors
    #[error("Emission blocked: {0}")]
    EmissionBlocked(String),

    /// External script could not be started or supervised
    #[error("Script error: {0}")]
    Script(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// bidsforge-common error
    #[error("Common error: {0}")]
    Common(#[from] bidsforge_common::Error),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
