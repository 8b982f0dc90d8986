use thiserror::Error;

/// distbuild error types.
///
/// Every step phase has its own variant so the phase name travels with the
/// message that ends up in the response `error` field.
#[derive(Error, Debug)]
pub enum BuildError {
    /// Malformed build unit on the wire
    #[error("could not decode build unit: {0}")]
    Decode(String),

    /// Build unit arrived without an instruction
    #[error("no instruction specified")]
    MissingInstruction,

    /// Base image could not be found locally or pulled
    #[error("could not resolve image {reference:?}: {source}")]
    Resolution {
        reference: String,
        #[source]
        source: Box<BuildError>,
    },

    /// Transported diff could not be applied to its parent
    #[error("could not apply diff: {0}")]
    Reconstruction(String),

    /// Step executor setup failed
    #[error("could not prepare build step: {0}")]
    Prepare(String),

    /// Instruction failed while running
    #[error("could not execute step: {0}")]
    Execute(String),

    /// Executor could not commit the result
    #[error("could not commit step: {0}")]
    Commit(String),

    /// Diff of the committed layer could not be read
    #[error("could not get most recent diff: {0}")]
    DiffExtraction(String),

    /// Caller's cancellation signal fired during a phase
    #[error("cancelled while {phase}")]
    Cancelled { phase: String },

    /// Layer store failure
    #[error("Layer store error: {0}")]
    Store(String),

    /// Unparseable image reference
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    Registry { registry: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Stable tag for each error variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Decode,
    MissingInstruction,
    Resolution,
    Reconstruction,
    Prepare,
    Execute,
    Commit,
    DiffExtraction,
    Cancelled,
    Store,
    InvalidReference,
    Registry,
    Config,
    Io,
    Serialization,
}

impl BuildError {
    /// Return the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::Decode(_) => ErrorKind::Decode,
            BuildError::MissingInstruction => ErrorKind::MissingInstruction,
            BuildError::Resolution { .. } => ErrorKind::Resolution,
            BuildError::Reconstruction(_) => ErrorKind::Reconstruction,
            BuildError::Prepare(_) => ErrorKind::Prepare,
            BuildError::Execute(_) => ErrorKind::Execute,
            BuildError::Commit(_) => ErrorKind::Commit,
            BuildError::DiffExtraction(_) => ErrorKind::DiffExtraction,
            BuildError::Cancelled { .. } => ErrorKind::Cancelled,
            BuildError::Store(_) => ErrorKind::Store,
            BuildError::InvalidReference(_) => ErrorKind::InvalidReference,
            BuildError::Registry { .. } => ErrorKind::Registry,
            BuildError::Config(_) => ErrorKind::Config,
            BuildError::Io(_) => ErrorKind::Io,
            BuildError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Create a cancellation error for the named phase.
    pub fn cancelled(phase: impl Into<String>) -> Self {
        BuildError::Cancelled {
            phase: phase.into(),
        }
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> Self {
        BuildError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for BuildError {
    fn from(err: serde_yaml::Error) -> Self {
        BuildError::Serialization(err.to_string())
    }
}

/// Result type alias for distbuild operations
pub type Result<T> = std::result::Result<T, BuildError>;
