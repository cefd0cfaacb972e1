use thiserror::Error;

/// Kiln error types
#[derive(Error, Debug)]
pub enum KilnError {
    /// Invalid or conflicting configuration (descriptor files, options)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A buildpack, lifecycle, or image reference could not be resolved
    #[error("Unable to resolve '{reference}': {message}")]
    Resolution { reference: String, message: String },

    /// Stack id mismatch, unsatisfied mixin, or similar incompatibility
    #[error("Incompatibility: {0}")]
    Compatibility(String),

    /// Buildpack API version outside the lifecycle's supported set
    #[error("buildpack API '{api}' is not supported by lifecycle {lifecycle}")]
    ApiUnsupported { api: String, lifecycle: String },

    /// Downloaded buildpack identity differs from the declared one
    #[error("buildpack '{declared}' was declared but '{actual}' was downloaded")]
    IdVersionMismatch { declared: String, actual: String },

    /// No stack id is supported by every buildpack in a package
    #[error("no stack is compatible with every buildpack in the package")]
    IncompatibleStacks,

    /// Image absent locally while the pull policy forbids fetching
    #[error("image '{0}' not found")]
    ImageNotFound(String),

    /// A blob source could not be read
    #[error("unable to read source {path}: {message}")]
    UnreadableSource { path: String, message: String },

    /// A path expected to hold an archive does not
    #[error("'{0}' is not a valid archive")]
    NotArchive(String),

    /// A directory or blob expected to hold an OCI layout does not
    #[error("invalid OCI layout: {0}")]
    BadOciLayout(String),

    /// A lifecycle phase exited non-zero; the code is surfaced verbatim
    #[error("{phase} phase failed with status code {exit_code}")]
    PhaseFailed { phase: String, exit_code: i64 },

    /// Container runtime or image save/push failure
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Cache volume or cache image problem
    #[error("Cache error: {0}")]
    Cache(String),

    /// Another build holds the cache for the same app reference
    #[error("cache for '{0}' is in use by another build")]
    CacheBusy(String),

    /// Operation aborted by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for KilnError {
    fn from(err: toml::de::Error) -> Self {
        KilnError::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for KilnError {
    fn from(err: toml::ser::Error) -> Self {
        KilnError::Serialization(err.to_string())
    }
}

/// Result type alias for kiln operations
pub type Result<T> = std::result::Result<T, KilnError>;
