use std::{
    error::Error,
    fmt::Display,
    path::PathBuf,
};

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of an edgepack-related operation.
pub type EdgepackResult<T> = Result<T, EdgepackError>;

/// An error that occurred while packing, pushing or pulling an edge container image.
#[derive(Debug, Error)]
pub enum EdgepackError {
    /// A caller-supplied value was rejected before any work started.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An image reference could not be parsed or was empty.
    #[error("invalid image reference: {0}")]
    ImageReference(String),

    /// A disk specification did not name a known disk kind.
    #[error("unknown disk kind: {0}")]
    UnknownDiskKind(String),

    /// A file named by an artifact source does not exist.
    #[error("source file missing: {}", .0.display())]
    SourceMissing(PathBuf),

    /// A layer could not be added to the content store during a build.
    #[error("error adding {} from file at {}: {}", .name, .path.display(), .source)]
    AddLayer {
        /// The layer title that was being added.
        name: String,

        /// The file the layer bytes were read from.
        path: PathBuf,

        /// The underlying failure.
        #[source]
        source: Box<EdgepackError>,
    },

    /// The streaming compressor failed.
    #[error(transparent)]
    Compress(#[from] CompressError),

    /// A committed blob's digest did not match the expected digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The digest the caller expected.
        expected: String,

        /// The digest of the bytes that were written.
        actual: String,
    },

    /// A committed blob's size did not match the expected size.
    #[error("size mismatch: expected {expected} bytes, got {actual} bytes")]
    SizeMismatch {
        /// The size the caller expected.
        expected: u64,

        /// The number of bytes that were written.
        actual: u64,
    },

    /// Authentication against a remote registry failed.
    #[error("registry authentication failed: {0}")]
    TransportAuth(String),

    /// A transport-level request failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A content-store backend could not be reached or is not available in this build.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A reference or blob was not found in the content store.
    #[error("not found: {0}")]
    NotFound(String),

    /// A pulled descriptor carries a media type outside the allowed set.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// The ambient cancellation token was triggered.
    #[error("operation cancelled")]
    Cancelled,

    /// A blob writer was used after being committed or closed.
    #[error("writer is no longer open: {0}")]
    WriterClosed(String),

    /// An error from the OCI spec types.
    #[error(transparent)]
    OciSpec(#[from] oci_spec::OciSpecError),

    /// An I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A JSON serialization error.
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    /// An HTTP client error.
    #[error("transport error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// An HTTP middleware error.
    #[error("transport error: {0}")]
    ReqwestMiddleware(#[from] reqwest_middleware::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// An error produced by the streaming compressor, named after the stage that failed.
#[derive(Debug, Error)]
pub enum CompressError {
    /// The input file could not be opened.
    #[error("could not open {} for reading: {}", .path.display(), .source)]
    SourceOpen {
        /// The input path.
        path: PathBuf,

        /// The underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// The input file could not be stat'ed.
    #[error("could not stat {}: {}", .path.display(), .source)]
    SourceStat {
        /// The input path.
        path: PathBuf,

        /// The underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// The output sink could not be created or written.
    #[error("could not write compressed output to {}: {}", .path.display(), .source)]
    Sink {
        /// The output path.
        path: PathBuf,

        /// The underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// The tar entry header could not be written.
    #[error("error writing tar header for {}: {}", .path.display(), .source)]
    TarHeader {
        /// The input path.
        path: PathBuf,

        /// The underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// The tar entry data could not be written.
    #[error("error writing {} data to tar: {}", .path.display(), .source)]
    TarData {
        /// The input path.
        path: PathBuf,

        /// The underlying failure.
        #[source]
        source: std::io::Error,
    },
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EdgepackError {
    /// Creates a new `EdgepackError` from any error type.
    pub fn custom(error: impl Into<anyhow::Error>) -> EdgepackError {
        EdgepackError::Custom(AnyError {
            error: error.into(),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `EdgepackResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> EdgepackResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for AnyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
