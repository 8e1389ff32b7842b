//! Error types for the cohort ingest pipeline

use thiserror::Error;

/// Main result type used throughout the library.
///
/// A convenience alias over [`IngestError`]; most fallible functions in this
/// crate return it.
pub type Result<T> = std::result::Result<T, IngestError>;

/// Main error type for the cohort ingest pipeline.
///
/// Encompasses all errors that can occur within the library, with automatic
/// conversions from the per-subsystem error enums and from the underlying
/// I/O, network, and serialization errors.
///
/// # Example
///
/// ```rust
/// use onco_ingest::error::{ConfigError, IngestError};
///
/// let config_error = ConfigError::ValidationFailed {
///     message: "bucket name is empty".to_string(),
/// };
/// let error: IngestError = config_error.into();
/// println!("{error}");
/// ```
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Import error: {0}")]
    Import(#[from] ImportError),

    #[error("Object store error: {0}")]
    Storage(#[from] StorageError),

    #[error("Document store error: {0}")]
    Document(#[from] DocumentError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Object store backend error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Database error: {0}")]
    Database(#[from] deadpool_sqlite::rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Errors related to configuration loading, parsing, and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration file: {path}")]
    InvalidFile { path: std::path::PathBuf },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Invalid configuration value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Errors related to retrieving source files from mirror locations.
///
/// Per-job retrieval failures inside a batch are collected as diagnostics in
/// [`crate::retriever::BatchReport`] rather than raised through this enum;
/// these variants cover conditions that fail a call outright.
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Malformed source reference: {source_ref}")]
    InvalidSource { source_ref: String },

    #[error("No mirror candidate succeeded for {source_ref}")]
    AllMirrorsFailed { source_ref: String },

    #[error("Ingest batch contains no jobs")]
    EmptyBatch,

    #[error("Retrieval cancelled")]
    Cancelled,
}

/// Errors related to parsing and importing cohort data files.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Cohort is required")]
    MissingCohort,

    #[error("Missing patient barcode column in {key}")]
    MissingBarcodeColumn { key: String },

    #[error("No clinical TSV found under cohort prefix {cohort}")]
    NoClinicalObject { cohort: String },

    #[error("Import cancelled")]
    Cancelled,
}

/// Errors related to the object store.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Bucket {bucket} is not reachable: {message}")]
    BucketUnavailable { bucket: String, message: String },

    #[error("Object not found: {key}")]
    ObjectNotFound { key: String },

    #[error("Failed to store object {key}: {message}")]
    PutFailed { key: String, message: String },

    #[error("Unknown object store backend: {backend}")]
    UnknownBackend { backend: String },
}

/// Errors related to the patient document store.
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Document store initialization failed: {message}")]
    InitializationFailed { message: String },

    #[error("Database error: {message}")]
    DatabaseError { message: String },

    #[error("Unsupported document schema version: found {current}, need {required}")]
    UnsupportedSchemaVersion { current: i32, required: i32 },
}

/// Trait for validating configuration and data structures.
///
/// Provides a common interface for checking that a structure contains
/// usable values before the pipeline is wired up with it.
pub trait Validate {
    type Error;
    fn validate(&self) -> std::result::Result<(), Self::Error>;
}
