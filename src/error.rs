//! Error types for rosbags-playback

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for playback operations
pub type Result<T> = std::result::Result<T, PlaybackError>;

/// Errors that can occur anywhere in the provider chain or the pipeline
#[derive(Error, Debug)]
pub enum PlaybackError {
    /// IO error when accessing files or streams
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing YAML metadata or configuration
    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yml::Error),

    /// Database error when reading SQLite files
    #[error("Database error: {0}")]
    #[cfg(feature = "sqlite")]
    Database(#[from] rusqlite::Error),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Bag directory or file not found
    #[error("Bag not found: {path}")]
    BagNotFound { path: PathBuf },

    /// Metadata file not found
    #[error("Metadata file not found: {path}")]
    MetadataNotFound { path: PathBuf },

    /// Storage file not found
    #[error("Storage file not found: {path}")]
    StorageFileNotFound { path: PathBuf },

    /// Unsupported bag version
    #[error("Unsupported bag version: {version}")]
    UnsupportedVersion { version: u32 },

    /// Unsupported storage format
    #[error("Unsupported storage format: {format}")]
    UnsupportedStorageFormat { format: String },

    /// Unsupported compression format or mode
    #[error("Unsupported compression format: {format}")]
    UnsupportedCompressionFormat { format: String },

    /// Unsupported serialization format
    #[error("Unsupported serialization format: {format}")]
    UnsupportedSerializationFormat { format: String },

    /// The bag opened but cannot be played (no time range, no connections)
    #[error("Cannot play invalid bag: {reason}")]
    InvalidBag { reason: String },

    /// Provider used before `initialize` finished
    #[error("Data provider has not been initialized")]
    NotInitialized,

    /// `initialize` called a second time
    #[error("Data provider was already initialized")]
    AlreadyInitialized,

    /// Invalid provider tree or tunable
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Two children of a combined provider share a prefix
    #[error("Duplicate topic prefix: {prefix}")]
    DuplicatePrefix { prefix: String },

    /// A topic prefix does not start with '/'
    #[error("Prefix must start with '/': {prefix}")]
    InvalidPrefix { prefix: String },

    /// Two sources provide the same topic name
    #[error("Duplicate topic found: {topic}")]
    DuplicateTopic { topic: String },

    /// Two sources define the same datatype differently
    #[error("Conflicting datatype definitions found for {datatype}")]
    ConflictingDatatype { datatype: String },

    /// A child provider returned a message on a topic it never announced
    #[error("Saw unexpected topic from provider {provider}: {topic}")]
    UnexpectedTopic { provider: usize, topic: String },

    /// Message definition text could not be parsed
    #[error("Invalid message definition for {datatype}: {reason}")]
    InvalidDefinition { datatype: String, reason: String },

    /// Message type not found in the datatype dictionary
    #[error("Message type not found: {message_type}")]
    MessageTypeNotFound { message_type: String },

    /// No reader registered for a topic with raw payloads
    #[error("No message reader for topic: {topic}")]
    ReaderNotFound { topic: String },

    /// CDR deserialization error
    #[error("CDR deserialization error at position {position}/{data_length}: {message}")]
    CdrDeserialization {
        message: String,
        position: usize,
        data_length: usize,
    },

    /// Error raised on the far side of a worker channel
    #[error("{name}: {message}")]
    Remote { name: String, message: String },

    /// The worker side of a channel went away
    #[error("Worker disconnected")]
    WorkerDisconnected,

    /// Generic error with custom message
    #[error("Playback error: {message}")]
    Generic { message: String },
}

impl PlaybackError {
    /// Create a new generic error with a custom message
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic {
            message: message.into(),
        }
    }

    /// Create a compression error
    pub fn compression(message: impl Into<String>) -> Self {
        Self::Compression(message.into())
    }

    /// Create an invalid bag error
    pub fn invalid_bag(reason: impl Into<String>) -> Self {
        Self::InvalidBag {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create an invalid definition error
    pub fn invalid_definition(datatype: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            datatype: datatype.into(),
            reason: reason.into(),
        }
    }

    /// Create a CDR deserialization error
    pub fn cdr_deserialization(
        message: impl Into<String>,
        position: usize,
        data_length: usize,
    ) -> Self {
        Self::CdrDeserialization {
            message: message.into(),
            position,
            data_length,
        }
    }

    /// Create a message type not found error
    pub fn message_type_not_found(message_type: impl Into<String>) -> Self {
        Self::MessageTypeNotFound {
            message_type: message_type.into(),
        }
    }

    /// Short variant name, used when forwarding errors across a worker channel
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "Io",
            Self::YamlParse(_) => "YamlParse",
            #[cfg(feature = "sqlite")]
            Self::Database(_) => "Database",
            Self::Compression(_) => "Compression",
            Self::BagNotFound { .. } => "BagNotFound",
            Self::MetadataNotFound { .. } => "MetadataNotFound",
            Self::StorageFileNotFound { .. } => "StorageFileNotFound",
            Self::UnsupportedVersion { .. } => "UnsupportedVersion",
            Self::UnsupportedStorageFormat { .. } => "UnsupportedStorageFormat",
            Self::UnsupportedCompressionFormat { .. } => "UnsupportedCompressionFormat",
            Self::UnsupportedSerializationFormat { .. } => "UnsupportedSerializationFormat",
            Self::InvalidBag { .. } => "InvalidBag",
            Self::NotInitialized => "NotInitialized",
            Self::AlreadyInitialized => "AlreadyInitialized",
            Self::Configuration { .. } => "Configuration",
            Self::DuplicatePrefix { .. } => "DuplicatePrefix",
            Self::InvalidPrefix { .. } => "InvalidPrefix",
            Self::DuplicateTopic { .. } => "DuplicateTopic",
            Self::ConflictingDatatype { .. } => "ConflictingDatatype",
            Self::UnexpectedTopic { .. } => "UnexpectedTopic",
            Self::InvalidDefinition { .. } => "InvalidDefinition",
            Self::MessageTypeNotFound { .. } => "MessageTypeNotFound",
            Self::ReaderNotFound { .. } => "ReaderNotFound",
            Self::CdrDeserialization { .. } => "CdrDeserialization",
            Self::Remote { .. } => "Remote",
            Self::WorkerDisconnected => "WorkerDisconnected",
            Self::Generic { .. } => "Generic",
        }
    }
}
