use std::path::PathBuf;
use thiserror::Error;

// Main Application Error Type

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration Error: {0}")]
    Config(#[from] ConfigError),
    #[error("Stage Error: {0}")]
    Stage(#[from] StageError),
    #[error("Transport Error: {0}")]
    Transport(#[from] TransportError),
    #[error("Failed to run stage process: {0}")]
    Process(std::io::Error),
    #[error("Failed to install signal handler: {0}")]
    Signal(std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
    #[error("Stage '{producer}' outputs to {outputs:?} but stage '{consumer}' reads from {sources:?}")]
    Unlinked {
        producer: String,
        consumer: String,
        outputs: Vec<String>,
        sources: Vec<String>,
    },
    #[error("Unknown stage '{0}'")]
    UnknownStage(String),
    #[error("Duplicate stage name '{0}'")]
    DuplicateStage(String),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

// Transport Error Type, terminal for the loop that owns the endpoint
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid endpoint address '{0}': {1}")]
    InvalidAddress(String, &'static str),
    #[error("Failed to bind to {1}: {0}")]
    Bind(std::io::Error, String),
    #[error("Failed to connect to {1}: {0}")]
    Connect(std::io::Error, String),
    #[error("Failed to read message: {0}")]
    Read(std::io::Error),
    #[error("Failed to write message: {0}")]
    Write(std::io::Error),
    #[error("Endpoint {0} closed")]
    Closed(String),
    #[error("End of stream")]
    EndOfStream,
    #[error("Invalid frame length: expected {0}, got {1}")]
    InvalidFrameLength(usize, usize),
    #[error("Invalid frame tag: {0}")]
    InvalidFrameTag(u8),
    #[error("Invalid pixel format: {0}")]
    InvalidPixelFormat(u8),
    #[error("Invalid frame metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("Failed to decode image {1}: {0}")]
    Image(image::ImageError, PathBuf),
    #[error("Source {0} contains no frames")]
    EmptySource(PathBuf),
    #[error("Unsupported media {0}: expected an image, a directory of images or a .vfr recording")]
    UnsupportedMedia(PathBuf),
    #[error("Failed to join blocking task: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl TransportError {
    /// Whether this error is a clean end of stream rather than a failure.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, TransportError::EndOfStream)
    }
}

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Capability unavailable: {0}")]
    Capability(String),
    #[error("Invalid stage configuration: {0}")]
    Config(#[from] ConfigError),
}

// Errors raised by a stage hook while handling one frame
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Frame dropped: {0}")]
    Frame(String),
    #[error("Missing metadata key '{0}'")]
    MissingMetadata(&'static str),
    #[error("Malformed metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("Fatal stage error: {0}")]
    Fatal(String),
}

impl FilterError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, FilterError::Fatal(_))
    }
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Failed to connect to database: {0}")]
    Connect(String),
    #[error("Failed to write event: {0}")]
    Write(String),
}

impl From<tokio_postgres::Error> for PersistenceError {
    fn from(e: tokio_postgres::Error) -> Self {
        PersistenceError::Write(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("Failed to spawn detector process: {0}")]
    Spawn(std::io::Error),
    #[error("Detector exited with {0}: {1}")]
    Failed(std::process::ExitStatus, String),
    #[error("Failed to encode image for detector: {0}")]
    Encode(#[from] image::ImageError),
    #[error("Failed to decode detector output: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Detector pipe error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Detector error: {0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum StageError {
    #[error("Stage '{stage}' failed during setup: {source}")]
    Setup { stage: String, source: SetupError },
    #[error("Stage '{stage}' lost its endpoint: {source}")]
    Transport {
        stage: String,
        source: TransportError,
    },
    #[error("Stage '{stage}' raised a fatal error: {source}")]
    Fatal { stage: String, source: FilterError },
    #[error("Stage '{0}' panicked or was aborted")]
    Aborted(String),
    #[error("Stage process '{0}' exited with {1}")]
    Exited(String, std::process::ExitStatus),
}
