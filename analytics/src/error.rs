//! Error types for the edge analytics pipeline

use thiserror::Error;

/// Result type alias for the analytics library
pub type Result<T> = std::result::Result<T, AnalyticsError>;

/// Errors that can occur while building or running the pipeline
#[derive(Error, Debug)]
pub enum AnalyticsError {
    #[error("Model loading failed: {0}")]
    ModelLoad(String),

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("End of stream")]
    EndOfStream,

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Frame id {id} is still resident")]
    FrameIdAliased { id: u64 },

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error("Task was discarded before it ran")]
    TaskCancelled,

    #[error("Worker pool is shut down")]
    PoolShutdown,

    #[error("{pool} queue is full ({limit} tasks waiting)")]
    QueueFull { pool: String, limit: usize },

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl AnalyticsError {
    pub fn model_load<S: Into<String>>(msg: S) -> Self {
        Self::ModelLoad(msg.into())
    }

    pub fn capture<S: Into<String>>(msg: S) -> Self {
        Self::Capture(msg.into())
    }

    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    pub fn sink<S: Into<String>>(msg: S) -> Self {
        Self::Sink(msg.into())
    }

    /// Startup errors: the process must not start any stage
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ModelLoad(_) | Self::Config(_) | Self::ConfigParse(_)
        )
    }

    /// Errors that end the pipeline (but not the process)
    pub fn terminates_pipeline(&self) -> bool {
        matches!(self, Self::Capture(_) | Self::EndOfStream)
    }
}
