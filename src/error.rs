// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed tick: {0}")]
    MalformedTick(String),

    #[error("unsupported timeframe: {0}")]
    Timeframe(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("missing data file: {0}")]
    MissingFile(String),

    #[error("handler '{handler}' failed on topic '{topic}': {source}")]
    Handler {
        topic: String,
        handler: String,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("unexpected {got} event on topic '{topic}'")]
    UnexpectedEvent { topic: String, got: &'static str },

    #[error("duplicate order id: {0}")]
    DuplicateOrder(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("invalid fill: {0}")]
    InvalidFill(String),

    #[error("risk rejected: {0}")]
    Risk(#[from] crate::risk::RiskError),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl PipelineError {
    /// Innermost error, skipping handler wrappers added by nested publishes.
    pub fn root(&self) -> &PipelineError {
        let mut cur = self;
        while let PipelineError::Handler { source, .. } = cur {
            cur = source;
        }
        cur
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
