use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while loading, planning or stepping a model
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or inconsistent weight tensor, or a missing tensor for a required role
    #[error("format error in `{tensor}`: {reason}")]
    Format { tensor: String, reason: String },

    /// Inconsistent model configuration or unsupported architecture / quantization pair
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Sequence position outside of the allocated context, or a cache read past the last write
    #[error("position {position} is out of bounds (limit {limit})")]
    Bounds { position: usize, limit: usize },

    /// Opaque failure reported by an execution backend
    #[error("backend error: {0}")]
    Backend(String),

    /// A stored plan that doesn't parse
    #[error("plan serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A failure during one generation step
    #[error("step {step} failed in stage `{stage}`: {source}")]
    Step {
        step: usize,
        stage: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn format(tensor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Format {
            tensor: tensor.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    pub(crate) fn backend(reason: impl Into<String>) -> Self {
        Self::Backend(reason.into())
    }

    /// Strip any step wrapping and return the underlying error
    pub fn root(&self) -> &Error {
        match self {
            Self::Step { source, .. } => source.root(),
            e => e,
        }
    }
}
