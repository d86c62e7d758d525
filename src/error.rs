use polars::error::PolarsError;
use thiserror::Error;

/// Every failure a dispatched request can end with.
///
/// A request that returns an error has not touched the registry.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Wrong number of arguments: {0}")]
    Arity(String),
    #[error("Unrecognized option {0}")]
    UnknownOption(String),
    #[error("Unrecognized property {0}")]
    UnknownProperty(String),
    #[error("Unrecognized operation {0}")]
    UnknownMethod(String),
    #[error("Unknown object handle {0}")]
    UnknownHandle(i64),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to read serialized model: {0}")]
    Deserialization(String),
    #[error("Data loading error: {0}")]
    DataLoading(#[from] PolarsError),
    #[error("Model error: {0}")]
    Model(String),
}

impl DispatchError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
