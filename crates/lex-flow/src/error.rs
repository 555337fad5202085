//! Error types for the stage graph and its intermediate values.
//!
//! Every fallible operation in this crate returns [`FlowError`]. Variants map
//! onto a small taxonomy ([`ErrorKind`]) so callers can tell a lifecycle
//! violation on a [`UObject`](crate::UObject) apart from a malformed graph or
//! a failing storage backend, even after context has been attached.
//!
//! Errors serialize as `{code, message}` pairs for run logs and reports.

use crate::uobject::{StorageMethod, TargetFormat};
use serde::Serialize;
use serde::ser::SerializeStruct;
use thiserror::Error;

/// Coarse classification of a [`FlowError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Phase or finalization contract of an intermediate value was violated.
    State,
    /// The graph is malformed (duplicate node, bad port, cycle).
    Graph,
    /// The stored format cannot be exported in the requested format.
    Conversion,
    /// A storage backend failed to read or write.
    BackingStore,
    /// A stage broke its contract or failed internally.
    Stage,
    /// Invalid configuration.
    Config,
}

/// The main error type for pipeline construction and execution.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FlowError {
    /// Phase or finalization violation on an intermediate value.
    #[error("State error: {0}")]
    State(String),

    /// Malformed graph.
    #[error("Graph error: {0}")]
    Graph(String),

    /// No conversion is defined from the stored format to the requested one.
    #[error("Unsupported conversion from {from} storage to {to}")]
    Conversion {
        from: StorageMethod,
        to: TargetFormat,
    },

    /// Storage backend failure that is not an IO or Polars error.
    #[error("Backing store error: {0}")]
    BackingStore(String),

    /// A stage did not return a value for a port it was asked to produce.
    #[error("Stage '{stage}' did not produce requested output '{key}'")]
    MissingOutput { stage: String, key: String },

    /// A stage failed while computing its outputs.
    #[error("Stage '{stage}' failed: {reason}")]
    StageFailed { stage: String, reason: String },

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Polars error wrapper.
    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context.
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<FlowError>,
    },
}

impl FlowError {
    pub(crate) fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }

    pub(crate) fn graph(message: impl Into<String>) -> Self {
        Self::Graph(message.into())
    }

    pub(crate) fn backing_store(message: impl Into<String>) -> Self {
        Self::BackingStore(message.into())
    }

    /// Build a [`FlowError::StageFailed`] from any displayable failure.
    ///
    /// Stage implementations use this to surface errors from collaborators
    /// that are not [`FlowError`]s.
    pub fn stage_failed(stage: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::StageFailed {
            stage: stage.into(),
            reason: reason.to_string(),
        }
    }

    /// Add context to an error.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        FlowError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Classify this error. Context wrappers report the kind of the wrapped error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::State(_) => ErrorKind::State,
            Self::Graph(_) => ErrorKind::Graph,
            Self::Conversion { .. } => ErrorKind::Conversion,
            Self::BackingStore(_) | Self::Io(_) | Self::Polars(_) | Self::Json(_) => {
                ErrorKind::BackingStore
            }
            Self::MissingOutput { .. } | Self::StageFailed { .. } => ErrorKind::Stage,
            Self::InvalidConfig(_) => ErrorKind::Config,
            Self::WithContext { source, .. } => source.kind(),
        }
    }

    /// Stable error code, also the `code` field of the serialized form.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::State(_) => "STATE_ERROR",
            Self::Graph(_) => "GRAPH_ERROR",
            Self::Conversion { .. } => "CONVERSION_ERROR",
            Self::BackingStore(_) => "BACKING_STORE_ERROR",
            Self::MissingOutput { .. } => "MISSING_OUTPUT",
            Self::StageFailed { .. } => "STAGE_FAILED",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Io(_) => "IO_ERROR",
            Self::Polars(_) => "POLARS_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::WithContext { source, .. } => source.error_code(),
        }
    }

    pub fn is_state_error(&self) -> bool {
        self.kind() == ErrorKind::State
    }

    pub fn is_graph_error(&self) -> bool {
        self.kind() == ErrorKind::Graph
    }

    pub fn is_conversion_error(&self) -> bool {
        self.kind() == ErrorKind::Conversion
    }

    pub fn is_backing_store_error(&self) -> bool {
        self.kind() == ErrorKind::BackingStore
    }
}

/// Errors are serialized as a struct with `code` and `message` fields.
impl Serialize for FlowError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("FlowError", 2)?;
        state.serialize_field("code", &self.error_code())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, FlowError>;

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error result.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, polars::error::PolarsError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| FlowError::Polars(e).with_context(context))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| FlowError::Io(e).with_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        assert_eq!(FlowError::state("x").error_code(), "STATE_ERROR");
        assert_eq!(
            FlowError::Conversion {
                from: StorageMethod::Columnar,
                to: TargetFormat::External,
            }
            .error_code(),
            "CONVERSION_ERROR"
        );
    }

    #[test]
    fn test_kind_groups_wrapped_backend_errors() {
        let io = FlowError::Io(std::io::Error::other("disk gone"));
        assert_eq!(io.kind(), ErrorKind::BackingStore);
        assert!(io.is_backing_store_error());
    }

    #[test]
    fn test_with_context_preserves_kind_and_code() {
        let error = FlowError::graph("cycle").with_context("While scheduling");
        assert!(error.to_string().contains("While scheduling"));
        assert_eq!(error.error_code(), "GRAPH_ERROR");
        assert!(error.is_graph_error());
    }

    #[test]
    fn test_conversion_message_names_formats() {
        let error = FlowError::Conversion {
            from: StorageMethod::External,
            to: TargetFormat::Table,
        };
        assert_eq!(
            error.to_string(),
            "Unsupported conversion from external storage to table"
        );
    }

    #[test]
    fn test_error_serialization() {
        let error = FlowError::MissingOutput {
            stage: "KFold".to_string(),
            key: "train0_1".to_string(),
        };
        let json = serde_json::to_string(&error).unwrap();
        assert!(json.contains("MISSING_OUTPUT"));
        assert!(json.contains("train0_1"));
    }
}
