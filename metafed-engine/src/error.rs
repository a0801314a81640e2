//! Error types for metafed-engine
//!
//! Two layers:
//! - `SourceError` is what an individual source reports from one of its verbs.
//! - `EngineError` is what a caller observes on a terminal result. Source
//!   failures only surface as `EngineError::SourceFailed` when they come from
//!   the source the caller addressed; auxiliary sources consulted to fill in
//!   extra keys are logged and swallowed.

use thiserror::Error;

/// Error reported by a source
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceError {
    /// Network communication error
    #[error("Network error: {0}")]
    Network(String),

    /// Remote service returned an error
    #[error("API error: {0}")]
    Api(String),

    /// Failed to parse a response or stored data
    #[error("Parse error: {0}")]
    Parse(String),

    /// Requested item does not exist in this source
    #[error("Not found: {0}")]
    NotFound(String),

    /// Source cannot honour a search without text
    #[error("Search without text is not supported")]
    SearchNullTextUnsupported,

    /// Verb not implemented by this source
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Internal processing error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error delivered to callers of the engine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// The operation was cancelled before it produced its terminal result
    #[error("Operation cancelled")]
    OperationCancelled,

    /// The addressed source failed; its error is passed through
    #[error("Source '{source_id}' failed: {message}")]
    SourceFailed { source_id: String, message: String },

    /// No candidate source recognized the URI
    #[error("No source could create media from URI: {0}")]
    MediaFromUriFailed(String),

    /// Multiple search requested with no sources to search
    #[error("No searchable sources available")]
    NoSearchableSources,

    /// A source was asked to search with no text and cannot do that
    #[error("Source '{0}' does not support searching without text")]
    SearchNullTextUnsupported(String),

    /// Source id not present in the registry
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    /// Source does not implement the requested verb
    #[error("Source '{source_id}' does not support {operation}")]
    UnsupportedOperation {
        source_id: String,
        operation: &'static str,
    },

    /// Error from the common layer (configuration, I/O)
    #[error("Common error: {0}")]
    Common(String),

    /// Internal engine error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Convert a source failure into the error surfaced to the caller
    pub fn from_source(source_id: &str, error: SourceError) -> Self {
        match error {
            SourceError::SearchNullTextUnsupported => {
                EngineError::SearchNullTextUnsupported(source_id.to_string())
            }
            other => EngineError::SourceFailed {
                source_id: source_id.to_string(),
                message: other.to_string(),
            },
        }
    }

    /// True for the synthesized cancellation error
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::OperationCancelled)
    }
}

impl From<metafed_common::Error> for EngineError {
    fn from(err: metafed_common::Error) -> Self {
        EngineError::Common(err.to_string())
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_text_maps_to_dedicated_kind() {
        let err = EngineError::from_source("local", SourceError::SearchNullTextUnsupported);
        assert_eq!(err, EngineError::SearchNullTextUnsupported("local".to_string()));
    }

    #[test]
    fn test_source_failure_passes_message_through() {
        let err = EngineError::from_source("web", SourceError::Network("timed out".into()));
        match err {
            EngineError::SourceFailed { source_id, message } => {
                assert_eq!(source_id, "web");
                assert!(message.contains("timed out"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_common_error_conversion() {
        let err: EngineError = metafed_common::Error::Config("bad".into()).into();
        assert!(matches!(err, EngineError::Common(ref m) if m.contains("bad")));
        assert!(!err.is_cancelled());
        assert!(EngineError::OperationCancelled.is_cancelled());
    }
}
