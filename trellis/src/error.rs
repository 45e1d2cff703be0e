//! Gateway error taxonomy.
//!
//! One enum per failure policy in the error-handling design: the HTTP layer
//! maps variants onto status codes, adapters classify upstream transport
//! failures as retryable or fatal, and tool failures stay non-fatal (they are
//! fed back to the model as error results instead of surfacing here).

use thiserror::Error;

/// Top-level request failure.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing or mismatched bearer / instance token. No body detail.
    #[error("unauthorized")]
    Unauthorized,

    /// Malformed request: missing field, bad slug, oversized upload.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Source instance failed the allow-list check.
    #[error("instance not allowed: {0}")]
    InstanceNotAllowed(String),

    /// Upstream LLM API failure. `retryable` preserves the transport
    /// classification even though the gateway does not retry.
    #[error("provider error: {message}")]
    Provider { message: String, retryable: bool },

    /// The tool-use loop exceeded its iteration bound.
    #[error("tool loop exceeded {max} iterations")]
    IterationOverflow { max: u32 },

    /// Persistence failure (logged; requests still answer).
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Sandbox container lifecycle failure.
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// File-recall subsystem failure.
    #[error("recall error: {0}")]
    Recall(String),

    /// Local filesystem failure in the pipeline (volumes, proxies, side-cars).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Transient upstream failure; the caller may retry.
    pub fn provider_retryable(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
            retryable: true,
        }
    }

    /// Permanent upstream failure (auth, schema validation).
    pub fn provider_fatal(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Persistence store failure classification.
///
/// `Corrupt` is fatal and surfaces to the gateway; `NotFound` is semantic and
/// callers translate it to an empty result.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database corrupt: {0}")]
    Corrupt(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(inner, _)
                if matches!(
                    inner.code,
                    rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
                ) =>
            {
                StoreError::Corrupt(e.to_string())
            }
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(e.to_string()),
            _ => StoreError::Storage(e.to_string()),
        }
    }
}

/// Tool execution failure, returned to the model as an error tool result.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("invalid arguments: {0}")]
    InvalidInput(String),

    /// Backend/transport failure while executing the tool.
    #[error("{0}")]
    Execution(String),
}

impl ToolError {
    /// Shorthand for backend failures with formatted context.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: Display strings carry the policy-relevant detail.
    #[test]
    fn display_formats() {
        let e = GatewayError::InstanceNotAllowed("192.168.1.5".into());
        assert!(e.to_string().contains("192.168.1.5"));

        let e = GatewayError::IterationOverflow { max: 5 };
        assert!(e.to_string().contains('5'));

        let e = ToolError::InvalidInput("missing query".into());
        assert!(e.to_string().contains("missing query"));
    }

    /// **Scenario**: retryable classification is preserved on provider errors.
    #[test]
    fn provider_error_retryable_flag() {
        match GatewayError::provider_retryable("503 from upstream") {
            GatewayError::Provider { retryable, .. } => assert!(retryable),
            _ => panic!("wrong variant"),
        }
        match GatewayError::provider_fatal("bad api key") {
            GatewayError::Provider { retryable, .. } => assert!(!retryable),
            _ => panic!("wrong variant"),
        }
    }

    /// **Scenario**: QueryReturnedNoRows maps to the semantic NotFound class.
    #[test]
    fn rusqlite_no_rows_maps_to_not_found() {
        let e: StoreError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(e, StoreError::NotFound(_)));
    }
}
