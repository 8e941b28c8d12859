//! Error types for the Trellis control plane

use thiserror::Error;

/// Main error type for Trellis operations
///
/// Per-object validation outcomes are deliberately NOT errors: they travel
/// as [`crate::status::StatusResult`] data so that one bad object can never
/// abort a rebuild. This enum covers the infrastructure paths only.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Snapshot serving error
    #[error("serve error: {0}")]
    Serve(String),

    /// Status write-back exhausted its retry attempts
    #[error("status reconciliation error: {0}")]
    StatusReconcile(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a serve error with the given message
    pub fn serve(msg: impl Into<String>) -> Self {
        Self::Serve(msg.into())
    }

    /// Create a status reconciliation error with the given message
    pub fn status_reconcile(msg: impl Into<String>) -> Self {
        Self::StatusReconcile(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: spec validation catches misconfigurations before they reach
    /// the graph builder
    #[test]
    fn story_validation_rejects_malformed_specs() {
        let err = Error::validation("route condition has an empty path prefix");
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("empty path prefix"));

        match Error::validation("any message") {
            Error::Validation(msg) => assert_eq!(msg, "any message"),
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: exhausted status retries surface as a reconciliation error,
    /// logged and abandoned by the caller rather than escalated
    #[test]
    fn story_status_exhaustion_is_non_fatal_data() {
        let err = Error::status_reconcile("gave up after 4 conflicts for shop/storefront");
        assert!(err.to_string().contains("status reconciliation error"));
        assert!(err.to_string().contains("shop/storefront"));
    }

    /// Story: error constructors accept both String and &str
    #[test]
    fn story_error_construction_ergonomics() {
        let dynamic = format!("proxy {} claims a duplicate fqdn", "shop/storefront");
        let err = Error::validation(dynamic);
        assert!(err.to_string().contains("shop/storefront"));

        let err = Error::serialization("static message");
        assert!(err.to_string().contains("static message"));
    }
}
