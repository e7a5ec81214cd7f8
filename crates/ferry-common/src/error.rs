//! Error types shared across Ferry crates

use thiserror::Error;

/// Main error type for shared Ferry operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Internal error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g., "create_client", "create_secret")
        context: String,
    },
}

impl Error {
    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_error_carries_context() {
        let err = Error::internal_with_context("create_client", "failed to infer config");
        assert_eq!(
            err.to_string(),
            "internal error [create_client]: failed to infer config"
        );
    }

    #[test]
    fn kube_errors_convert() {
        let err: Error = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "secrets \"keystore\" is forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        })
        .into();
        assert!(matches!(err, Error::Kube { .. }));
        assert!(err.to_string().starts_with("kubernetes error"));
    }
}
