//! Engine error types.

use crate::rules::Phase;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while driving a transaction or managing rule sets.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An operation was called out of phase order.
    #[error("'{operation}' is invalid in the {state} state")]
    InvalidState {
        /// The operation that was attempted.
        operation: &'static str,
        /// The state the transaction was in.
        state: String,
    },

    /// A body buffer cap was hit while appending.
    #[error("body buffer limit of {limit} bytes exceeded")]
    BufferLimitExceeded {
        /// The configured byte cap.
        limit: usize,
    },

    /// The rule-set collaborator reported a compilation failure.
    #[error("rule compilation failed: {0}")]
    RuleCompilation(String),

    /// A `skip-to` loop ran past the per-phase evaluation step cap.
    #[error("evaluation step cap of {cap} exceeded in {phase} phase")]
    EvaluationStepCapExceeded {
        /// The phase that was abandoned.
        phase: Phase,
        /// The configured cap.
        cap: usize,
    },

    /// An operation was attempted on a cleaned-up transaction.
    #[error("transaction used after cleanup")]
    UseAfterCleanup,

    /// Remote rule-set fetching is outside this engine's scope.
    #[error("remote rule sets are not supported: {uri}")]
    RemoteRulesUnsupported {
        /// The URI that was requested.
        uri: String,
    },

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Failed to read a rules or body file from disk.
    #[error("failed to read {}: {source}", path.display())]
    FileRead {
        /// Path that could not be read.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    /// Check if the transaction can continue to later phases after this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BufferLimitExceeded { .. } | Self::EvaluationStepCapExceeded { .. }
        )
    }

    /// Check if the error is a caller contract violation.
    #[must_use]
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::InvalidState { .. } | Self::UseAfterCleanup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::InvalidState {
            operation: "process_request_body",
            state: "Created".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "'process_request_body' is invalid in the Created state"
        );

        let err = EngineError::BufferLimitExceeded { limit: 1024 };
        assert!(err.to_string().contains("1024"));

        let err = EngineError::EvaluationStepCapExceeded {
            phase: Phase::RequestHeaders,
            cap: 1000,
        };
        assert!(err.to_string().contains("request-headers"));
    }

    #[test]
    fn test_is_recoverable() {
        assert!(EngineError::BufferLimitExceeded { limit: 1 }.is_recoverable());
        assert!(EngineError::EvaluationStepCapExceeded {
            phase: Phase::Logging,
            cap: 10,
        }
        .is_recoverable());

        assert!(!EngineError::UseAfterCleanup.is_recoverable());
        assert!(!EngineError::RuleCompilation("bad".to_string()).is_recoverable());
    }

    #[test]
    fn test_is_contract_violation() {
        assert!(EngineError::UseAfterCleanup.is_contract_violation());
        assert!(EngineError::InvalidState {
            operation: "cleanup",
            state: "Completed".to_string(),
        }
        .is_contract_violation());
        assert!(!EngineError::Config("x".to_string()).is_contract_violation());
    }
}
