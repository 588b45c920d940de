//! Errors surfaced by explicit sync actions.

use std::fmt;

use thiserror::Error;

use crate::retry::RetryFailure;

/// The outbound operations the sync core performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    LoadSession,
    UpdateCode,
    ExecuteCode,
    FeatureStudent,
    JoinSession,
}

impl Operation {
    pub fn label(&self) -> &'static str {
        match self {
            Operation::LoadSession => "load session",
            Operation::UpdateCode => "update code",
            Operation::ExecuteCode => "execute code",
            Operation::FeatureStudent => "feature student",
            Operation::JoinSession => "join session",
        }
    }

    /// Shown when the server did not say what went wrong.
    pub fn fallback_message(&self) -> &'static str {
        match self {
            Operation::LoadSession => "Failed to load session",
            Operation::UpdateCode => "Failed to save code",
            Operation::ExecuteCode => "Failed to execute code",
            Operation::FeatureStudent => "Failed to feature student",
            Operation::JoinSession => "Failed to join session",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A rejected action, ready to be shown next to whatever triggered it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct MutationError {
    pub operation: Operation,
    /// HTTP status of the final attempt, if the server answered
    pub status: Option<u16>,
    pub attempts: u32,
    pub message: String,
}

impl MutationError {
    pub fn from_failure(operation: Operation, failure: RetryFailure) -> Self {
        let message = failure
            .error
            .server_message()
            .unwrap_or_else(|| operation.fallback_message().to_string());
        Self {
            operation,
            status: failure.error.status(),
            attempts: failure.attempts,
            message,
        }
    }

    /// The call was skipped because the session is over.
    pub fn session_completed(operation: Operation) -> Self {
        Self {
            operation,
            status: None,
            attempts: 0,
            message: "Session has ended".to_string(),
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self.status, Some(400..=499))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeclass_shared::ApiError;

    #[test]
    fn falls_back_to_generic_message() {
        let err = MutationError::from_failure(
            Operation::ExecuteCode,
            RetryFailure {
                error: ApiError::Network("connection refused".into()),
                attempts: 3,
            },
        );
        assert_eq!(err.message, "Failed to execute code");
        assert_eq!(err.status, None);
        assert_eq!(err.to_string(), "Failed to execute code");
    }

    #[test]
    fn keeps_server_message_and_status() {
        let err = MutationError::from_failure(
            Operation::FeatureStudent,
            RetryFailure {
                error: ApiError::Http {
                    status: 403,
                    body: r#"{"error":"Only instructors can feature students"}"#.into(),
                },
                attempts: 1,
            },
        );
        assert_eq!(err.message, "Only instructors can feature students");
        assert!(err.is_client_error());
    }
}
