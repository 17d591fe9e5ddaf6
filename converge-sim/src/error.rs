//! Errors returned by the simulated cloud API.

use converge::CodedError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error)]
pub enum SimError {
    /// The API answered with an error code.
    #[error("{code}: {message} (RequestId: {request_id})")]
    Api {
        code: String,
        message: String,
        request_id: String,
    },

    /// The connection failed; the request may or may not have been applied.
    #[error("transport error: {0}")]
    Transport(String),
}

impl SimError {
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        SimError::Api {
            code: code.into(),
            message: message.into(),
            request_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn instance_not_found(id: &str) -> Self {
        Self::api(
            "InvalidInstanceId.NotFound",
            format!("The specified instance {id} does not exist."),
        )
    }

    pub fn throttled() -> Self {
        Self::api("Throttling", "Request was denied due to request throttling.")
    }
}

impl CodedError for SimError {
    fn code(&self) -> Option<&str> {
        match self {
            SimError::Api { code, .. } => Some(code),
            SimError::Transport(_) => None,
        }
    }

    fn is_transport(&self) -> bool {
        matches!(self, SimError::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge::{Classification, CodeClassifier, ErrorClassifier};

    #[test]
    fn test_default_classification() {
        let classifier = CodeClassifier::default();

        assert_eq!(classifier.classify(&SimError::throttled()), Classification::RateLimited);
        assert_eq!(
            classifier.classify(&SimError::Transport("reset".into())),
            Classification::Retryable
        );
        assert_eq!(
            classifier.classify(&SimError::api("IncorrectInstanceStatus", "busy")),
            Classification::Retryable
        );

        let missing = SimError::instance_not_found("i-1");
        assert_eq!(classifier.classify(&missing), Classification::Fatal);
        assert!(classifier.is_not_found(&missing));
    }
}
