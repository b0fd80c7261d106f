use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

use crate::common::{is_retryable_status, truncate_for_log};

/// Session acquisition failures. Cloneable so every caller queued behind a
/// single login attempt receives the same settled outcome.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("login failed for {portal}: {message}")]
    LoginFailed { portal: String, message: String },

    #[error("login for {portal} timed out after {timeout:?}")]
    LoginTimeout { portal: String, timeout: Duration },
}

/// Job-level failure taxonomy. Adapters classify their portal's responses
/// into these; the orchestrator reacts to the tag, never to portal details.
#[derive(Debug, Error)]
pub enum ClassifiedError {
    #[error("session expired: {0}")]
    AuthExpired(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal failure: {0}")]
    Fatal(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl ClassifiedError {
    /// Map an unexpected HTTP status to the taxonomy. Callers handle success
    /// statuses and HTML sniffing before reaching for this.
    pub fn from_status(status: StatusCode, body: &str, retry_after: Option<Duration>) -> Self {
        let preview = truncate_for_log(body);
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Self::AuthExpired(format!("status {status}: {preview}"))
            }
            StatusCode::TOO_MANY_REQUESTS => Self::RateLimited {
                message: format!("status {status}: {preview}"),
                retry_after,
            },
            StatusCode::NOT_FOUND => Self::NotFound(format!("status {status}: {preview}")),
            _ if is_retryable_status(status) => {
                Self::Transient(format!("status {status}: {preview}"))
            }
            _ => Self::Fatal(format!("status {status}: {preview}")),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthExpired(_) => "auth_expired",
            Self::RateLimited { .. } => "rate_limited",
            Self::NotFound(_) => "not_found",
            Self::Transient(_) => "transient",
            Self::Fatal(_) => "fatal",
            Self::Timeout(_) => "timeout",
            Self::Auth(_) => "auth",
        }
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn rate_limit_hint(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// The only failure a bulk run propagates: nothing was attempted because the
/// first session could not be established. Everything after that point is
/// captured per-job inside the report.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed establishing initial {portal} session: {source}")]
    InitialAuth {
        portal: String,
        #[source]
        source: AuthError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_covers_the_taxonomy() {
        assert!(matches!(
            ClassifiedError::from_status(StatusCode::UNAUTHORIZED, "", None),
            ClassifiedError::AuthExpired(_)
        ));
        assert!(matches!(
            ClassifiedError::from_status(StatusCode::FORBIDDEN, "denied", None),
            ClassifiedError::AuthExpired(_)
        ));
        assert!(matches!(
            ClassifiedError::from_status(
                StatusCode::TOO_MANY_REQUESTS,
                "slow down",
                Some(Duration::from_secs(3)),
            ),
            ClassifiedError::RateLimited {
                retry_after: Some(_),
                ..
            }
        ));
        assert!(matches!(
            ClassifiedError::from_status(StatusCode::NOT_FOUND, "", None),
            ClassifiedError::NotFound(_)
        ));
        assert!(matches!(
            ClassifiedError::from_status(StatusCode::BAD_GATEWAY, "", None),
            ClassifiedError::Transient(_)
        ));
        assert!(matches!(
            ClassifiedError::from_status(StatusCode::IM_A_TEAPOT, "", None),
            ClassifiedError::Fatal(_)
        ));
    }

    #[test]
    fn kind_labels_are_stable() {
        let err = ClassifiedError::RateLimited {
            message: "x".into(),
            retry_after: None,
        };
        assert_eq!(err.kind(), "rate_limited");
        assert!(err.is_rate_limited());
        assert!(!err.is_auth_expired());
        assert_eq!(
            ClassifiedError::Timeout(Duration::from_secs(1)).kind(),
            "timeout"
        );
    }
}
