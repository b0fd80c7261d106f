use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AuthError, ClassifiedError};
use crate::session::{SessionArtifact, SessionHandle};

/// Outcome of a cheap authenticated probe against the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionProbe {
    Valid,
    Expired,
}

/// One patient from the roster. `subscriber_id` + `date_of_birth` are what
/// every portal keys lookups on; names are optional extras some carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInput {
    pub subscriber_id: String,
    pub date_of_birth: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

impl JobInput {
    pub fn display_name(&self) -> String {
        if !self.first_name.is_empty() && !self.last_name.is_empty() {
            format!("{} {}", self.first_name, self.last_name)
        } else {
            format!("Member ID: {}", self.subscriber_id)
        }
    }
}

/// Everything portal-specific lives behind this seam: HTTP/browser
/// mechanics, endpoint shapes, and the content sniffing that decides whether
/// a response means the session is gone. The core only reacts to the
/// classified tags.
#[async_trait]
pub trait PortalAdapter: Send + Sync {
    fn portal_id(&self) -> &str;

    /// Perform a fresh authentication and produce a new session artifact.
    async fn login(&self) -> Result<SessionArtifact, AuthError>;

    /// Cheap validity probe for an artifact of unknown freshness.
    async fn check_session(&self, handle: &SessionHandle)
    -> Result<SessionProbe, ClassifiedError>;

    /// Run one patient's extraction against a live session.
    async fn extract(
        &self,
        handle: &SessionHandle,
        input: &JobInput,
    ) -> Result<Value, ClassifiedError>;
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    };
    use std::time::Duration;

    type ExtractFn =
        Box<dyn Fn(&SessionHandle, &JobInput, u32) -> Result<Value, ClassifiedError> + Send + Sync>;
    type DelayFn = Box<dyn Fn(&JobInput) -> Duration + Send + Sync>;

    /// Scripted in-memory portal for session and orchestrator tests. The
    /// extract closure sees the live session handle and the per-subscriber
    /// attempt number (1-based), so tests can fail against a stale artifact
    /// or only on the first call.
    pub struct ScriptedAdapter {
        portal: String,
        pub login_calls: AtomicU32,
        pub extract_calls: AtomicU32,
        login_delay: Duration,
        login_script: Mutex<VecDeque<Result<SessionArtifact, AuthError>>>,
        probe: Mutex<SessionProbe>,
        extract: ExtractFn,
        extract_delay: DelayFn,
        attempts: Mutex<HashMap<String, u32>>,
    }

    impl ScriptedAdapter {
        pub fn ok(portal: &str) -> Self {
            Self {
                portal: portal.to_string(),
                login_calls: AtomicU32::new(0),
                extract_calls: AtomicU32::new(0),
                login_delay: Duration::ZERO,
                login_script: Mutex::new(VecDeque::new()),
                probe: Mutex::new(SessionProbe::Valid),
                extract: Box::new(|_, input, _| {
                    Ok(json!({
                        "summary": {
                            "plan_name": "Test Plan",
                            "member_id": input.subscriber_id,
                        }
                    }))
                }),
                extract_delay: Box::new(|_| Duration::ZERO),
                attempts: Mutex::new(HashMap::new()),
            }
        }

        pub fn with_extract(
            mut self,
            extract: impl Fn(&SessionHandle, &JobInput, u32) -> Result<Value, ClassifiedError>
            + Send
            + Sync
            + 'static,
        ) -> Self {
            self.extract = Box::new(extract);
            self
        }

        pub fn with_extract_delay(
            mut self,
            delay: impl Fn(&JobInput) -> Duration + Send + Sync + 'static,
        ) -> Self {
            self.extract_delay = Box::new(delay);
            self
        }

        pub fn with_login_delay(mut self, delay: Duration) -> Self {
            self.login_delay = delay;
            self
        }

        /// Queue an explicit outcome for the next login; once the queue is
        /// drained every further login succeeds with a fresh artifact.
        pub fn push_login_outcome(&self, outcome: Result<SessionArtifact, AuthError>) {
            self.login_script
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push_back(outcome);
        }

        pub fn set_probe(&self, probe: SessionProbe) {
            *self
                .probe
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = probe;
        }

        pub fn test_artifact(login_number: u32) -> SessionArtifact {
            SessionArtifact::new(json!({ "token": format!("token-{login_number}") }), None)
        }
    }

    #[async_trait]
    impl PortalAdapter for ScriptedAdapter {
        fn portal_id(&self) -> &str {
            &self.portal
        }

        async fn login(&self) -> Result<SessionArtifact, AuthError> {
            let login_number = self.login_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.login_delay.is_zero() {
                tokio::time::sleep(self.login_delay).await;
            }
            let scripted = self
                .login_script
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .pop_front();
            match scripted {
                Some(outcome) => outcome,
                None => Ok(Self::test_artifact(login_number)),
            }
        }

        async fn check_session(
            &self,
            _handle: &SessionHandle,
        ) -> Result<SessionProbe, ClassifiedError> {
            Ok(*self
                .probe
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner))
        }

        async fn extract(
            &self,
            handle: &SessionHandle,
            input: &JobInput,
        ) -> Result<Value, ClassifiedError> {
            self.extract_calls.fetch_add(1, Ordering::SeqCst);
            let attempt = {
                let mut attempts = self
                    .attempts
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let counter = attempts.entry(input.subscriber_id.clone()).or_insert(0);
                *counter += 1;
                *counter
            };
            let delay = (self.extract_delay)(input);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            (self.extract)(handle, input, attempt)
        }
    }

    pub fn input(subscriber_id: &str) -> JobInput {
        JobInput {
            subscriber_id: subscriber_id.to_string(),
            date_of_birth: "1985-03-07".to_string(),
            first_name: String::new(),
            last_name: String::new(),
        }
    }
}
