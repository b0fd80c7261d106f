use async_trait::async_trait;
use reqwest::{
    Client,
    header::{COOKIE, RETRY_AFTER},
};
use serde_json::{Value, json};
use std::path::PathBuf;
use tokio::process::Command;

use crate::common::{is_html_document, parse_retry_after, truncate_for_log};
use crate::constants::DDINS_PROVIDER_TOOLS_REFERER;
use crate::error::{AuthError, ClassifiedError};
use crate::portal::{JobInput, PortalAdapter, SessionProbe};
use crate::session::{SessionArtifact, SessionHandle};

const PORTAL_ID: &str = "ddins";
const API_PREFIX: &str = "/provider-tools/v2/api";

/// Delta Dental rides on browser cookies plus a `pt-userid` header. The
/// interactive Okta login cannot be driven from here, so `login` shells out
/// to a configured command that refreshes a storage-state JSON file, then
/// distills that file into a session artifact. The portal answers expired
/// sessions with its login page, so every response gets HTML-sniffed.
pub struct DdinsAdapter {
    client: Client,
    base_url: String,
    storage_state_path: PathBuf,
    login_command: Option<String>,
    pt_user_id: Option<String>,
}

impl DdinsAdapter {
    pub fn new(
        client: Client,
        base_url: String,
        storage_state_path: PathBuf,
        login_command: Option<String>,
        pt_user_id: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url,
            storage_state_path,
            login_command,
            pt_user_id,
        }
    }

    fn artifact_from_storage_state(&self) -> Result<SessionArtifact, AuthError> {
        let text = std::fs::read_to_string(&self.storage_state_path).map_err(|err| {
            AuthError::LoginFailed {
                portal: PORTAL_ID.to_string(),
                message: format!(
                    "no storage state at {}: {err}",
                    self.storage_state_path.display()
                ),
            }
        })?;
        let state: Value =
            serde_json::from_str(&text).map_err(|err| AuthError::LoginFailed {
                portal: PORTAL_ID.to_string(),
                message: format!(
                    "invalid storage state at {}: {err}",
                    self.storage_state_path.display()
                ),
            })?;

        let cookie_header = state
            .get("cookies")
            .and_then(Value::as_array)
            .map(|cookies| {
                cookies
                    .iter()
                    .filter_map(|cookie| {
                        let name = cookie.get("name").and_then(Value::as_str)?;
                        let value = cookie.get("value").and_then(Value::as_str)?;
                        Some(format!("{name}={value}"))
                    })
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .unwrap_or_default();
        if cookie_header.is_empty() {
            return Err(AuthError::LoginFailed {
                portal: PORTAL_ID.to_string(),
                message: format!(
                    "storage state at {} carries no cookies",
                    self.storage_state_path.display()
                ),
            });
        }

        let pt_user_id = self
            .pt_user_id
            .clone()
            .or_else(|| {
                state
                    .get("ptUserId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .ok_or_else(|| AuthError::LoginFailed {
                portal: PORTAL_ID.to_string(),
                message: "no pt-userid available (set DDINS_PT_USERID or include ptUserId in the storage state)".to_string(),
            })?;

        Ok(SessionArtifact::new(
            json!({ "cookie": cookie_header, "pt-userid": pt_user_id }),
            None,
        ))
    }

    fn session_headers(handle: &SessionHandle) -> Result<(String, String), ClassifiedError> {
        let cookie = handle.artifact.value("cookie").ok_or_else(|| {
            ClassifiedError::AuthExpired("session artifact carries no cookies".to_string())
        })?;
        let pt_user_id = handle.artifact.value("pt-userid").ok_or_else(|| {
            ClassifiedError::AuthExpired("session artifact carries no pt-userid".to_string())
        })?;
        Ok((cookie.to_string(), pt_user_id.to_string()))
    }

    async fn get_json(
        &self,
        handle: &SessionHandle,
        path: &str,
        enrollee_id: Option<&str>,
        query: &[(&str, &str)],
    ) -> Result<Value, ClassifiedError> {
        let (cookie, pt_user_id) = Self::session_headers(handle)?;
        let mut request = self
            .client
            .get(format!("{}{API_PREFIX}{path}", self.base_url))
            .header(COOKIE, cookie)
            .header("pt-userid", pt_user_id)
            .header("accept", "application/json, text/plain, */*")
            .header("referer", DDINS_PROVIDER_TOOLS_REFERER);
        if let Some(enrollee_id) = enrollee_id {
            request = request.header("enrolleeid", enrollee_id);
        }
        if !query.is_empty() {
            request = request.query(query);
        }

        let response = request.send().await.map_err(|err| {
            ClassifiedError::Transient(format!("request to {path} failed: {err}"))
        })?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
        let text = response.text().await.unwrap_or_default();

        if status.is_success() {
            if is_html_document(&text) {
                return Err(ClassifiedError::AuthExpired(format!(
                    "{path} answered with the login page (status {status}). Preview: {}",
                    truncate_for_log(&text)
                )));
            }
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text).map_err(|err| {
                ClassifiedError::Fatal(format!(
                    "invalid JSON from {path}: {err}. Body: {}",
                    truncate_for_log(&text)
                ))
            });
        }

        if is_html_document(&text) {
            return Err(ClassifiedError::AuthExpired(format!(
                "{path} answered with the login page (status {status})"
            )));
        }
        Err(ClassifiedError::from_status(status, &text, retry_after))
    }
}

#[async_trait]
impl PortalAdapter for DdinsAdapter {
    fn portal_id(&self) -> &str {
        PORTAL_ID
    }

    async fn login(&self) -> Result<SessionArtifact, AuthError> {
        if let Some(command) = &self.login_command {
            println!("ddins: running external login command");
            let output = Command::new("sh")
                .arg("-c")
                .arg(command)
                .output()
                .await
                .map_err(|err| AuthError::LoginFailed {
                    portal: PORTAL_ID.to_string(),
                    message: format!("could not launch login command: {err}"),
                })?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(AuthError::LoginFailed {
                    portal: PORTAL_ID.to_string(),
                    message: format!(
                        "login command exited with {}: {}",
                        output.status,
                        truncate_for_log(&stderr)
                    ),
                });
            }
        } else {
            println!(
                "ddins: no login command configured; reading {} as-is",
                self.storage_state_path.display()
            );
        }

        self.artifact_from_storage_state()
    }

    async fn check_session(
        &self,
        handle: &SessionHandle,
    ) -> Result<SessionProbe, ClassifiedError> {
        // The persons endpoint is the lightest authenticated call the portal
        // offers; HTML instead of JSON means the session is gone.
        match self
            .get_json(handle, "/eligibility/persons", None, &[])
            .await
        {
            Ok(_) => Ok(SessionProbe::Valid),
            Err(err) if err.is_auth_expired() => Ok(SessionProbe::Expired),
            Err(err) => Err(err),
        }
    }

    async fn extract(
        &self,
        handle: &SessionHandle,
        input: &JobInput,
    ) -> Result<Value, ClassifiedError> {
        let enrollee_id = input.subscriber_id.as_str();

        let eligibility = self
            .get_json(
                handle,
                &format!("/eligibility/patient/{enrollee_id}"),
                Some(enrollee_id),
                &[],
            )
            .await?;
        if eligibility.is_null() {
            return Err(ClassifiedError::NotFound(format!(
                "no eligibility for enrollee {enrollee_id}"
            )));
        }

        let (benefits_package, maximums_deductibles, treatment_history, claims) = futures::join!(
            self.get_json(handle, "/benefits/benefits-package", Some(enrollee_id), &[]),
            self.get_json(
                handle,
                "/benefits/maximums-deductibles",
                Some(enrollee_id),
                &[],
            ),
            self.get_json(handle, "/treatment-history", Some(enrollee_id), &[]),
            self.get_json(
                handle,
                "/claims",
                Some(enrollee_id),
                &[
                    ("timePeriod", "12"),
                    ("pageNumber", "1"),
                    ("pageSize", "50"),
                    ("claimTransactionType", "All Claims"),
                ],
            ),
        );

        let benefits_package = tolerate_partial("benefits-package", benefits_package)?;
        let maximums_deductibles =
            tolerate_partial("maximums-deductibles", maximums_deductibles)?;
        let treatment_history = tolerate_partial("treatment-history", treatment_history)?;
        let claims = tolerate_partial("claims", claims)?;

        let summary = build_summary(
            input,
            &eligibility,
            &maximums_deductibles,
            &treatment_history,
            &claims,
        );

        Ok(json!({
            "portal": PORTAL_ID,
            "patient": input,
            "eligibility": eligibility,
            "benefits_package": benefits_package,
            "maximums_deductibles": maximums_deductibles,
            "treatment_history": treatment_history,
            "claims": claims,
            "summary": summary,
        }))
    }
}

fn tolerate_partial(
    endpoint: &str,
    result: Result<Value, ClassifiedError>,
) -> Result<Value, ClassifiedError> {
    match result {
        Ok(value) => Ok(value),
        Err(err) if err.is_auth_expired() || err.is_rate_limited() => Err(err),
        Err(err) => {
            println!("ddins: {endpoint} fetch failed ({err}); continuing without it");
            Ok(Value::Null)
        }
    }
}

fn build_summary(
    input: &JobInput,
    eligibility: &Value,
    maximums_deductibles: &Value,
    treatment_history: &Value,
    claims: &Value,
) -> Value {
    let plan_name = eligibility
        .get("groupName")
        .or_else(|| eligibility.get("planName"))
        .and_then(Value::as_str)
        .unwrap_or("Unknown");
    let status = eligibility
        .get("eligibilityStatus")
        .or_else(|| eligibility.get("status"))
        .and_then(Value::as_str)
        .unwrap_or("Unknown");

    let first_bucket = |section: &str| {
        maximums_deductibles
            .get(section)
            .and_then(Value::as_array)
            .and_then(|buckets| buckets.first())
            .cloned()
            .unwrap_or(Value::Null)
    };
    let money_pair = |bucket: &Value, used_label: &str| {
        let amount = bucket.get("amount").and_then(Value::as_f64);
        let remaining = bucket.get("remainingAmount").and_then(Value::as_f64);
        match (amount, remaining) {
            (Some(amount), Some(remaining)) => json!({
                "amount": amount,
                used_label: amount - remaining,
                "remaining": remaining,
            }),
            _ => Value::Null,
        }
    };

    let treatment_count = treatment_history
        .get("procedures")
        .and_then(Value::as_array)
        .map(Vec::len)
        .or_else(|| treatment_history.as_array().map(Vec::len))
        .unwrap_or(0);
    let claims_count = claims
        .get("claims")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);

    json!({
        "patient_name": input.display_name(),
        "member_id": input.subscriber_id,
        "plan_name": plan_name,
        "status": status,
        "deductible": money_pair(&first_bucket("deductibles"), "met"),
        "annual_maximum": money_pair(&first_bucket("maximums"), "used"),
        "treatment_count": treatment_count,
        "claims_count": claims_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_reads_bucketed_maximums_and_deductibles() {
        let input = JobInput {
            subscriber_id: "123456789".into(),
            date_of_birth: "1985-03-07".into(),
            first_name: String::new(),
            last_name: String::new(),
        };
        let eligibility = json!({ "groupName": "Delta PPO", "eligibilityStatus": "Active" });
        let maximums_deductibles = json!({
            "deductibles": [{ "amount": 50.0, "remainingAmount": 25.0 }],
            "maximums": [{ "amount": 2000.0, "remainingAmount": 1750.0 }],
        });
        let treatment_history = json!({ "procedures": [{}, {}] });
        let claims = json!({ "claims": [{}] });

        let summary = build_summary(
            &input,
            &eligibility,
            &maximums_deductibles,
            &treatment_history,
            &claims,
        );
        assert_eq!(summary["plan_name"], "Delta PPO");
        assert_eq!(summary["status"], "Active");
        assert_eq!(summary["deductible"]["met"], 25.0);
        assert_eq!(summary["annual_maximum"]["remaining"], 1750.0);
        assert_eq!(summary["treatment_count"], 2);
        assert_eq!(summary["claims_count"], 1);
    }

    #[test]
    fn storage_state_is_distilled_into_a_cookie_artifact() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("storageState.json");
        std::fs::write(
            &path,
            serde_json::to_string(&json!({
                "cookies": [
                    { "name": "JSESSIONID", "value": "abc123", "domain": ".deltadentalins.com" },
                    { "name": "okta-token", "value": "xyz" },
                ],
                "ptUserId": "AcmeDental",
            }))
            .expect("serialize"),
        )
        .expect("write");

        let adapter = DdinsAdapter::new(
            Client::new(),
            "https://example.invalid".into(),
            path,
            None,
            None,
        );
        let artifact = adapter
            .artifact_from_storage_state()
            .expect("artifact should build");
        assert_eq!(
            artifact.value("cookie"),
            Some("JSESSIONID=abc123; okta-token=xyz")
        );
        assert_eq!(artifact.value("pt-userid"), Some("AcmeDental"));
    }

    #[test]
    fn missing_cookies_fail_the_login() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("storageState.json");
        std::fs::write(&path, "{\"cookies\": []}").expect("write");

        let adapter = DdinsAdapter::new(
            Client::new(),
            "https://example.invalid".into(),
            path,
            None,
            Some("AcmeDental".into()),
        );
        assert!(adapter.artifact_from_storage_state().is_err());
    }

    #[test]
    fn absent_storage_state_reports_its_path() {
        let adapter = DdinsAdapter::new(
            Client::new(),
            "https://example.invalid".into(),
            PathBuf::from("/nonexistent/storageState.json"),
            None,
            None,
        );
        match adapter.artifact_from_storage_state() {
            Err(AuthError::LoginFailed { message, .. }) => {
                assert!(message.contains("/nonexistent/storageState.json"));
            }
            other => panic!("expected a login failure, got {other:?}"),
        }
    }
}
