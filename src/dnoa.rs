use async_trait::async_trait;
use reqwest::{Client, StatusCode, header::RETRY_AFTER};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::time::sleep;

use crate::common::{
    is_html_document, is_retryable_status, now_unix_seconds, parse_retry_after, truncate_for_log,
};
use crate::constants::DNOA_SESSION_TTL_SECS;
use crate::error::{AuthError, ClassifiedError};
use crate::portal::{JobInput, PortalAdapter, SessionProbe};
use crate::session::{SessionArtifact, SessionHandle};

const PORTAL_ID: &str = "dnoa";
const AUTH_TOKEN_HEADER: &str = "x-auth-token";
const MAX_HTTP_ATTEMPTS: u32 = 3;

/// DNOA speaks plain JSON once you hold an `x-auth-token`. Member search
/// yields a policy reference hash that keys every follow-up benefits call.
pub struct DnoaAdapter {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl DnoaAdapter {
    pub fn new(
        client: Client,
        base_url: String,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url,
            username,
            password,
        }
    }

    fn token_of(handle: &SessionHandle) -> Result<&str, ClassifiedError> {
        handle.artifact.value(AUTH_TOKEN_HEADER).ok_or_else(|| {
            ClassifiedError::AuthExpired("session artifact carries no x-auth-token".to_string())
        })
    }

    /// GET a JSON endpoint with the session token, retrying transient server
    /// trouble with backoff. 429 surfaces immediately so the orchestrator
    /// owns the cooldown.
    async fn get_json(
        &self,
        token: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Value, ClassifiedError> {
        self.request_json(token, path, query, None).await
    }

    async fn request_json(
        &self,
        token: &str,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value, ClassifiedError> {
        let url = format!("{}{}", self.base_url, path);
        let mut backoff = Duration::from_secs(1);

        for attempt in 1..=MAX_HTTP_ATTEMPTS {
            let mut request = match body {
                Some(body) => self.client.post(&url).json(body),
                None => self.client.get(&url),
            };
            request = request.header(AUTH_TOKEN_HEADER, token);
            if !query.is_empty() {
                request = request.query(query);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    if attempt == MAX_HTTP_ATTEMPTS {
                        return Err(ClassifiedError::Transient(format!(
                            "request to {path} failed after {attempt} attempts: {err}"
                        )));
                    }
                    sleep(backoff).await;
                    backoff = (backoff + backoff).min(Duration::from_secs(30));
                    continue;
                }
            };

            let status = response.status();
            let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
            let text = response.text().await.unwrap_or_default();

            if status.is_success() {
                if is_html_document(&text) {
                    return Err(ClassifiedError::AuthExpired(format!(
                        "{path} returned the login page where JSON was expected"
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

            if status != StatusCode::TOO_MANY_REQUESTS
                && is_retryable_status(status)
                && attempt < MAX_HTTP_ATTEMPTS
            {
                sleep(retry_after.unwrap_or(backoff)).await;
                backoff = (backoff + backoff).min(Duration::from_secs(30));
                continue;
            }

            return Err(ClassifiedError::from_status(status, &text, retry_after));
        }

        Err(ClassifiedError::Transient(format!(
            "unexpected request flow for {path}"
        )))
    }
}

#[async_trait]
impl PortalAdapter for DnoaAdapter {
    fn portal_id(&self) -> &str {
        PORTAL_ID
    }

    async fn login(&self) -> Result<SessionArtifact, AuthError> {
        let (username, password) = match (&self.username, &self.password) {
            (Some(username), Some(password)) => (username, password),
            _ => {
                return Err(AuthError::LoginFailed {
                    portal: PORTAL_ID.to_string(),
                    message: "DNOA credentials missing (set DNOA_USERNAME / DNOA_PASSWORD)"
                        .to_string(),
                });
            }
        };

        let response = self
            .client
            .post(format!("{}/authentication", self.base_url))
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await
            .map_err(|err| AuthError::LoginFailed {
                portal: PORTAL_ID.to_string(),
                message: format!("login request failed: {err}"),
            })?;

        let status = response.status();
        let header_token = response
            .headers()
            .get(AUTH_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(AuthError::LoginFailed {
                portal: PORTAL_ID.to_string(),
                message: format!(
                    "login rejected with status {status}. Body: {}",
                    truncate_for_log(&text)
                ),
            });
        }

        // The SPA exposes the token as a response header; older deployments
        // put it in the body instead.
        let token = header_token.or_else(|| {
            serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|body| {
                    body.get("token")
                        .or_else(|| body.get(AUTH_TOKEN_HEADER))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
        });

        match token {
            Some(token) => Ok(SessionArtifact::new(
                json!({ AUTH_TOKEN_HEADER: token }),
                Some(now_unix_seconds() + DNOA_SESSION_TTL_SECS),
            )),
            None => Err(AuthError::LoginFailed {
                portal: PORTAL_ID.to_string(),
                message: "login succeeded but no x-auth-token was issued".to_string(),
            }),
        }
    }

    async fn check_session(
        &self,
        handle: &SessionHandle,
    ) -> Result<SessionProbe, ClassifiedError> {
        let token = Self::token_of(handle)?;
        let response = self
            .client
            .get(format!("{}/members", self.base_url))
            .header(AUTH_TOKEN_HEADER, token)
            .send()
            .await
            .map_err(|err| ClassifiedError::Transient(format!("session probe failed: {err}")))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Ok(SessionProbe::Expired);
        }
        let text = response.text().await.unwrap_or_default();
        if is_html_document(&text) {
            return Ok(SessionProbe::Expired);
        }
        Ok(SessionProbe::Valid)
    }

    async fn extract(
        &self,
        handle: &SessionHandle,
        input: &JobInput,
    ) -> Result<Value, ClassifiedError> {
        let token = Self::token_of(handle)?;
        let criteria = [
            ("dateOfBirth", input.date_of_birth.as_str()),
            ("subscriberId", input.subscriber_id.as_str()),
        ];

        let members = self.get_json(token, "/members", &criteria).await?;
        let members = match members {
            Value::Array(members) if !members.is_empty() => members,
            Value::Array(_) | Value::Null => {
                return Err(ClassifiedError::NotFound(format!(
                    "no members found for subscriber {}",
                    input.subscriber_id
                )));
            }
            other => {
                return Err(ClassifiedError::Fatal(format!(
                    "unexpected member search shape: {}",
                    truncate_for_log(&other.to_string())
                )));
            }
        };

        let policy = members[0]
            .get("policies")
            .and_then(Value::as_array)
            .and_then(|policies| policies.first())
            .cloned()
            .unwrap_or(Value::Null);
        let reference_id = policy
            .get("referenceId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ClassifiedError::NotFound(format!(
                    "subscriber {} has no active policy",
                    input.subscriber_id
                ))
            })?;

        let member_path = |endpoint: &str| format!("/members/{reference_id}/{endpoint}");
        let claims_body = json!({
            "searchCriteria": {
                "member": { "referenceId": reference_id },
                "type": "claim",
                "subscriberId": input.subscriber_id,
            },
            "member": members[0].clone(),
        });

        let accumulators_path = member_path("planAccumulators");
        let benefits_path = member_path("benefits");
        let procedure_history_path = member_path("procedureHistory");
        let plan_summary_path = member_path("planSummary");
        let (accumulators, benefits, procedure_history, plan_summary, claims) = futures::join!(
            self.get_json(token, &accumulators_path, &criteria),
            self.get_json(token, &benefits_path, &criteria),
            self.get_json(token, &procedure_history_path, &[]),
            self.get_json(token, &plan_summary_path, &criteria),
            self.request_json(token, "/claims", &[], Some(&claims_body)),
        );

        let accumulators = tolerate_partial("planAccumulators", accumulators)?;
        let benefits = tolerate_partial("benefits", benefits)?;
        let procedure_history = tolerate_partial("procedureHistory", procedure_history)?;
        let plan_summary = tolerate_partial("planSummary", plan_summary)?;
        let claims = tolerate_partial("claims", claims)?;

        let summary = build_summary(input, &policy, &accumulators, &benefits, &claims);

        Ok(json!({
            "portal": PORTAL_ID,
            "patient": input,
            "extracted_at_unix": now_unix_seconds(),
            "members": members,
            "plan_accumulators": accumulators,
            "benefits": benefits,
            "procedure_history": procedure_history,
            "plan_summary": plan_summary,
            "claims": claims,
            "summary": summary,
        }))
    }
}

/// Benefit sub-fetches may fail individually without sinking the patient;
/// only session expiry and rate limiting must surface to the orchestrator.
fn tolerate_partial(
    endpoint: &str,
    result: Result<Value, ClassifiedError>,
) -> Result<Value, ClassifiedError> {
    match result {
        Ok(value) => Ok(value),
        Err(err) if err.is_auth_expired() || err.is_rate_limited() => Err(err),
        Err(err) => {
            println!("dnoa: {endpoint} fetch failed ({err}); continuing without it");
            Ok(Value::Null)
        }
    }
}

fn build_summary(
    input: &JobInput,
    policy: &Value,
    accumulators: &Value,
    benefits: &Value,
    claims: &Value,
) -> Value {
    let individual = |section: &str| {
        accumulators
            .get(section)
            .and_then(|v| v.get("benefitPeriod"))
            .and_then(|v| v.get("individual"))
            .cloned()
            .unwrap_or(Value::Null)
    };
    let money_pair = |bucket: &Value, used_label: &str| {
        let amount = bucket.get("amountInNetwork").and_then(Value::as_f64);
        let remaining = bucket.get("remainingInNetwork").and_then(Value::as_f64);
        match (amount, remaining) {
            (Some(amount), Some(remaining)) => json!({
                "amount": amount,
                used_label: amount - remaining,
                "remaining": remaining,
            }),
            _ => Value::Null,
        }
    };

    let claim_list = claims
        .get("claims")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let total_billed: f64 = claim_list
        .iter()
        .filter_map(|claim| claim.get("billedAmount").and_then(Value::as_f64))
        .sum();
    let total_paid: f64 = claim_list
        .iter()
        .filter_map(|claim| claim.get("paidAmount").and_then(Value::as_f64))
        .sum();

    json!({
        "patient_name": input.display_name(),
        "member_id": input.subscriber_id,
        "plan_name": policy.get("groupName").and_then(Value::as_str).unwrap_or("Unknown"),
        "status": policy.get("status").and_then(Value::as_str).unwrap_or("Unknown"),
        "deductible": money_pair(&individual("deductible"), "met"),
        "annual_maximum": money_pair(&individual("maximum"), "used"),
        "benefit_categories": benefits
            .get("categories")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0),
        "claims_count": claim_list.len(),
        "total_billed": total_billed,
        "total_paid": total_paid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_reads_the_accumulator_shapes_the_portal_returns() {
        let input = JobInput {
            subscriber_id: "A123".into(),
            date_of_birth: "1985-03-07".into(),
            first_name: "Jane".into(),
            last_name: "Doe".into(),
        };
        let policy = json!({ "groupName": "Acme Dental PPO", "status": "Active" });
        let accumulators = json!({
            "deductible": { "benefitPeriod": { "individual": {
                "amountInNetwork": 50.0, "remainingInNetwork": 40.0 } } },
            "maximum": { "benefitPeriod": { "individual": {
                "amountInNetwork": 1500.0, "remainingInNetwork": 1200.0 } } },
        });
        let benefits = json!({ "categories": [{}, {}, {}] });
        let claims = json!({ "claims": [
            { "billedAmount": 120.0, "paidAmount": 80.0 },
            { "billedAmount": 60.5, "paidAmount": 30.0 },
        ]});

        let summary = build_summary(&input, &policy, &accumulators, &benefits, &claims);
        assert_eq!(summary["patient_name"], "Jane Doe");
        assert_eq!(summary["plan_name"], "Acme Dental PPO");
        assert_eq!(summary["deductible"]["remaining"], 40.0);
        assert_eq!(summary["deductible"]["met"], 10.0);
        assert_eq!(summary["annual_maximum"]["remaining"], 1200.0);
        assert_eq!(summary["benefit_categories"], 3);
        assert_eq!(summary["claims_count"], 2);
        assert_eq!(summary["total_billed"], 180.5);
        assert_eq!(summary["total_paid"], 110.0);
    }

    #[test]
    fn missing_accumulators_leave_the_summary_nullable() {
        let input = JobInput {
            subscriber_id: "A123".into(),
            date_of_birth: "1985-03-07".into(),
            first_name: String::new(),
            last_name: String::new(),
        };
        let summary = build_summary(
            &input,
            &Value::Null,
            &Value::Null,
            &Value::Null,
            &Value::Null,
        );
        assert_eq!(summary["patient_name"], "Member ID: A123");
        assert_eq!(summary["plan_name"], "Unknown");
        assert!(summary["deductible"].is_null());
        assert_eq!(summary["claims_count"], 0);
    }

    #[test]
    fn partial_fetch_tolerance_propagates_only_session_signals() {
        assert!(tolerate_partial("benefits", Ok(json!({"x": 1}))).is_ok());
        assert!(
            tolerate_partial("benefits", Err(ClassifiedError::Transient("503".into())))
                .is_ok_and(|v| v.is_null())
        );
        assert!(
            tolerate_partial("benefits", Err(ClassifiedError::AuthExpired("html".into()))).is_err()
        );
        assert!(
            tolerate_partial(
                "benefits",
                Err(ClassifiedError::RateLimited {
                    message: "429".into(),
                    retry_after: None,
                }),
            )
            .is_err()
        );
    }
}
